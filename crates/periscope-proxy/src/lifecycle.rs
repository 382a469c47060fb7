//! Proxy lifecycle control.
//!
//! Owns the interception engine, the broadcast streams, and the system
//! proxy registration as one unit: `start` brings them up in a fixed order
//! and `stop` tears them down in reverse. Both hooks run on the engine's
//! worker threads and are panic-guarded there; nothing that goes wrong
//! inside routing or broadcasting may abort the client's in-flight request.

use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use periscope_core::{route, Exchange, SettingsHandle};

use crate::broadcast::ExchangeBroadcaster;
use crate::engine::InterceptEngine;
use crate::error::{ProxyError, Result};
use crate::system_proxy::{PlatformSystemProxy, SystemProxyConfigurator};

/// Lifecycle state of the interception layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyState {
    /// Nothing is running.
    #[default]
    Stopped,
    /// `start` is bringing the layer up.
    Starting,
    /// The layer is intercepting traffic.
    Running,
    /// `stop` is tearing the layer down.
    Stopping,
}

impl ProxyState {
    /// Returns the state as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }
}

impl std::fmt::Display for ProxyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Starts and stops the interception layer as one atomic unit.
///
/// Thread-safe and clonable; clones share the same lifecycle.
#[derive(Clone)]
pub struct ProxyLifecycle {
    engine: Arc<dyn InterceptEngine>,
    broadcaster: Arc<ExchangeBroadcaster>,
    settings: SettingsHandle,
    system_proxy: Arc<dyn SystemProxyConfigurator>,
    state: Arc<Mutex<ProxyState>>,
}

impl std::fmt::Debug for ProxyLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyLifecycle")
            .field("state", &self.state())
            .field("broadcaster", &self.broadcaster)
            .finish()
    }
}

impl ProxyLifecycle {
    /// Creates a lifecycle around the given engine, registering the system
    /// proxy through the current platform's mechanism.
    pub fn new(engine: Arc<dyn InterceptEngine>) -> Self {
        Self::with_system_proxy(engine, Arc::new(PlatformSystemProxy))
    }

    /// Creates a lifecycle with an explicit system proxy configurator.
    pub fn with_system_proxy(
        engine: Arc<dyn InterceptEngine>,
        system_proxy: Arc<dyn SystemProxyConfigurator>,
    ) -> Self {
        Self {
            engine,
            broadcaster: Arc::new(ExchangeBroadcaster::new()),
            settings: SettingsHandle::new(),
            system_proxy,
            state: Arc::new(Mutex::new(ProxyState::Stopped)),
        }
    }

    /// Replaces the broadcaster, e.g. to install a diagnostic sink.
    ///
    /// Only meaningful before the first `start`.
    pub fn with_broadcaster(mut self, broadcaster: ExchangeBroadcaster) -> Self {
        self.broadcaster = Arc::new(broadcaster);
        self
    }

    /// Returns the broadcast streams.
    pub fn broadcaster(&self) -> &ExchangeBroadcaster {
        &self.broadcaster
    }

    /// Returns the handle the configuration layer writes routing settings to.
    pub fn settings(&self) -> &SettingsHandle {
        &self.settings
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> ProxyState {
        *self.state.lock()
    }

    /// Returns true while the layer is intercepting traffic.
    pub fn is_running(&self) -> bool {
        self.state() == ProxyState::Running
    }

    /// Brings the interception layer up on `127.0.0.1:port`.
    ///
    /// Order: bind the engine, install both hooks, register the system
    /// proxy pointer (non-fatal on failure), connect the broadcast streams
    /// raw-before-API. A second `start` while running is a no-op; an engine
    /// bind failure leaves the layer stopped and is surfaced to the caller.
    pub fn start(&self, port: u16) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                ProxyState::Running => return Ok(()),
                ProxyState::Starting | ProxyState::Stopping => {
                    return Err(ProxyError::Busy(*state))
                }
                ProxyState::Stopped => *state = ProxyState::Starting,
            }
        }

        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        if let Err(e) = self.engine.start(addr) {
            *self.state.lock() = ProxyState::Stopped;
            return Err(ProxyError::Engine(e));
        }

        let settings = self.settings.clone();
        self.engine.register_before_request(Arc::new(move |exchange: &mut Exchange| {
            let decision = catch_unwind(AssertUnwindSafe(|| {
                route(exchange, settings.snapshot().as_ref())
            }));
            match decision {
                Ok(Some(target)) => exchange.set_routing_target(target),
                Ok(None) => {}
                Err(_) => {
                    tracing::error!("routing hook panicked; request proceeds unrouted");
                }
            }
        }));

        let broadcaster = self.broadcaster.clone();
        self.engine.register_before_response(Arc::new(move |exchange: &Exchange| {
            let exchange = exchange.clone();
            let published =
                catch_unwind(AssertUnwindSafe(|| broadcaster.publish(exchange)));
            if published.is_err() {
                tracing::error!("broadcast hook panicked; exchange dropped");
            }
        }));

        let address = format!("127.0.0.1:{port}");
        if let Err(e) = self.system_proxy.set_system_proxy(&address) {
            tracing::warn!(error = %e, "system proxy registration failed; continuing without it");
        }

        self.broadcaster.connect();

        *self.state.lock() = ProxyState::Running;
        tracing::info!(%addr, "interception layer running");
        Ok(())
    }

    /// Tears the interception layer down.
    ///
    /// Inverse of `start` in reverse order: disconnect the broadcast
    /// streams, clear both hooks, stop the engine. Idempotent; safe when
    /// `start` never ran or failed partway.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            if *state == ProxyState::Stopped {
                return;
            }
            *state = ProxyState::Stopping;
        }

        self.broadcaster.disconnect();
        self.engine.unregister_before_request();
        self.engine.unregister_before_response();
        self.engine.stop();

        *self.state.lock() = ProxyState::Stopped;
        tracing::info!("interception layer stopped");
    }
}
