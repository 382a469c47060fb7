//! Upstream routing policy.
//!
//! Decides, per request, whether traffic should be re-routed through a
//! user-configured upstream proxy. Settings are owned by the configuration
//! layer and handed to the proxy as whole-record snapshots through a
//! [`SettingsHandle`]; the decision itself is a pure function invoked on the
//! engine's before-request hook, so it must not block or fail.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::classifier::is_secure;
use crate::exchange::{Exchange, UpstreamTarget};

/// User-configured upstream proxy settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamSettings {
    /// Route traffic through the upstream proxy at all.
    pub enabled: bool,
    /// Also route secured (SSL) sessions through the upstream proxy.
    pub enabled_on_secure: bool,
    /// Upstream proxy host; routing is skipped while this is empty.
    pub host: String,
    /// Upstream proxy port.
    pub port: u16,
}

/// Decides whether an exchange should be re-routed upstream.
///
/// Returns the target to apply to the exchange's routing-target field, or
/// `None` when the request should proceed untouched: settings absent,
/// routing disabled, host empty, or a secured session with
/// `enabled_on_secure` off.
pub fn route(exchange: &Exchange, settings: Option<&UpstreamSettings>) -> Option<UpstreamTarget> {
    let settings = settings?;

    let use_gateway = settings.enabled && !settings.host.is_empty();
    if !use_gateway || (is_secure(exchange) && !settings.enabled_on_secure) {
        return None;
    }

    Some(UpstreamTarget::new(settings.host.clone(), settings.port))
}

/// Shared cell holding the current upstream settings.
///
/// The configuration layer writes with [`SettingsHandle::replace`]; the
/// proxy's worker threads read with [`SettingsHandle::snapshot`]. Updates
/// swap the whole record under one lock, so a reader never observes a
/// half-applied settings change.
///
/// Thread-safe and clonable; clones share the same cell.
#[derive(Debug, Clone, Default)]
pub struct SettingsHandle {
    inner: Arc<RwLock<Option<UpstreamSettings>>>,
}

impl SettingsHandle {
    /// Creates a handle with no settings applied.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a handle pre-populated with the given settings.
    pub fn with_settings(settings: UpstreamSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Some(settings))),
        }
    }

    /// Replaces the settings record in one atomic swap.
    ///
    /// Passing `None` turns upstream routing off entirely.
    pub fn replace(&self, settings: Option<UpstreamSettings>) {
        let mut guard = self.inner.write().unwrap();
        *guard = settings;
        tracing::debug!(configured = guard.is_some(), "upstream settings replaced");
    }

    /// Returns a snapshot of the current settings.
    pub fn snapshot(&self) -> Option<UpstreamSettings> {
        self.inner.read().unwrap().clone()
    }
}
