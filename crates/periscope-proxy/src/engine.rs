//! Interception engine boundary.
//!
//! The engine that accepts connections and parses HTTP is an external
//! collaborator; this module fixes the surface the rest of the layer talks
//! to. An engine exposes two hook slots, fired per request and per response,
//! and a start/stop pair. Hook invocations may run concurrently for
//! different exchanges, but a single exchange's request and response hooks
//! never overlap.

use std::net::SocketAddr;
use std::sync::Arc;

use periscope_core::Exchange;

use crate::error::EngineError;

/// Hook fired before the engine forwards a request.
///
/// The hook may set the exchange's routing target; the engine applies it
/// when forwarding.
pub type BeforeRequestHook = Arc<dyn Fn(&mut Exchange) + Send + Sync>;

/// Hook fired after the engine has observed a response.
pub type BeforeResponseHook = Arc<dyn Fn(&Exchange) + Send + Sync>;

/// An HTTP(S) interception engine.
///
/// Registration is slot-based: each register call is matched by one
/// unregister per lifecycle transition. `stop` must be idempotent and safe
/// to call on an engine that never started.
pub trait InterceptEngine: Send + Sync {
    /// Installs the before-request hook.
    fn register_before_request(&self, hook: BeforeRequestHook);

    /// Clears the before-request hook.
    fn unregister_before_request(&self);

    /// Installs the before-response hook.
    fn register_before_response(&self, hook: BeforeResponseHook);

    /// Clears the before-response hook.
    fn unregister_before_response(&self);

    /// Binds the engine to `addr` and begins intercepting.
    ///
    /// Bind failures surface here; the engine must be left inert on error.
    fn start(&self, addr: SocketAddr) -> std::result::Result<(), EngineError>;

    /// Stops the engine. Idempotent.
    fn stop(&self);
}

#[cfg(test)]
pub(crate) mod fake {
    //! Scripted engine for exercising the layer without sockets.

    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use parking_lot::RwLock;

    use super::*;

    #[derive(Default)]
    pub(crate) struct FakeEngine {
        request_hook: RwLock<Option<BeforeRequestHook>>,
        response_hook: RwLock<Option<BeforeResponseHook>>,
        pub(crate) fail_start: AtomicBool,
        pub(crate) started: AtomicBool,
        pub(crate) start_calls: AtomicUsize,
        pub(crate) stop_calls: AtomicUsize,
    }

    impl FakeEngine {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        /// Runs the registered request hook against `exchange`, as the real
        /// engine would on its worker thread.
        pub(crate) fn fire_request(&self, exchange: &mut Exchange) {
            if let Some(hook) = self.request_hook.read().clone() {
                hook(exchange);
            }
        }

        /// Runs the registered response hook with `exchange`.
        pub(crate) fn fire_response(&self, exchange: &Exchange) {
            if let Some(hook) = self.response_hook.read().clone() {
                hook(exchange);
            }
        }

        pub(crate) fn has_request_hook(&self) -> bool {
            self.request_hook.read().is_some()
        }

        pub(crate) fn has_response_hook(&self) -> bool {
            self.response_hook.read().is_some()
        }
    }

    impl InterceptEngine for FakeEngine {
        fn register_before_request(&self, hook: BeforeRequestHook) {
            *self.request_hook.write() = Some(hook);
        }

        fn unregister_before_request(&self) {
            *self.request_hook.write() = None;
        }

        fn register_before_response(&self, hook: BeforeResponseHook) {
            *self.response_hook.write() = Some(hook);
        }

        fn unregister_before_response(&self) {
            *self.response_hook.write() = None;
        }

        fn start(&self, addr: SocketAddr) -> std::result::Result<(), EngineError> {
            self.start_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_start.load(Ordering::SeqCst) {
                return Err(EngineError::Bind {
                    addr,
                    source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
                });
            }
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&self) {
            self.stop_calls.fetch_add(1, Ordering::SeqCst);
            self.started.store(false, Ordering::SeqCst);
        }
    }
}
