//! Periscope Proxy - traffic interception between the game client and the
//! game server.
//!
//! This crate sits on a local HTTP(S) interception engine, observes every
//! exchange the embedded browser makes, classifies the ones that carry game
//! API payloads, and fans them out to any number of downstream consumers.
//! A per-request routing hook can additionally redirect traffic through a
//! user-configured upstream proxy.
//!
//! ## Architecture
//!
//! ```text
//! Client Request → Engine → before-request hook → route via upstream?
//!                                                       │
//!                                     ┌─────────────────┴──────────┐
//!                                     │ No                         │ Yes
//!                                     ▼                            ▼
//!                               Forward direct           Forward via gateway
//!
//! Engine Response → before-response hook → ExchangeBroadcaster
//!                                                │
//!                                 ┌──────────────┴──────────────┐
//!                                 ▼                             ▼
//!                          all_exchanges()              api_exchanges()
//!                          (every response)          (/kcsapi + text/plain)
//! ```
//!
//! [`ProxyLifecycle`] owns the whole arrangement: it binds the engine on
//! loopback, installs both hooks, registers the system-wide proxy pointer,
//! and connects the broadcast streams, tearing everything down in reverse
//! on `stop`.

mod broadcast;
mod engine;
mod error;
mod lifecycle;
mod mitm;
pub mod system_proxy;

pub use broadcast::{
    BroadcastChannel, DiagnosticSink, ExchangeBroadcaster, TracingSink, BROADCAST_CAPACITY,
};
pub use engine::{BeforeRequestHook, BeforeResponseHook, InterceptEngine};
pub use error::{EngineError, ProxyError, Result, SystemProxyError};
pub use lifecycle::{ProxyLifecycle, ProxyState};
pub use mitm::MitmEngine;
pub use system_proxy::{NoopSystemProxy, PlatformSystemProxy, SystemProxyConfigurator};

/// Default listener port.
pub const DEFAULT_PROXY_PORT: u16 = 37564;
