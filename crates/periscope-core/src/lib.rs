//! Periscope Core - Exchange model, session classification, and upstream routing.
//!
//! This crate holds the pure decision logic of the interception layer: given
//! an intercepted exchange, decide whether it carries a game API payload,
//! whether the connection is secured, and whether the request should be
//! re-routed through a user-configured upstream proxy. Nothing here performs
//! I/O; the proxy crate feeds exchanges in from the engine boundary.

pub mod classifier;
pub mod exchange;
pub mod router;

pub use classifier::{is_api_call, is_secure, API_CONTENT_TYPE, API_PATH_PREFIX};
pub use exchange::{Exchange, UpstreamTarget};
pub use router::{route, SettingsHandle, UpstreamSettings};
