//! Error types for the interception layer.

use std::net::SocketAddr;

use thiserror::Error;

use crate::lifecycle::ProxyState;

/// Interception layer error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The underlying engine failed to start.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// A lifecycle transition was requested mid-transition.
    #[error("proxy is {0}, cannot start")]
    Busy(ProxyState),
}

/// Underlying engine error type.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The listener address could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address the engine tried to bind.
        addr: SocketAddr,
        /// Underlying bind error.
        source: std::io::Error,
    },

    /// The engine could not be assembled.
    #[error("engine setup failed: {0}")]
    Setup(String),

    /// Upstream forwarding failed.
    #[error("upstream forward failed: {0}")]
    Upstream(String),
}

/// System proxy registration error type.
#[derive(Debug, Error)]
pub enum SystemProxyError {
    /// The platform tool reported a failure.
    #[error("system proxy command failed: {0}")]
    CommandFailed(String),

    /// No system proxy mechanism exists on this platform.
    #[error("system proxy registration is not supported on this platform")]
    Unsupported,
}

/// Result type for interception layer operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
