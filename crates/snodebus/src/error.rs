use std::time::Duration;

/// Errors that can occur while configuring or running a bridge.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The configuration is structurally valid JSON but not usable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An endpoint key is not 32 hex characters.
    #[error("invalid key for endpoint {name:?}: {reason}")]
    InvalidKey { name: String, reason: String },

    /// The configuration file could not be read.
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid JSON for [`BridgeConfig`](crate::BridgeConfig).
    #[error("config parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] snodebus_transport::TransportError),

    /// Session-level error.
    #[error("session error: {0}")]
    Session(#[from] snodebus_session::SessionError),

    /// The link did not come up in time.
    #[error("not connected after {0:?}")]
    Timeout(Duration),

    /// The bridge was closed.
    #[error("bridge closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, BridgeError>;
