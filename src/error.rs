//! Crate-level error type.
//!
//! Every fallible operation in the bridge returns [`BridgeError`]. Variants map
//! one-to-one onto the failure classes the orchestrator reports upward; the
//! [`BridgeError::kind`] code is what ends up in logs and status payloads.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    /// A transport could not be established.
    #[error("connection to {target} failed: {detail}")]
    Connect { target: String, detail: String },

    /// An attempt exceeded its time window.
    #[error("{operation} timed out after {after_ms} ms")]
    Timeout { operation: String, after_ms: u64 },

    /// A liveness probe answered, but not with a healthy response.
    #[error("health check failed: {0}")]
    HealthCheck(String),

    /// An operation was attempted while an endpoint is not connected and healthy.
    #[error("{0}")]
    Precondition(String),

    /// A named entity is absent on the producer side.
    #[error("{0}")]
    NotFound(String),

    /// Reserved: unsupported property shapes are currently dropped, not reported.
    #[error("translation error: {0}")]
    Translation(String),

    /// Unknown or malformed envelope, or an error reply from the peer.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid or unreadable configuration.
    #[error("config error: {0}")]
    Config(String),

    /// The relay listener could not be bound.
    #[error("failed to bind relay on {addr}: {detail}")]
    Bind { addr: String, detail: String },

    #[error("bridge is already running")]
    AlreadyRunning,

    #[error("bridge is not running")]
    NotRunning,

    #[error("I/O error: {0}")]
    Io(String),
}

impl BridgeError {
    /// Stable short code for this error class.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::Connect { .. } => "connect",
            BridgeError::Timeout { .. } => "timeout",
            BridgeError::HealthCheck(_) => "health_check",
            BridgeError::Precondition(_) => "precondition",
            BridgeError::NotFound(_) => "not_found",
            BridgeError::Translation(_) => "translation",
            BridgeError::Protocol(_) => "protocol",
            BridgeError::Config(_) => "config",
            BridgeError::Bind { .. } => "bind",
            BridgeError::AlreadyRunning => "already_running",
            BridgeError::NotRunning => "not_running",
            BridgeError::Io(_) => "io",
        }
    }

    /// `true` for the only process-level fatal condition.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BridgeError::Bind { .. })
    }

    pub(crate) fn connect(target: impl Into<String>, detail: impl ToString) -> Self {
        BridgeError::Connect {
            target: target.into(),
            detail: detail.to_string(),
        }
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(e: std::io::Error) -> Self {
        BridgeError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Protocol(e.to_string())
    }
}
