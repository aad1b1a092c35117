//! Error types for chainview

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ViewError {
    /// Malformed command or arguments
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Unknown method: {0}")]
    UnknownMethod(String),
    /// Duplicate registration id or conflicting address set
    #[error("Registration conflict: {0}")]
    RegistrationConflict(String),
    #[error("Callback channel expired")]
    ChannelExpired,
    /// The session's initial scan failed; carried by the readiness gate
    #[error("Scan failure: {0}")]
    ScanFailure(String),
    #[error("Server is shutting down")]
    ShuttingDown,
    #[error("Unknown BDV id: {0}")]
    SessionNotFound(String),
    #[error("Store error: {0}")]
    Store(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Failed to spawn thread: {0}")]
    ThreadSpawn(String),
}

impl ViewError {
    /// Stable identifier reported to clients alongside the message.
    pub fn kind(&self) -> &'static str {
        match self {
            ViewError::Protocol(_) => "protocol",
            ViewError::UnknownMethod(_) => "unknown_method",
            ViewError::RegistrationConflict(_) => "registration_conflict",
            ViewError::ChannelExpired => "channel_expired",
            ViewError::ScanFailure(_) => "scan_failure",
            ViewError::ShuttingDown => "shutting_down",
            ViewError::SessionNotFound(_) => "session_not_found",
            ViewError::Store(_) => "store",
            ViewError::Serialization(_) => "serialization",
            ViewError::Config(_) => "config",
            ViewError::ThreadSpawn(_) => "thread_spawn",
        }
    }
}

impl From<serde_json::Error> for ViewError {
    fn from(err: serde_json::Error) -> Self {
        ViewError::Serialization(err.to_string())
    }
}
