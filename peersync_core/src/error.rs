//! Error types for the synchronization core.

use peersync_env::EnvError;
use thiserror::Error;

/// Failures while decoding or encoding transport events.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Event name the core does not understand
    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    /// Event payload has the wrong shape
    #[error("Malformed '{event}' payload: {reason}")]
    MalformedPayload { event: String, reason: String },

    /// JSON (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ProtocolError {
    pub fn malformed(event: &str, reason: impl std::fmt::Display) -> Self {
        Self::MalformedPayload {
            event: event.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Umbrella error for session-level operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] EnvError),

    /// Invalid or unreadable configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
