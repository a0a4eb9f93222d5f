//! Transport-level errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnvError {
    /// The link is down, either never connected or severed.
    #[error("Transport disconnected")]
    Disconnected,

    /// The other end of the channel went away.
    #[error("Send failed: {0}")]
    SendFailed(String),
}

impl EnvError {
    pub fn send_failed(msg: impl Into<String>) -> Self {
        Self::SendFailed(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        assert_eq!(EnvError::Disconnected.to_string(), "Transport disconnected");
        assert_eq!(EnvError::send_failed("relay closed").to_string(), "Send failed: relay closed");
    }
}
