//! Session-level error types
//!
//! `ConnectionError` is the user-visible error banner: it carries a
//! human-readable message and a `retryable` flag the UI uses to decide
//! whether to offer a retry action. `SessionError` covers rejected commands.

use crate::audio::AudioCaptureError;
use crate::persistence::PersistenceError;
use crate::session::ConnectionState;
use serde::Serialize;
use thiserror::Error;

/// User-visible, dismissible connection error
///
/// Cleared on the next successful state transition or on explicit dismissal.
/// Dismissing an error never discards transcript data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionError {
    /// Human-readable message for the error banner
    pub message: String,
    /// Whether the UI should offer a retry action
    pub retryable: bool,
}

impl ConnectionError {
    /// A transient failure worth retrying (network drop, timeout)
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A permanent failure (rejected handshake, missing device, protocol mismatch)
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Errors returned by session controller commands
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("operation not valid in state {state}")]
    InvalidState { state: ConnectionState },

    #[error("no active session")]
    NoSession,

    #[error("transcript is empty")]
    EmptyTranscript,

    #[error("audio capture failed: {0}")]
    Capture(#[from] AudioCaptureError),

    #[error("persistence failed: {0}")]
    Persistence(#[from] PersistenceError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_constructor() {
        let err = ConnectionError::retryable("connection dropped");
        assert!(err.retryable);
        assert_eq!(err.message, "connection dropped");
    }

    #[test]
    fn test_fatal_constructor() {
        let err = ConnectionError::fatal("handshake rejected");
        assert!(!err.retryable);
    }
}
