//! Connection lifecycle states
//!
//! The lifecycle is an explicit finite-state enum; every command validates
//! against the current state instead of consulting scattered flags.

use serde::Serialize;
use std::fmt;

/// Connection/recording lifecycle state of the live session
///
/// `disconnected -> connecting -> connected -> recording`, with
/// `recording -> connected` on stop and any state `-> disconnected` on
/// explicit disconnect or fatal error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Recording,
}

impl ConnectionState {
    pub(crate) fn can_connect(self) -> bool {
        matches!(self, ConnectionState::Disconnected)
    }

    pub(crate) fn can_start_recording(self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub(crate) fn can_stop_recording(self) -> bool {
        matches!(self, ConnectionState::Recording)
    }

    pub(crate) fn can_clear_transcript(self) -> bool {
        !matches!(self, ConnectionState::Recording)
    }

    pub fn is_recording(self) -> bool {
        matches!(self, ConnectionState::Recording)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Recording => "recording",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_only_from_disconnected() {
        assert!(ConnectionState::Disconnected.can_connect());
        assert!(!ConnectionState::Connecting.can_connect());
        assert!(!ConnectionState::Connected.can_connect());
        assert!(!ConnectionState::Recording.can_connect());
    }

    #[test]
    fn test_recording_transitions() {
        assert!(ConnectionState::Connected.can_start_recording());
        assert!(!ConnectionState::Recording.can_start_recording());
        assert!(ConnectionState::Recording.can_stop_recording());
        assert!(!ConnectionState::Connected.can_stop_recording());
    }

    #[test]
    fn test_clear_blocked_while_recording() {
        assert!(ConnectionState::Disconnected.can_clear_transcript());
        assert!(ConnectionState::Connected.can_clear_transcript());
        assert!(!ConnectionState::Recording.can_clear_transcript());
    }
}
