//! Wire protocol for the transcription backend
//!
//! Defines the tagged JSON message format exchanged over the WebSocket.
//! Upstream: a handshake on open, then a continuous stream of base64 PCM16
//! audio frames. Downstream: segment events, the session assignment, and
//! error notices.

use serde::{Deserialize, Serialize};

/// Messages sent to the transcription backend
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub(crate) enum ClientMessage {
    /// Sent once per connection, identifies the requested language and,
    /// when reconnecting, the resume token of the logical session
    Handshake {
        language: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        resume_session_id: Option<String>,
    },
    /// One encoded audio frame (base64 PCM16, little-endian mono)
    AudioFrame { audio: String },
}

/// Per-word confidence for sub-segment highlighting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordInfo {
    pub word: String,
    pub confidence: f32,
}

/// Segment body shared by partial and final events
///
/// Timing and speaker fields are optional on the wire; missing timings
/// default to zero rather than rejecting the event.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct SegmentPayload {
    pub index: u64,
    #[serde(default)]
    pub speaker: Option<String>,
    #[serde(default)]
    pub start: Option<f64>,
    #[serde(default)]
    pub end: Option<f64>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub words: Option<Vec<WordInfo>>,
}

/// Events received from the transcription backend
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub(crate) enum ServerEvent {
    /// Live, still-settling transcription for a segment index
    PartialSegment(SegmentPayload),
    /// The backend's settled output for a segment index
    FinalSegment(SegmentPayload),
    /// Backend-assigned identifier for the logical session
    SessionAssigned { session_id: String },
    /// Backend-reported error; `retryable = false` forces a disconnect
    Error {
        message: String,
        #[serde(default)]
        retryable: bool,
    },
    /// Catch-all for message types added by newer backends
    #[serde(other)]
    Other,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_serialization() {
        let msg = ClientMessage::Handshake {
            language: "en".to_string(),
            resume_session_id: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"handshake\""));
        assert!(json.contains("\"language\":\"en\""));
        assert!(!json.contains("resume_session_id"));
    }

    #[test]
    fn test_handshake_with_resume_token() {
        let msg = ClientMessage::Handshake {
            language: "de".to_string(),
            resume_session_id: Some("sess-42".to_string()),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"resume_session_id\":\"sess-42\""));
    }

    #[test]
    fn test_audio_frame_serialization() {
        let msg = ClientMessage::AudioFrame {
            audio: "base64data".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"audio-frame\""));
        assert!(json.contains("base64data"));
    }

    #[test]
    fn test_final_segment_deserialization() {
        let json = r#"{
            "type": "final-segment",
            "index": 3,
            "speaker": "A",
            "start": 1.5,
            "end": 2.75,
            "text": "Hello world",
            "words": [{"word": "Hello", "confidence": 0.98}, {"word": "world", "confidence": 0.91}]
        }"#;
        let event: ServerEvent = serde_json::from_str(json).unwrap();
        match event {
            ServerEvent::FinalSegment(payload) => {
                assert_eq!(payload.index, 3);
                assert_eq!(payload.speaker.as_deref(), Some("A"));
                assert_eq!(payload.text, "Hello world");
                assert_eq!(payload.words.unwrap().len(), 2);
            }
            other => panic!("Wrong event type: {:?}", other),
        }
    }

    #[test]
    fn test_partial_segment_minimal_fields() {
        let json = r#"{"type": "partial-segment", "index": 0, "text": "Hel"}"#;
        let event: ServerEvent = serde_json::from_str(json).unwrap();
        match event {
            ServerEvent::PartialSegment(payload) => {
                assert_eq!(payload.index, 0);
                assert!(payload.start.is_none());
                assert!(payload.words.is_none());
            }
            other => panic!("Wrong event type: {:?}", other),
        }
    }

    #[test]
    fn test_session_assigned_deserialization() {
        let json = r#"{"type": "session-assigned", "session_id": "sess-7"}"#;
        let event: ServerEvent = serde_json::from_str(json).unwrap();
        match event {
            ServerEvent::SessionAssigned { session_id } => assert_eq!(session_id, "sess-7"),
            other => panic!("Wrong event type: {:?}", other),
        }
    }

    #[test]
    fn test_error_defaults_to_non_retryable() {
        let json = r#"{"type": "error", "message": "unsupported protocol version"}"#;
        let event: ServerEvent = serde_json::from_str(json).unwrap();
        match event {
            ServerEvent::Error { message, retryable } => {
                assert_eq!(message, "unsupported protocol version");
                assert!(!retryable);
            }
            other => panic!("Wrong event type: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_event_tolerated() {
        let json = r#"{"type": "diarization-hint", "data": 1}"#;
        let event: ServerEvent = serde_json::from_str(json).unwrap();
        assert!(matches!(event, ServerEvent::Other));
    }
}
