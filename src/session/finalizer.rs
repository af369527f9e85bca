//! Session finalization: convert the live session into a durable recording

use super::{lock_document, teardown, SessionController, SessionEvent};
use crate::error::{ConnectionError, SessionError};
use crate::persistence::PersistenceError;
use tokio::time::timeout;
use tracing::{info, warn};

impl SessionController {
    /// Finalize the session as a durable recording
    ///
    /// Submits the final segment sequence (including local edits) with the
    /// given title. `save_audio` asks the backend to retain its streamed
    /// copy of the session audio. On success the session is disconnected,
    /// the transcript is cleared, and the new recording id is returned. On
    /// failure or timeout nothing is torn down: the segments stay intact
    /// and a retryable error banner is raised so the user can retry.
    ///
    /// Rejected while recording; stop first. An empty transcript or a
    /// session that never got an id from the backend cannot be saved.
    pub async fn save(&self, title: &str, save_audio: bool) -> Result<String, SessionError> {
        let (session_id, segments) = {
            let inner = self.lock_inner();
            if inner.state.is_recording() {
                warn!("save rejected while recording");
                return Err(SessionError::InvalidState { state: inner.state });
            }
            let Some(session_id) = self.ticket.session_id() else {
                warn!("save rejected: no session id");
                return Err(SessionError::NoSession);
            };
            let segments = lock_document(&self.document).snapshot();
            if segments.is_empty() {
                warn!("save rejected: transcript is empty");
                return Err(SessionError::EmptyTranscript);
            }
            (session_id, segments)
        };

        info!(
            "Finalizing session {} ({} segments, save_audio: {})",
            session_id,
            segments.len(),
            save_audio
        );

        let result = timeout(
            self.config.finalize_timeout(),
            self.persistence
                .save_session(&session_id, title, &segments, save_audio),
        )
        .await;

        match result {
            Ok(Ok(recording_id)) => {
                info!("Session saved as recording {}", recording_id);
                teardown(&self.inner, &self.ticket, None, &self.event_tx);
                {
                    let mut inner = self.lock_inner();
                    inner.recorded = std::time::Duration::ZERO;
                    inner.recording_started_at = None;
                }
                lock_document(&self.document).clear();
                self.emit(SessionEvent::SegmentsUpdated);
                Ok(recording_id)
            }
            Ok(Err(e)) => {
                warn!("Finalize failed, transcript retained: {}", e);
                self.raise_save_error(format!("Could not save the session: {}", e));
                Err(SessionError::Persistence(e))
            }
            Err(_) => {
                warn!("Finalize timed out, transcript retained");
                self.raise_save_error("Saving the session timed out".to_string());
                Err(SessionError::Persistence(PersistenceError::Timeout))
            }
        }
    }

    fn raise_save_error(&self, message: String) {
        let error = ConnectionError::retryable(message);
        self.lock_inner().error = Some(error.clone());
        self.emit(SessionEvent::ErrorChanged(Some(error)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::protocol::SegmentPayload;
    use crate::session::testing::MockPersistence;
    use crate::session::ConnectionState;
    use std::sync::Arc;

    fn controller_with(persistence: MockPersistence) -> SessionController {
        SessionController::new(SessionConfig::default(), Arc::new(persistence))
    }

    fn add_segment(controller: &SessionController, index: u64, text: &str) {
        lock_document(&controller.document).apply_event(
            &SegmentPayload {
                index,
                speaker: None,
                start: None,
                end: None,
                text: text.to_string(),
                words: None,
            },
            true,
        );
    }

    #[tokio::test]
    async fn test_save_returns_recording_id_and_resets_session() {
        let controller = controller_with(MockPersistence::ok("rec-42"));
        controller.lock_inner().state = ConnectionState::Connected;
        controller.ticket.set_session_id("sess-1");
        add_segment(&controller, 0, "Hello world");

        let recording_id = controller.save("Standup notes", true).await.unwrap();

        assert_eq!(recording_id, "rec-42");
        let snapshot = controller.snapshot();
        assert_eq!(snapshot.connection_state, ConnectionState::Disconnected);
        assert!(snapshot.session_id.is_none());
        assert!(snapshot.segments.is_empty());
        assert_eq!(snapshot.duration_secs, 0);
        assert!(snapshot.error.is_none());
    }

    #[tokio::test]
    async fn test_save_rejected_while_recording() {
        let controller = controller_with(MockPersistence::ok("rec-1"));
        controller.lock_inner().state = ConnectionState::Recording;
        controller.ticket.set_session_id("sess-1");
        add_segment(&controller, 0, "Hello");

        let result = controller.save("Title", false).await;

        assert!(matches!(
            result,
            Err(SessionError::InvalidState {
                state: ConnectionState::Recording
            })
        ));
        assert_eq!(controller.snapshot().segments.len(), 1);
    }

    #[tokio::test]
    async fn test_save_rejected_without_session_id() {
        let controller = controller_with(MockPersistence::ok("rec-1"));
        controller.lock_inner().state = ConnectionState::Connected;
        add_segment(&controller, 0, "Hello");

        assert!(matches!(
            controller.save("Title", false).await,
            Err(SessionError::NoSession)
        ));
    }

    #[tokio::test]
    async fn test_save_rejected_with_empty_transcript() {
        let controller = controller_with(MockPersistence::ok("rec-1"));
        controller.lock_inner().state = ConnectionState::Connected;
        controller.ticket.set_session_id("sess-1");

        assert!(matches!(
            controller.save("Title", false).await,
            Err(SessionError::EmptyTranscript)
        ));
    }

    #[tokio::test]
    async fn test_save_failure_keeps_segments_and_raises_retryable_banner() {
        let controller = controller_with(MockPersistence::failing());
        controller.lock_inner().state = ConnectionState::Connected;
        controller.ticket.set_session_id("sess-1");
        add_segment(&controller, 0, "Hello world");

        let result = controller.save("Title", true).await;

        assert!(matches!(result, Err(SessionError::Persistence(_))));
        let snapshot = controller.snapshot();
        // Nothing torn down; the user can retry the save.
        assert_eq!(snapshot.connection_state, ConnectionState::Connected);
        assert_eq!(snapshot.session_id.as_deref(), Some("sess-1"));
        assert_eq!(snapshot.segments.len(), 1);
        let error = snapshot.error.unwrap();
        assert!(error.retryable);
    }

    #[tokio::test]
    async fn test_save_includes_local_edits() {
        let controller = controller_with(MockPersistence::ok("rec-7"));
        controller.lock_inner().state = ConnectionState::Connected;
        controller.ticket.set_session_id("sess-1");
        add_segment(&controller, 0, "Hello world");
        controller.edit_text(0, "Hello there");

        // The snapshot submitted to persistence carries the edited text.
        let segments = lock_document(&controller.document).snapshot();
        assert_eq!(segments[0].text, "Hello there");
        assert!(segments[0].edited);

        controller.save("Title", false).await.unwrap();
    }
}
