//! Periodic autosave of the in-progress transcript
//!
//! A scheduler task runs only while recording. Each tick snapshots the full
//! segment sequence and hands it to the persistence collaborator. Autosave
//! is best-effort: a failed or timed-out write is logged and the next tick
//! retries with a fresh snapshot, without surfacing an error banner.

use super::{lock_document, lock_inner_arc, SessionEvent, SessionInner};
use crate::config::SessionConfig;
use crate::persistence::PersistenceClient;
use crate::transcript::TranscriptDocument;
use crate::transport::SessionTicket;
use chrono::Utc;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, warn};

/// Spawn the autosave scheduler for the current recording run
///
/// Returns the stop channel; sending (or dropping the sender) ends the
/// scheduler. No partial write is in flight after the task observes the
/// stop signal between ticks.
pub(super) fn spawn(
    config: Arc<SessionConfig>,
    inner: Arc<Mutex<SessionInner>>,
    document: Arc<Mutex<TranscriptDocument>>,
    ticket: Arc<SessionTicket>,
    persistence: Arc<dyn PersistenceClient>,
    event_tx: broadcast::Sender<SessionEvent>,
) -> mpsc::Sender<()> {
    let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        let mut timer = interval(config.autosave_interval());
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so the first save
        // happens one full interval into the recording.
        timer.tick().await;

        loop {
            tokio::select! {
                _ = stop_rx.recv() => {
                    debug!("Autosave scheduler stopped");
                    break;
                }
                _ = timer.tick() => {
                    save_snapshot(&config, &inner, &document, &ticket, &*persistence, &event_tx)
                        .await;
                }
            }
        }
    });

    stop_tx
}

/// Persist one snapshot of the segment sequence
///
/// Skips silently when no session id has been assigned yet or the
/// transcript is empty.
async fn save_snapshot(
    config: &SessionConfig,
    inner: &Arc<Mutex<SessionInner>>,
    document: &Arc<Mutex<TranscriptDocument>>,
    ticket: &SessionTicket,
    persistence: &dyn PersistenceClient,
    event_tx: &broadcast::Sender<SessionEvent>,
) {
    let Some(session_id) = ticket.session_id() else {
        debug!("Autosave skipped: no session id assigned yet");
        return;
    };

    let segments = lock_document(document).snapshot();
    if segments.is_empty() {
        debug!("Autosave skipped: transcript is empty");
        return;
    }

    match timeout(
        config.autosave_timeout(),
        persistence.save_progress(&session_id, &segments),
    )
    .await
    {
        Ok(Ok(())) => {
            let now = Utc::now();
            lock_inner_arc(inner).last_autosave = Some(now);
            debug!("Autosave completed ({} segments)", segments.len());
            let _ = event_tx.send(SessionEvent::AutosaveCompleted(now));
        }
        Ok(Err(e)) => {
            warn!("Autosave failed, will retry next interval: {}", e);
        }
        Err(_) => {
            warn!(
                "Autosave timed out after {}s, will retry next interval",
                config.autosave_timeout_secs
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SegmentPayload;
    use crate::session::testing::MockPersistence;
    use std::sync::atomic::Ordering;

    struct Fixture {
        config: SessionConfig,
        inner: Arc<Mutex<SessionInner>>,
        document: Arc<Mutex<TranscriptDocument>>,
        ticket: SessionTicket,
        event_tx: broadcast::Sender<SessionEvent>,
    }

    fn fixture() -> Fixture {
        let (event_tx, _) = broadcast::channel(16);
        Fixture {
            config: SessionConfig::default(),
            inner: Arc::new(Mutex::new(SessionInner::new())),
            document: Arc::new(Mutex::new(TranscriptDocument::new())),
            ticket: SessionTicket::new("en"),
            event_tx,
        }
    }

    fn add_segment(document: &Arc<Mutex<TranscriptDocument>>, text: &str) {
        lock_document(document).apply_event(
            &SegmentPayload {
                index: 0,
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
    async fn test_skips_without_session_id() {
        let f = fixture();
        add_segment(&f.document, "Hello");
        let persistence = MockPersistence::ok("rec-1");

        save_snapshot(
            &f.config,
            &f.inner,
            &f.document,
            &f.ticket,
            &persistence,
            &f.event_tx,
        )
        .await;

        assert_eq!(persistence.progress_calls.load(Ordering::SeqCst), 0);
        assert!(lock_inner_arc(&f.inner).last_autosave.is_none());
    }

    #[tokio::test]
    async fn test_skips_empty_transcript() {
        let f = fixture();
        f.ticket.set_session_id("sess-1");
        let persistence = MockPersistence::ok("rec-1");

        save_snapshot(
            &f.config,
            &f.inner,
            &f.document,
            &f.ticket,
            &persistence,
            &f.event_tx,
        )
        .await;

        assert_eq!(persistence.progress_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_success_records_timestamp_and_emits() {
        let f = fixture();
        f.ticket.set_session_id("sess-1");
        add_segment(&f.document, "Hello world");
        let persistence = MockPersistence::ok("rec-1");
        let mut events = f.event_tx.subscribe();

        save_snapshot(
            &f.config,
            &f.inner,
            &f.document,
            &f.ticket,
            &persistence,
            &f.event_tx,
        )
        .await;

        assert_eq!(persistence.progress_calls.load(Ordering::SeqCst), 1);
        assert!(lock_inner_arc(&f.inner).last_autosave.is_some());
        assert!(matches!(
            events.try_recv(),
            Ok(SessionEvent::AutosaveCompleted(_))
        ));
    }

    #[tokio::test]
    async fn test_failure_is_silent_and_retried_next_tick() {
        let f = fixture();
        f.ticket.set_session_id("sess-1");
        add_segment(&f.document, "Hello world");
        let persistence = MockPersistence::failing();
        let mut events = f.event_tx.subscribe();

        save_snapshot(
            &f.config,
            &f.inner,
            &f.document,
            &f.ticket,
            &persistence,
            &f.event_tx,
        )
        .await;

        assert_eq!(persistence.progress_calls.load(Ordering::SeqCst), 1);
        assert!(lock_inner_arc(&f.inner).last_autosave.is_none());
        // No error banner and no event for a failed autosave.
        assert!(events.try_recv().is_err());

        // The scheduler retries with a fresh snapshot on the next tick.
        persistence.fail.store(false, Ordering::SeqCst);
        save_snapshot(
            &f.config,
            &f.inner,
            &f.document,
            &f.ticket,
            &persistence,
            &f.event_tx,
        )
        .await;
        assert_eq!(persistence.progress_calls.load(Ordering::SeqCst), 2);
        assert!(lock_inner_arc(&f.inner).last_autosave.is_some());
    }
}
