//! Live transcription session controller
//!
//! Orchestrates the audio capture pipeline, streaming transport, transcript
//! document, autosave scheduler, and finalizer behind one coherent state.
//! Exactly one client-held live session exists at a time; the embedding
//! application observes it through [`SessionController::snapshot`] and the
//! [`SessionController::subscribe`] event stream and drives it through the
//! command methods.
//!
//! Commands called from an invalid state are defensive no-ops: logged and
//! rejected, never a panic. The UI gates button availability, the state
//! machine enforces it anyway.

mod autosave;
mod finalizer;
mod state;

pub use state::ConnectionState;

use crate::audio::{self, CaptureHandle};
use crate::config::SessionConfig;
use crate::error::{ConnectionError, SessionError};
use crate::persistence::PersistenceClient;
use crate::transcript::{TranscriptDocument, TranscriptSegment};
use crate::transport::{self, SessionTicket, TransportEvent, TransportHandle};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Notifications for the embedding application
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    /// The segment sequence changed (server event or local edit)
    SegmentsUpdated,
    SessionAssigned(String),
    ErrorChanged(Option<ConnectionError>),
    AutosaveCompleted(DateTime<Utc>),
}

/// Observable state exposed to the UI
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub connection_state: ConnectionState,
    pub session_id: Option<String>,
    pub segments: Vec<TranscriptSegment>,
    /// Elapsed recording time in seconds, frozen while not recording
    pub duration_secs: u64,
    pub error: Option<ConnectionError>,
    pub last_autosave: Option<DateTime<Utc>>,
    /// Derived concatenation of all segment texts
    pub full_text: String,
    pub word_count: usize,
}

/// Mutable session state behind the controller's mutex
struct SessionInner {
    state: ConnectionState,
    /// Language fixed at start_recording, immutable mid-session
    language: Option<String>,
    recording_started_at: Option<Instant>,
    /// Recording time accumulated before the current clock run
    recorded: Duration,
    error: Option<ConnectionError>,
    last_autosave: Option<DateTime<Utc>>,
    capture: Option<CaptureHandle>,
    autosave_stop: Option<mpsc::Sender<()>>,
    transport: Option<TransportHandle>,
}

impl SessionInner {
    fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            language: None,
            recording_started_at: None,
            recorded: Duration::ZERO,
            error: None,
            last_autosave: None,
            capture: None,
            autosave_stop: None,
            transport: None,
        }
    }

    fn duration_secs(&self) -> u64 {
        let active = self
            .recording_started_at
            .map(|started| started.elapsed())
            .unwrap_or(Duration::ZERO);
        (self.recorded + active).as_secs()
    }

    /// Freeze the duration clock, keeping the accumulated total
    fn freeze_duration(&mut self) {
        if let Some(started) = self.recording_started_at.take() {
            self.recorded += started.elapsed();
        }
    }
}

/// The live transcription session controller
pub struct SessionController {
    config: Arc<SessionConfig>,
    inner: Arc<Mutex<SessionInner>>,
    document: Arc<Mutex<TranscriptDocument>>,
    ticket: Arc<SessionTicket>,
    persistence: Arc<dyn PersistenceClient>,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl SessionController {
    /// Create a controller in the disconnected ground state
    ///
    /// Must be created inside a tokio runtime; commands spawn tasks.
    pub fn new(config: SessionConfig, persistence: Arc<dyn PersistenceClient>) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        let ticket = Arc::new(SessionTicket::new(&config.language));
        Self {
            config: Arc::new(config),
            inner: Arc::new(Mutex::new(SessionInner::new())),
            document: Arc::new(Mutex::new(TranscriptDocument::new())),
            ticket,
            persistence,
            event_tx,
        }
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Read a consistent snapshot of the observable state
    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = self.lock_inner();
        let document = lock_document(&self.document);
        SessionSnapshot {
            connection_state: inner.state,
            session_id: self.ticket.session_id(),
            segments: document.snapshot(),
            duration_secs: inner.duration_secs(),
            error: inner.error.clone(),
            last_autosave: inner.last_autosave,
            full_text: document.full_text(),
            word_count: document.word_count(),
        }
    }

    /// Open the streaming transport and move to `connecting`
    ///
    /// Valid only from `disconnected`; a no-op otherwise. The transition to
    /// `connected` happens when the transport signals ready.
    pub fn connect(&self) {
        {
            let mut inner = self.lock_inner();
            if !inner.state.can_connect() {
                warn!("connect ignored in state {}", inner.state);
                return;
            }
            inner.state = ConnectionState::Connecting;
        }
        self.emit(SessionEvent::StateChanged(ConnectionState::Connecting));

        let (transport_tx, transport_rx) = mpsc::channel(256);
        let handle = transport::spawn(self.config.clone(), self.ticket.clone(), transport_tx);
        self.lock_inner().transport = Some(handle);
        self.spawn_event_pump(transport_rx);
    }

    /// Close the session from any state
    ///
    /// Stops capture if active, cancels any reconnect backoff, clears the
    /// session id, and moves to `disconnected`. The segment sequence is
    /// retained; use [`clear_transcript`](Self::clear_transcript) to drop it.
    pub fn disconnect(&self) {
        info!("Disconnecting session");
        teardown(&self.inner, &self.ticket, None, &self.event_tx);
    }

    /// Fix the language and start recording
    ///
    /// Valid only from `connected`. Starts the capture pipeline and the
    /// autosave scheduler, resets the duration clock, and moves to
    /// `recording`. A capture failure (device missing or denied) is a
    /// non-retryable error and the state does not change.
    pub fn start_recording(&self, language: &str) -> Result<(), SessionError> {
        let mut inner = self.lock_inner();
        if !inner.state.can_start_recording() {
            warn!("start_recording rejected in state {}", inner.state);
            return Err(SessionError::InvalidState { state: inner.state });
        }

        self.ticket.set_language(language);

        let (capture, mut frame_rx) = match audio::start_capture() {
            Ok(pair) => pair,
            Err(e) => {
                let error = ConnectionError::fatal(format!("Microphone unavailable: {}", e));
                inner.error = Some(error.clone());
                drop(inner);
                self.emit(SessionEvent::ErrorChanged(Some(error)));
                return Err(SessionError::Capture(e));
            }
        };

        let Some(transport) = inner.transport.as_ref() else {
            // Connected without a transport should not happen; bail safely.
            warn!("start_recording rejected: no transport");
            return Err(SessionError::InvalidState { state: inner.state });
        };
        let audio_tx = transport.audio_sender();

        // Forward frames from the capture thread to the transport; exits
        // when capture stops and its channel closes.
        tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                if audio_tx.send(frame).await.is_err() {
                    break;
                }
            }
        });

        let autosave_stop = autosave::spawn(
            self.config.clone(),
            self.inner.clone(),
            self.document.clone(),
            self.ticket.clone(),
            self.persistence.clone(),
            self.event_tx.clone(),
        );

        inner.capture = Some(capture);
        inner.autosave_stop = Some(autosave_stop);
        inner.language = Some(language.to_string());
        inner.recorded = Duration::ZERO;
        inner.recording_started_at = Some(Instant::now());
        inner.error = None;
        inner.state = ConnectionState::Recording;
        drop(inner);

        info!("Recording started (language: {})", language);
        self.emit(SessionEvent::StateChanged(ConnectionState::Recording));
        self.emit(SessionEvent::ErrorChanged(None));
        Ok(())
    }

    /// Stop recording and return to `connected`
    ///
    /// Joins the capture thread before the state transition, so no frames
    /// are produced after the session leaves `recording`. Assembled
    /// segments are retained.
    pub fn stop_recording(&self) {
        let mut inner = self.lock_inner();
        if !inner.state.can_stop_recording() {
            warn!("stop_recording ignored in state {}", inner.state);
            return;
        }
        if let Some(mut capture) = inner.capture.take() {
            capture.stop();
        }
        if let Some(stop) = inner.autosave_stop.take() {
            let _ = stop.try_send(());
        }
        inner.freeze_duration();
        inner.state = ConnectionState::Connected;
        let had_error = inner.error.take().is_some();
        drop(inner);

        info!("Recording stopped");
        self.emit(SessionEvent::StateChanged(ConnectionState::Connected));
        if had_error {
            self.emit(SessionEvent::ErrorChanged(None));
        }
    }

    /// Apply a local edit to the segment at `index`
    ///
    /// Empty or unchanged text is a no-op. An applied edit pins the segment
    /// against any further server overwrite until the transcript is cleared.
    /// Edits are purely local until the next autosave or finalize.
    pub fn edit_text(&self, index: u64, new_text: &str) {
        let changed = lock_document(&self.document).edit_text(index, new_text);
        if changed {
            debug!("Segment {} edited", index);
            self.emit(SessionEvent::SegmentsUpdated);
        }
    }

    /// Empty the segment sequence and reset the duration
    ///
    /// Valid in any state except `recording`; independent of the
    /// connection state.
    pub fn clear_transcript(&self) {
        {
            let mut inner = self.lock_inner();
            if !inner.state.can_clear_transcript() {
                warn!("clear_transcript ignored while recording");
                return;
            }
            inner.recorded = Duration::ZERO;
            inner.recording_started_at = None;
        }
        lock_document(&self.document).clear();
        info!("Transcript cleared");
        self.emit(SessionEvent::SegmentsUpdated);
    }

    /// Clear the current error banner without changing state
    pub fn dismiss_error(&self) {
        self.lock_inner().error = None;
        self.emit(SessionEvent::ErrorChanged(None));
    }

    /// Spawn the task that applies transport events in receipt order
    ///
    /// The channel is bounded, so a busy controller back-pressures the
    /// transport instead of dropping events.
    fn spawn_event_pump(&self, mut transport_rx: mpsc::Receiver<TransportEvent>) {
        let inner = self.inner.clone();
        let document = self.document.clone();
        let ticket = self.ticket.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = transport_rx.recv().await {
                handle_transport_event(&inner, &document, &ticket, &event_tx, event);
            }
            debug!("Event pump exited");
        });
    }

    fn lock_inner(&self) -> MutexGuard<'_, SessionInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }
}

fn lock_document(document: &Arc<Mutex<TranscriptDocument>>) -> MutexGuard<'_, TranscriptDocument> {
    match document.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn lock_inner_arc(inner: &Arc<Mutex<SessionInner>>) -> MutexGuard<'_, SessionInner> {
    match inner.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Apply one transport event to the session
///
/// Runs on the single event-pump task, so downstream events mutate the
/// document in receipt order; user edits interleave through the document
/// mutex.
fn handle_transport_event(
    inner: &Arc<Mutex<SessionInner>>,
    document: &Arc<Mutex<TranscriptDocument>>,
    ticket: &Arc<SessionTicket>,
    event_tx: &broadcast::Sender<SessionEvent>,
    event: TransportEvent,
) {
    match event {
        TransportEvent::Ready => {
            let mut guard = lock_inner_arc(inner);
            if guard.state == ConnectionState::Connecting {
                guard.state = ConnectionState::Connected;
                guard.error = None;
                drop(guard);
                info!("Session connected");
                let _ = event_tx.send(SessionEvent::StateChanged(ConnectionState::Connected));
                let _ = event_tx.send(SessionEvent::ErrorChanged(None));
            }
        }
        TransportEvent::SessionAssigned { session_id } => {
            // The ticket was already updated by the receive task.
            let _ = event_tx.send(SessionEvent::SessionAssigned(session_id));
        }
        TransportEvent::Segment { payload, is_final } => {
            lock_document(document).apply_event(&payload, is_final);
            let _ = event_tx.send(SessionEvent::SegmentsUpdated);
        }
        TransportEvent::ServerError { message, retryable } => {
            let error = ConnectionError { message, retryable };
            lock_inner_arc(inner).error = Some(error.clone());
            let _ = event_tx.send(SessionEvent::ErrorChanged(Some(error)));
        }
        TransportEvent::ConnectFailed { message } => {
            warn!("Initial connection failed: {}", message);
            teardown(
                inner,
                ticket,
                Some(ConnectionError::retryable(message)),
                event_tx,
            );
        }
        TransportEvent::ConnectionLost => {
            // The transport retries internally; the session stays wanted and
            // the state (connected/recording) is preserved.
            debug!("Connection lost; transport is retrying");
        }
        TransportEvent::Reconnecting { attempt } => {
            debug!("Reconnect attempt {}", attempt);
        }
        TransportEvent::Reconnected => {
            info!("Reconnected; resuming session");
            let mut guard = lock_inner_arc(inner);
            if guard.error.take().is_some() {
                drop(guard);
                let _ = event_tx.send(SessionEvent::ErrorChanged(None));
            }
        }
        TransportEvent::ReconnectFailed => {
            teardown(
                inner,
                ticket,
                Some(ConnectionError::retryable(
                    "Connection lost and reconnect attempts exhausted",
                )),
                event_tx,
            );
        }
        TransportEvent::Fatal { message } => {
            teardown(inner, ticket, Some(ConnectionError::fatal(message)), event_tx);
        }
    }
}

/// Tear the session down to the disconnected ground state
///
/// Shared by explicit disconnect and forced disconnects on fatal errors.
/// The segment sequence is never touched here.
fn teardown(
    inner: &Arc<Mutex<SessionInner>>,
    ticket: &Arc<SessionTicket>,
    error: Option<ConnectionError>,
    event_tx: &broadcast::Sender<SessionEvent>,
) {
    let mut guard = lock_inner_arc(inner);
    if let Some(mut capture) = guard.capture.take() {
        capture.stop();
    }
    if let Some(stop) = guard.autosave_stop.take() {
        let _ = stop.try_send(());
    }
    if let Some(transport) = guard.transport.take() {
        transport.shutdown();
    }
    guard.freeze_duration();
    guard.language = None;
    guard.state = ConnectionState::Disconnected;
    if error.is_some() {
        guard.error = error.clone();
    }
    drop(guard);

    ticket.clear_session_id();
    let _ = event_tx.send(SessionEvent::StateChanged(ConnectionState::Disconnected));
    if let Some(error) = error {
        let _ = event_tx.send(SessionEvent::ErrorChanged(Some(error)));
    }
}
