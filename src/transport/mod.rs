//! Streaming transport to the transcription backend
//!
//! Owns the persistent bidirectional WebSocket for one session attempt.
//! Sends the handshake and audio frames upstream, delivers server events
//! downstream in receipt order, and reconnects with exponential backoff
//! on unexpected closes while the logical session is still wanted. A
//! successful reconnect resumes with the saved session id; gaps in the
//! event stream across a reconnect are tolerated.

mod connection;

use crate::audio::AudioFrame;
use crate::config::SessionConfig;
use crate::protocol::SegmentPayload;
use connection::{
    build_ws_request, resend_pending_frames, send_handshake, spawn_receive_task, spawn_send_task,
    ReceiveOutcome, SendOutcome,
};
use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite};
use tracing::{error, info, warn};

/// Transport notifications delivered to the session controller
#[derive(Debug, Clone)]
pub(crate) enum TransportEvent {
    /// First connection established and handshake sent
    Ready,
    /// Backend assigned (or confirmed) the logical session id
    SessionAssigned { session_id: String },
    /// A partial or final transcript segment
    Segment { payload: SegmentPayload, is_final: bool },
    /// Backend-reported retryable error, surfaced for the banner
    ServerError { message: String, retryable: bool },
    /// Initial connection attempt failed; no retries are made
    ConnectFailed { message: String },
    /// Established connection dropped unexpectedly; retries follow
    ConnectionLost,
    /// Reconnect attempt starting after backoff
    Reconnecting { attempt: u32 },
    /// Reconnected and resumed with the saved session id
    Reconnected,
    /// Gave up after the configured number of reconnect attempts
    ReconnectFailed,
    /// Backend reported a non-retryable error; forces a disconnect
    Fatal { message: String },
}

/// Resume token and language threaded through transport construction
///
/// The session id is assigned by the backend on first connect and stays
/// stable across reconnects of the same logical session; the connect loop
/// reads it for every handshake.
pub(crate) struct SessionTicket {
    session_id: Mutex<Option<String>>,
    language: Mutex<String>,
}

impl SessionTicket {
    pub(crate) fn new(language: &str) -> Self {
        Self {
            session_id: Mutex::new(None),
            language: Mutex::new(language.to_string()),
        }
    }

    pub(crate) fn session_id(&self) -> Option<String> {
        match self.session_id.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub(crate) fn set_session_id(&self, id: &str) {
        if let Ok(mut guard) = self.session_id.lock() {
            *guard = Some(id.to_string());
        }
    }

    pub(crate) fn clear_session_id(&self) {
        if let Ok(mut guard) = self.session_id.lock() {
            *guard = None;
        }
    }

    pub(crate) fn language(&self) -> String {
        match self.language.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub(crate) fn set_language(&self, language: &str) {
        if let Ok(mut guard) = self.language.lock() {
            *guard = language.to_string();
        }
    }
}

/// Handle to a running transport task
///
/// Dropping the handle closes the upstream audio channel; `shutdown()`
/// additionally cancels any in-flight backoff timer.
pub(crate) struct TransportHandle {
    audio_tx: mpsc::Sender<AudioFrame>,
    should_stop: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl TransportHandle {
    /// Sender for upstream audio frames
    pub(crate) fn audio_sender(&self) -> mpsc::Sender<AudioFrame> {
        self.audio_tx.clone()
    }

    /// Stop the transport, cancelling any pending reconnect backoff
    pub(crate) fn shutdown(&self) {
        self.should_stop.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }
}

/// Spawn the transport task for one session attempt
pub(crate) fn spawn(
    config: Arc<SessionConfig>,
    ticket: Arc<SessionTicket>,
    event_tx: mpsc::Sender<TransportEvent>,
) -> TransportHandle {
    let (audio_tx, audio_rx) = mpsc::channel::<AudioFrame>(1000);
    let should_stop = Arc::new(AtomicBool::new(false));
    let shutdown = Arc::new(Notify::new());

    tokio::spawn(run_connection_loop(
        config,
        ticket,
        event_tx,
        audio_rx,
        should_stop.clone(),
        shutdown.clone(),
    ));

    TransportHandle {
        audio_tx,
        should_stop,
        shutdown,
    }
}

/// Exponential backoff delay for a reconnect attempt (1-based)
fn backoff_delay(base_secs: u64, max_secs: u64, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    let delay = base_secs.saturating_mul(1u64 << exponent);
    Duration::from_secs(delay.min(max_secs))
}

/// Detect an HTTP-level rejection of the upgrade request
///
/// A 4xx response (auth failure, rejected handshake) is a non-retryable
/// error; retrying with the same credentials cannot succeed. Server-side
/// 5xx responses and plain network errors stay retryable.
fn upgrade_rejection(e: &tungstenite::Error) -> Option<String> {
    match e {
        tungstenite::Error::Http(response) if response.status().is_client_error() => Some(
            format!("Backend rejected the connection: HTTP {}", response.status()),
        ),
        _ => None,
    }
}

/// Main connection loop with reconnection support
async fn run_connection_loop(
    config: Arc<SessionConfig>,
    ticket: Arc<SessionTicket>,
    event_tx: mpsc::Sender<TransportEvent>,
    mut audio_rx: mpsc::Receiver<AudioFrame>,
    should_stop: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
) {
    let mut reconnect_attempts = 0u32;
    let mut is_first_connection = true;
    let mut pending_frames: Vec<AudioFrame> = Vec::new();

    loop {
        if should_stop.load(Ordering::SeqCst) {
            info!("Transport stopped");
            break;
        }

        if !is_first_connection {
            reconnect_attempts += 1;
            if reconnect_attempts > config.max_reconnect_attempts {
                error!(
                    "Failed to reconnect after {} attempts",
                    config.max_reconnect_attempts
                );
                let _ = event_tx.send(TransportEvent::ReconnectFailed).await;
                break;
            }
            let delay = backoff_delay(
                config.reconnect_base_delay_secs,
                config.reconnect_max_delay_secs,
                reconnect_attempts,
            );
            info!(
                "Reconnecting (attempt {}/{}) after {:?}",
                reconnect_attempts, config.max_reconnect_attempts, delay
            );
            let _ = event_tx
                .send(TransportEvent::Reconnecting {
                    attempt: reconnect_attempts,
                })
                .await;
            tokio::select! {
                _ = shutdown.notified() => {
                    info!("Backoff cancelled by shutdown");
                    return;
                }
                _ = sleep(delay) => {}
            }
        } else {
            info!("Connecting to transcription backend: {}", config.backend_url);
        }

        let request = match build_ws_request(&config.backend_url, config.auth_token.as_deref()) {
            Ok(request) => request,
            Err(e) => {
                error!("Failed to build WebSocket request: {}", e);
                if is_first_connection {
                    let _ = event_tx.send(TransportEvent::ConnectFailed { message: e }).await;
                    return;
                }
                continue;
            }
        };

        let connect_result = tokio::select! {
            _ = shutdown.notified() => {
                info!("Connect cancelled by shutdown");
                return;
            }
            result = timeout(config.connect_timeout(), connect_async(request)) => result,
        };

        let ws_stream = match connect_result {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => {
                // An upgrade rejection is non-retryable regardless of how
                // many attempts remain; force the disconnect instead.
                if let Some(message) = upgrade_rejection(&e) {
                    error!("WebSocket upgrade rejected: {}", message);
                    let _ = event_tx.send(TransportEvent::Fatal { message }).await;
                    return;
                }
                error!("WebSocket connection failed: {}", e);
                if is_first_connection {
                    let _ = event_tx
                        .send(TransportEvent::ConnectFailed {
                            message: e.to_string(),
                        })
                        .await;
                    return;
                }
                continue;
            }
            Err(_) => {
                error!("WebSocket connection timed out");
                if is_first_connection {
                    let _ = event_tx
                        .send(TransportEvent::ConnectFailed {
                            message: "connection timed out".to_string(),
                        })
                        .await;
                    return;
                }
                continue;
            }
        };

        info!("Connected to transcription backend");

        let (mut ws_sink, ws_stream) = ws_stream.split();

        if let Err(e) = send_handshake(&mut ws_sink, &ticket).await {
            error!("Failed to send handshake: {}", e);
            if is_first_connection {
                let _ = event_tx.send(TransportEvent::ConnectFailed { message: e }).await;
                return;
            }
            continue;
        }

        if is_first_connection {
            let _ = event_tx.send(TransportEvent::Ready).await;
        } else {
            let _ = event_tx.send(TransportEvent::Reconnected).await;
            reconnect_attempts = 0;
        }
        is_first_connection = false;

        if resend_pending_frames(&mut ws_sink, &mut pending_frames)
            .await
            .is_err()
        {
            continue; // Reconnect
        }

        // Channel to unblock the send task when the receive side ends
        let (connection_lost_tx, connection_lost_rx) = mpsc::channel::<()>(1);

        let recv_task = spawn_receive_task(
            ws_stream,
            ticket.clone(),
            event_tx.clone(),
            should_stop.clone(),
        );

        let send_task = spawn_send_task(
            ws_sink,
            audio_rx,
            connection_lost_rx,
            should_stop.clone(),
            config.ping_interval(),
        );

        let recv_outcome = recv_task.await.unwrap_or(ReceiveOutcome {
            connection_ok: false,
            fatal: None,
        });

        let _ = connection_lost_tx.send(()).await;

        let send_outcome = send_task.await.unwrap_or_else(|_| SendOutcome {
            audio_rx: mpsc::channel::<AudioFrame>(1).1,
            pending_frames: Vec::new(),
            stopped: true,
        });

        audio_rx = send_outcome.audio_rx;
        pending_frames = send_outcome.pending_frames;

        if should_stop.load(Ordering::SeqCst) || send_outcome.stopped {
            info!("Transport session ended");
            break;
        }

        if let Some(message) = recv_outcome.fatal {
            let _ = event_tx.send(TransportEvent::Fatal { message }).await;
            break;
        }

        if recv_outcome.connection_ok {
            warn!("Server ended the stream, will attempt to reconnect...");
        } else {
            warn!("Connection lost, will attempt to reconnect...");
        }
        let _ = event_tx.send(TransportEvent::ConnectionLost).await;
    }
}
