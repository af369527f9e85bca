//! WebSocket connection tasks: upgrade request, send loop, receive loop

use super::{SessionTicket, TransportEvent};
use crate::audio::AudioFrame;
use crate::protocol::{ClientMessage, ServerEvent};
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, trace, warn};

/// Result of the receive task for one connection
pub(super) struct ReceiveOutcome {
    /// False when the connection dropped unexpectedly
    pub(super) connection_ok: bool,
    /// Set when the backend reported a non-retryable error
    pub(super) fatal: Option<String>,
}

/// Result of the send task for one connection
pub(super) struct SendOutcome {
    /// The audio receiver, handed back for the next connection attempt
    pub(super) audio_rx: mpsc::Receiver<AudioFrame>,
    /// Frames that did not make it onto the wire before the drop
    pub(super) pending_frames: Vec<AudioFrame>,
    /// True when the session was stopped locally rather than dropped
    pub(super) stopped: bool,
}

/// Generate a random Sec-WebSocket-Key
fn generate_ws_key() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let mut key = [0u8; 16];
    rng.fill(&mut key);
    base64::engine::general_purpose::STANDARD.encode(key)
}

/// Build the WebSocket upgrade request for the backend
pub(super) fn build_ws_request(
    ws_url: &str,
    auth_token: Option<&str>,
) -> Result<http::Request<()>, String> {
    let parsed = url::Url::parse(ws_url).map_err(|e| e.to_string())?;
    let host = parsed
        .host_str()
        .ok_or_else(|| "Invalid URL: no host".to_string())?
        .to_string();

    let mut builder = http::Request::builder()
        .uri(ws_url)
        .header("Host", host)
        .header("Upgrade", "websocket")
        .header("Connection", "Upgrade")
        .header("Sec-WebSocket-Key", generate_ws_key())
        .header("Sec-WebSocket-Version", "13");

    if let Some(token) = auth_token {
        builder = builder.header("Authorization", format!("Bearer {}", token));
    }

    builder.body(()).map_err(|e| e.to_string())
}

/// Send the opening handshake identifying the language and resume token
pub(super) async fn send_handshake<S>(
    ws_sink: &mut S,
    ticket: &SessionTicket,
) -> Result<(), String>
where
    S: SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let msg = ClientMessage::Handshake {
        language: ticket.language(),
        resume_session_id: ticket.session_id(),
    };
    let json = serde_json::to_string(&msg).map_err(|e| e.to_string())?;
    info!("Sending handshake: {}", json);

    ws_sink
        .send(Message::Text(json))
        .await
        .map_err(|e| e.to_string())
}

/// Encode and send one audio frame as base64 PCM16
async fn send_audio_frame<S>(ws_sink: &mut S, frame: &AudioFrame) -> Result<(), ()>
where
    S: SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let bytes: Vec<u8> = frame
        .samples
        .iter()
        .flat_map(|&s| s.to_le_bytes())
        .collect();

    let audio = base64::engine::general_purpose::STANDARD.encode(&bytes);
    let msg = ClientMessage::AudioFrame { audio };

    if let Ok(json) = serde_json::to_string(&msg) {
        ws_sink.send(Message::Text(json)).await.map_err(|_| ())?;
    }
    Ok(())
}

/// Resend frames buffered during a connection drop
pub(super) async fn resend_pending_frames<S>(
    ws_sink: &mut S,
    pending_frames: &mut Vec<AudioFrame>,
) -> Result<(), ()>
where
    S: SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    if pending_frames.is_empty() {
        return Ok(());
    }

    info!("Resending {} buffered audio frames", pending_frames.len());
    for frame in pending_frames.drain(..) {
        if send_audio_frame(ws_sink, &frame).await.is_err() {
            error!("Failed to resend buffered audio frame");
            return Err(());
        }
    }
    Ok(())
}

/// Spawn the receive task that handles incoming server events
///
/// Events are forwarded to the controller in receipt order. A non-retryable
/// server error ends the connection with a fatal outcome so the connect loop
/// does not retry.
pub(super) fn spawn_receive_task(
    mut ws_stream: impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin
        + Send
        + 'static,
    ticket: Arc<SessionTicket>,
    event_tx: mpsc::Sender<TransportEvent>,
    should_stop: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<ReceiveOutcome> {
    tokio::spawn(async move {
        let mut connection_ok = true;
        let mut fatal = None;

        while let Some(msg_result) = ws_stream.next().await {
            if should_stop.load(Ordering::SeqCst) {
                break;
            }

            match msg_result {
                Ok(Message::Text(text)) => {
                    trace!("Server message: {}", text);
                    match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(ServerEvent::PartialSegment(payload)) => {
                            let _ = event_tx
                                .send(TransportEvent::Segment {
                                    payload,
                                    is_final: false,
                                })
                                .await;
                        }
                        Ok(ServerEvent::FinalSegment(payload)) => {
                            debug!("Final segment #{}: {}", payload.index, payload.text);
                            let _ = event_tx
                                .send(TransportEvent::Segment {
                                    payload,
                                    is_final: true,
                                })
                                .await;
                        }
                        Ok(ServerEvent::SessionAssigned { session_id }) => {
                            info!("Session assigned: {}", session_id);
                            ticket.set_session_id(&session_id);
                            let _ = event_tx
                                .send(TransportEvent::SessionAssigned { session_id })
                                .await;
                        }
                        Ok(ServerEvent::Error { message, retryable }) => {
                            if retryable {
                                warn!("Backend reported retryable error: {}", message);
                                let _ = event_tx
                                    .send(TransportEvent::ServerError {
                                        message,
                                        retryable: true,
                                    })
                                    .await;
                            } else {
                                error!("Backend reported fatal error: {}", message);
                                fatal = Some(message);
                                break;
                            }
                        }
                        Ok(ServerEvent::Other) => {
                            trace!("Ignoring unknown server event");
                        }
                        Err(e) => {
                            warn!("Failed to parse server event: {} - {}", e, text);
                        }
                    }
                }
                Ok(Message::Close(_)) => {
                    info!("WebSocket closed by server");
                    connection_ok = false;
                    break;
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                    trace!("WebSocket keepalive");
                }
                Err(e) => {
                    error!("WebSocket receive error: {}", e);
                    connection_ok = false;
                    break;
                }
                _ => {}
            }
        }

        ReceiveOutcome {
            connection_ok,
            fatal,
        }
    })
}

/// Spawn the send task that forwards audio frames in capture order
pub(super) fn spawn_send_task<S>(
    mut ws_sink: S,
    mut audio_rx: mpsc::Receiver<AudioFrame>,
    mut connection_lost_rx: mpsc::Receiver<()>,
    should_stop: Arc<AtomicBool>,
    ping_interval: Duration,
) -> tokio::task::JoinHandle<SendOutcome>
where
    S: SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut pending_frames: Vec<AudioFrame> = Vec::new();
        let mut frames_sent = 0u64;

        let mut ping_timer = interval(ping_interval);
        ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = connection_lost_rx.recv() => {
                    debug!("Send task received connection lost signal");
                    break;
                }
                _ = ping_timer.tick() => {
                    if ws_sink.send(Message::Ping(vec![])).await.is_err() {
                        warn!("Failed to send keepalive ping");
                        break;
                    }
                    trace!("Sent keepalive ping");
                }
                frame = audio_rx.recv() => {
                    if should_stop.load(Ordering::SeqCst) {
                        let _ = ws_sink.close().await;
                        return SendOutcome { audio_rx, pending_frames: Vec::new(), stopped: true };
                    }
                    match frame {
                        Some(frame) => {
                            frames_sent += 1;
                            if frames_sent == 1 || frames_sent % 100 == 0 {
                                debug!(
                                    "Sending audio frame #{} ({} samples)",
                                    frames_sent,
                                    frame.samples.len()
                                );
                            }
                            if send_audio_frame(&mut ws_sink, &frame).await.is_err() {
                                error!("Failed to send audio frame");
                                pending_frames.push(frame);
                                break;
                            }
                        }
                        None => {
                            info!("Audio channel closed after {} frames", frames_sent);
                            let _ = ws_sink.close().await;
                            return SendOutcome { audio_rx, pending_frames: Vec::new(), stopped: true };
                        }
                    }
                }
            }
        }

        // Drain whatever capture produced during the drop so it can be
        // resent after reconnect.
        while let Ok(frame) = audio_rx.try_recv() {
            pending_frames.push(frame);
        }

        debug!(
            "Send task exiting after {} frames, {} pending",
            frames_sent,
            pending_frames.len()
        );
        SendOutcome {
            audio_rx,
            pending_frames,
            stopped: false,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use futures_util::Sink;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// Vec-backed sink that starts failing after `fail_after` sends
    struct TestSink {
        sent: Vec<Message>,
        fail_after: usize,
    }

    impl TestSink {
        fn reliable() -> Self {
            Self {
                sent: Vec::new(),
                fail_after: usize::MAX,
            }
        }

        fn failing_after(fail_after: usize) -> Self {
            Self {
                sent: Vec::new(),
                fail_after,
            }
        }
    }

    impl Sink<Message> for TestSink {
        type Error = tokio_tungstenite::tungstenite::Error;

        fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(mut self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
            if self.sent.len() >= self.fail_after {
                return Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed);
            }
            self.sent.push(item);
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
    }

    fn frame(samples: Vec<i16>) -> AudioFrame {
        AudioFrame {
            samples,
            sample_rate: 16000,
        }
    }

    fn text(json: &str) -> Result<Message, tokio_tungstenite::tungstenite::Error> {
        Ok(Message::Text(json.to_string()))
    }

    #[tokio::test]
    async fn test_failed_send_parks_frame_for_resend() {
        let (audio_tx, audio_rx) = mpsc::channel(8);
        let (_lost_tx, lost_rx) = mpsc::channel(1);
        audio_tx.send(frame(vec![1, 2, 3])).await.unwrap();

        // The audio frame send fails immediately.
        let sink = TestSink::failing_after(0);
        let task = spawn_send_task(
            sink,
            audio_rx,
            lost_rx,
            Arc::new(AtomicBool::new(false)),
            Duration::from_secs(30),
        );
        let outcome = task.await.unwrap();

        assert!(!outcome.stopped);
        assert_eq!(outcome.pending_frames.len(), 1);
        assert_eq!(outcome.pending_frames[0].samples, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_resend_drains_pending_frames() {
        let mut sink = TestSink::reliable();
        let mut pending = vec![frame(vec![1]), frame(vec![2])];

        resend_pending_frames(&mut sink, &mut pending).await.unwrap();

        assert!(pending.is_empty());
        assert_eq!(sink.sent.len(), 2);
        assert!(sink
            .sent
            .iter()
            .all(|m| matches!(m, Message::Text(t) if t.contains("audio-frame"))));
    }

    #[tokio::test]
    async fn test_non_retryable_server_error_ends_connection_fatally() {
        let messages = vec![
            text(r#"{"type":"error","message":"authentication failed","retryable":false}"#),
            text(r#"{"type":"final-segment","index":0,"text":"late"}"#),
        ];
        let ticket = Arc::new(SessionTicket::new("en"));
        let (event_tx, mut event_rx) = mpsc::channel(8);

        let outcome = spawn_receive_task(
            stream::iter(messages),
            ticket,
            event_tx,
            Arc::new(AtomicBool::new(false)),
        )
        .await
        .unwrap();

        assert_eq!(outcome.fatal.as_deref(), Some("authentication failed"));
        // The stream ends at the fatal error; the trailing segment is
        // never forwarded.
        assert!(event_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_receive_forwards_events_and_records_session_id() {
        let messages = vec![
            text(r#"{"type":"session-assigned","session_id":"sess-5"}"#),
            text(r#"{"type":"partial-segment","index":0,"text":"Hel"}"#),
            Ok(Message::Close(None)),
        ];
        let ticket = Arc::new(SessionTicket::new("en"));
        let (event_tx, mut event_rx) = mpsc::channel(8);

        let outcome = spawn_receive_task(
            stream::iter(messages),
            ticket.clone(),
            event_tx,
            Arc::new(AtomicBool::new(false)),
        )
        .await
        .unwrap();

        assert!(!outcome.connection_ok);
        assert!(outcome.fatal.is_none());
        assert_eq!(ticket.session_id().as_deref(), Some("sess-5"));
        assert!(matches!(
            event_rx.try_recv(),
            Ok(TransportEvent::SessionAssigned { session_id }) if session_id == "sess-5"
        ));
        assert!(matches!(
            event_rx.try_recv(),
            Ok(TransportEvent::Segment { is_final: false, .. })
        ));
    }

    #[test]
    fn test_build_ws_request() {
        let request = build_ws_request("wss://stt.example.com/stream", None).unwrap();
        assert_eq!(request.uri(), "wss://stt.example.com/stream");
        assert_eq!(
            request.headers().get("Host").unwrap(),
            "stt.example.com"
        );
        assert_eq!(request.headers().get("Upgrade").unwrap(), "websocket");
        assert!(request.headers().get("Authorization").is_none());
    }

    #[test]
    fn test_build_ws_request_with_token() {
        let request = build_ws_request("wss://stt.example.com/stream", Some("tok")).unwrap();
        assert_eq!(
            request.headers().get("Authorization").unwrap(),
            "Bearer tok"
        );
    }

    #[test]
    fn test_build_ws_request_invalid_url() {
        assert!(build_ws_request("not a url", None).is_err());
    }
}
