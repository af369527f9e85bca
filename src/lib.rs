//! Live transcription session controller
//!
//! Manages the lifecycle of a live dictation/transcription session: audio
//! capture, a streaming WebSocket transport with reconnection, real-time
//! transcript assembly with edit-safe arbitration, periodic autosave, and
//! finalization into a durable recording.
//!
//! The embedding application creates one [`SessionController`], drives it
//! with commands (`connect`, `start_recording`, `stop_recording`, `save`,
//! `disconnect`) and observes it through [`SessionController::snapshot`]
//! and the [`SessionController::subscribe`] event stream.

mod audio;
mod config;
mod error;
mod persistence;
mod protocol;
mod session;
mod transcript;
mod transport;

pub use audio::{AudioCaptureError, AudioFrame};
pub use config::SessionConfig;
pub use error::{ConnectionError, SessionError};
pub use persistence::{HttpPersistenceClient, PersistenceClient, PersistenceError};
pub use protocol::WordInfo;
pub use session::{ConnectionState, SessionController, SessionEvent, SessionSnapshot};
pub use transcript::{TranscriptDocument, TranscriptSegment};
