//! Audio frame and capture-handle types

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::info;

/// One encoded audio frame ready for the streaming transport
///
/// Mono PCM16 samples, resampled to the transport sample rate. Frames are
/// produced at a fixed short interval (100ms) to keep end-to-end latency low.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// PCM 16-bit signed samples (mono)
    pub samples: Vec<i16>,
    /// Sample rate in Hz (typically 16000)
    pub sample_rate: u32,
}

/// Handle for controlling audio capture from outside the capture thread
///
/// Stopping joins the capture thread, so no frames are produced after
/// `stop()` returns. Capture also stops when the handle is dropped.
pub struct CaptureHandle {
    pub(crate) is_capturing: Arc<AtomicBool>,
    pub(crate) thread_handle: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    /// Stop capturing and release the input device
    ///
    /// Blocks until the capture thread has exited.
    pub fn stop(&mut self) {
        self.is_capturing.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
        info!("Audio capture stopped");
    }

    /// Check if currently capturing
    pub fn is_capturing(&self) -> bool {
        self.is_capturing.load(Ordering::SeqCst)
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            self.stop();
        }
    }
}

/// Errors that can occur during audio capture
///
/// All of these are non-retryable from the session's point of view: the
/// controller must not transition to recording when capture fails to start.
#[derive(Debug, thiserror::Error)]
pub enum AudioCaptureError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("No supported audio configuration found")]
    NoSupportedConfig,

    #[error("Audio configuration error: {0}")]
    ConfigError(String),

    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("Audio device error: {0}")]
    DeviceError(#[from] cpal::DevicesError),

    #[error("Audio stream error: {0}")]
    StreamError(#[from] cpal::BuildStreamError),

    #[error("Audio play error: {0}")]
    PlayError(#[from] cpal::PlayStreamError),

    #[error("Default config error: {0}")]
    DefaultConfigError(#[from] cpal::DefaultStreamConfigError),
}
