//! Audio capture pipeline using cpal for cross-platform microphone access
//!
//! Captures audio from the default input device, downmixes to mono,
//! resamples to the transport rate, and emits fixed 100ms PCM16 frames.
//! Capture runs on a dedicated thread; frames are pushed to the transport
//! as produced, never buffered for a later flush.

mod resampler;
mod types;

pub use types::{AudioCaptureError, AudioFrame, CaptureHandle};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleFormat;
use resampler::{flush_partial_frame, process_samples, FRAME_SIZE};
use rubato::{SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Sample rate expected by the streaming transport (16kHz mono PCM16)
pub const TRANSPORT_SAMPLE_RATE: u32 = 16000;

/// Start audio capture on a dedicated thread
///
/// Initializes the default audio input device and begins capturing
/// microphone audio, resampled to [`TRANSPORT_SAMPLE_RATE`] mono PCM.
///
/// # Returns
/// A tuple containing:
/// - `CaptureHandle` - Used to stop capture and check status
/// - `mpsc::Receiver<AudioFrame>` - Receives frames for the transport
///
/// # Errors
/// Returns `AudioCaptureError` if no input device is available, the device
/// configuration is unsupported, or the stream cannot be started. These are
/// non-retryable: the session must not enter the recording state.
pub(crate) fn start_capture(
) -> Result<(CaptureHandle, mpsc::Receiver<AudioFrame>), AudioCaptureError> {
    // Probe the device up front so permission/device failures surface to the
    // caller instead of dying inside the capture thread.
    let host = cpal::default_host();
    if host.default_input_device().is_none() {
        return Err(AudioCaptureError::NoInputDevice);
    }

    let is_capturing = Arc::new(AtomicBool::new(true));
    let is_capturing_clone = is_capturing.clone();

    let (frame_tx, frame_rx) = mpsc::channel(600);

    let thread_handle = thread::spawn(move || {
        if let Err(e) = run_capture(is_capturing_clone, frame_tx) {
            error!("Audio capture error: {}", e);
        }
    });

    let handle = CaptureHandle {
        is_capturing,
        thread_handle: Some(thread_handle),
    };

    Ok((handle, frame_rx))
}

/// Run audio capture on the current thread (blocking)
fn run_capture(
    is_capturing: Arc<AtomicBool>,
    frame_tx: mpsc::Sender<AudioFrame>,
) -> Result<(), AudioCaptureError> {
    let host = cpal::default_host();

    let device = host
        .default_input_device()
        .ok_or(AudioCaptureError::NoInputDevice)?;

    let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
    info!("Using audio input device: {}", device_name);

    let supported_configs = device
        .supported_input_configs()
        .map_err(|e| AudioCaptureError::ConfigError(e.to_string()))?;

    // Prefer a config that supports the transport rate natively; otherwise
    // take any supported rate and resample.
    let mut best_config = None;
    let mut found_target_rate = false;

    for config in supported_configs {
        let channels = config.channels();
        if channels > 0 {
            if config.min_sample_rate().0 <= TRANSPORT_SAMPLE_RATE
                && config.max_sample_rate().0 >= TRANSPORT_SAMPLE_RATE
            {
                best_config = Some(config.with_sample_rate(cpal::SampleRate(TRANSPORT_SAMPLE_RATE)));
                found_target_rate = true;
                break;
            } else if best_config.is_none() {
                best_config = Some(config.with_max_sample_rate());
            }
        }
    }

    let supported_config = best_config.ok_or(AudioCaptureError::NoSupportedConfig)?;

    if !found_target_rate {
        warn!(
            "{}Hz not supported, using {}Hz instead",
            TRANSPORT_SAMPLE_RATE,
            supported_config.sample_rate().0
        );
    }

    let config: cpal::StreamConfig = supported_config.into();
    let sample_rate = config.sample_rate.0;
    let channels = config.channels as usize;

    info!("Audio config: {} channels, {} Hz", channels, sample_rate);

    let (resampler, input_frame_size): (Option<Arc<Mutex<SincFixedIn<f32>>>>, usize) =
        if sample_rate != TRANSPORT_SAMPLE_RATE {
            info!(
                "Creating resampler: {} Hz -> {} Hz",
                sample_rate, TRANSPORT_SAMPLE_RATE
            );
            let params = SincInterpolationParameters {
                sinc_len: 256,
                f_cutoff: 0.95,
                interpolation: SincInterpolationType::Linear,
                oversampling_factor: 256,
                window: WindowFunction::BlackmanHarris2,
            };
            // Input chunk size that resamples down to one transport frame
            let input_frames = (FRAME_SIZE as f64 * sample_rate as f64
                / TRANSPORT_SAMPLE_RATE as f64)
                .ceil() as usize;
            match SincFixedIn::<f32>::new(
                TRANSPORT_SAMPLE_RATE as f64 / sample_rate as f64,
                2.0,
                params,
                input_frames,
                1, // mono
            ) {
                Ok(resampler) => (Some(Arc::new(Mutex::new(resampler))), input_frames),
                Err(e) => {
                    error!("Failed to create resampler: {}", e);
                    (None, FRAME_SIZE)
                }
            }
        } else {
            (None, FRAME_SIZE)
        };

    // Accumulators shared with the stream callback: device samples before
    // resampling, transport samples waiting to fill a frame.
    let input_buffer: Arc<Mutex<Vec<i16>>> =
        Arc::new(Mutex::new(Vec::with_capacity(input_frame_size * 2)));
    let output_buffer: Arc<Mutex<Vec<i16>>> =
        Arc::new(Mutex::new(Vec::with_capacity(FRAME_SIZE * 2)));

    let err_callback = |err| {
        error!("Audio stream error: {}", err);
    };

    let stream = match device.default_input_config()?.sample_format() {
        SampleFormat::I16 => {
            let is_capturing_i16 = is_capturing.clone();
            let input_buffer_i16 = input_buffer.clone();
            let output_buffer_i16 = output_buffer.clone();
            let frame_tx_i16 = frame_tx.clone();
            let resampler_i16 = resampler.clone();
            device.build_input_stream(
                &config,
                move |data: &[i16], _| {
                    if !is_capturing_i16.load(Ordering::SeqCst) {
                        return;
                    }
                    process_samples(
                        data,
                        channels,
                        &input_buffer_i16,
                        input_frame_size,
                        &output_buffer_i16,
                        &frame_tx_i16,
                        &resampler_i16,
                    );
                },
                err_callback,
                None,
            )?
        }
        SampleFormat::F32 => {
            let is_capturing_f32 = is_capturing.clone();
            let input_buffer_f32 = input_buffer.clone();
            let output_buffer_f32 = output_buffer.clone();
            let frame_tx_f32 = frame_tx.clone();
            let resampler_f32 = resampler.clone();
            device.build_input_stream(
                &config,
                move |data: &[f32], _| {
                    if !is_capturing_f32.load(Ordering::SeqCst) {
                        return;
                    }
                    let samples: Vec<i16> = data
                        .iter()
                        .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
                        .collect();
                    process_samples(
                        &samples,
                        channels,
                        &input_buffer_f32,
                        input_frame_size,
                        &output_buffer_f32,
                        &frame_tx_f32,
                        &resampler_f32,
                    );
                },
                err_callback,
                None,
            )?
        }
        sample_format => {
            return Err(AudioCaptureError::UnsupportedFormat(format!(
                "{:?}",
                sample_format
            )));
        }
    };

    stream.play()?;
    info!("Audio capture started");

    // Keep the stream alive until capture is stopped
    while is_capturing.load(Ordering::SeqCst) {
        thread::sleep(std::time::Duration::from_millis(100));
    }

    drop(stream);

    // Flush whatever is left so the tail of the last utterance reaches the
    // transport before the channel closes.
    flush_partial_frame(&output_buffer, &frame_tx);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_start_stop() {
        // Only meaningful on machines with an input device
        match start_capture() {
            Ok((mut handle, _rx)) => {
                assert!(handle.is_capturing());
                handle.stop();
                assert!(!handle.is_capturing());
            }
            Err(AudioCaptureError::NoInputDevice) => {
                println!("No audio input device available (expected in CI)");
            }
            Err(e) => {
                panic!("Unexpected error: {}", e);
            }
        }
    }
}
