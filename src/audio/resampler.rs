//! Sample processing: mono downmix, resampling, and frame slicing

use super::types::AudioFrame;
use super::TRANSPORT_SAMPLE_RATE;
use rubato::{Resampler, SincFixedIn};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{error, warn};

/// Frame size in samples (100ms of audio at 16kHz)
pub(crate) const FRAME_SIZE: usize = 1600;

/// Process incoming device samples into transport frames
///
/// Downmixes to mono, resamples if the device rate differs from the
/// transport rate, and emits complete fixed-size frames on `sender`.
pub(crate) fn process_samples(
    data: &[i16],
    channels: usize,
    input_buffer: &Arc<Mutex<Vec<i16>>>,
    input_frame_size: usize,
    output_buffer: &Arc<Mutex<Vec<i16>>>,
    sender: &mpsc::Sender<AudioFrame>,
    resampler: &Option<Arc<Mutex<SincFixedIn<f32>>>>,
) {
    let mono_samples: Vec<i16> = if channels > 1 {
        data.chunks(channels)
            .map(|frame| {
                let sum: i32 = frame.iter().map(|&s| s as i32).sum();
                (sum / channels as i32) as i16
            })
            .collect()
    } else {
        data.to_vec()
    };

    match resampler {
        Some(resampler_arc) => resample_and_emit(
            &mono_samples,
            input_buffer,
            input_frame_size,
            output_buffer,
            sender,
            resampler_arc,
        ),
        None => {
            buffer_samples(&mono_samples, output_buffer);
            emit_frames(output_buffer, sender);
        }
    }
}

/// Flush any remaining buffered samples as one final short frame
///
/// Called when capture stops so the tail of the last utterance is not lost.
pub(crate) fn flush_partial_frame(
    output_buffer: &Arc<Mutex<Vec<i16>>>,
    sender: &mpsc::Sender<AudioFrame>,
) {
    if let Ok(mut output_buf) = output_buffer.lock() {
        if output_buf.is_empty() {
            return;
        }
        let samples: Vec<i16> = output_buf.drain(..).collect();
        let frame = AudioFrame {
            samples,
            sample_rate: TRANSPORT_SAMPLE_RATE,
        };
        if let Err(e) = sender.try_send(frame) {
            warn!("Dropped final partial frame: {}", e);
        }
    }
}

/// Push samples through the resampler and emit complete frames
fn resample_and_emit(
    mono_samples: &[i16],
    input_buffer: &Arc<Mutex<Vec<i16>>>,
    input_frame_size: usize,
    output_buffer: &Arc<Mutex<Vec<i16>>>,
    sender: &mpsc::Sender<AudioFrame>,
    resampler_arc: &Arc<Mutex<SincFixedIn<f32>>>,
) {
    if let Ok(mut input_buf) = input_buffer.lock() {
        input_buf.extend(mono_samples);

        while input_buf.len() >= input_frame_size {
            let input_chunk: Vec<i16> = input_buf.drain(..input_frame_size).collect();
            let input_f32: Vec<f32> = input_chunk.iter().map(|&s| s as f32 / 32768.0).collect();

            if let Ok(mut resampler) = resampler_arc.lock() {
                match resampler.process(&[input_f32], None) {
                    Ok(resampled) => {
                        let output_i16: Vec<i16> = resampled[0]
                            .iter()
                            .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
                            .collect();
                        buffer_samples(&output_i16, output_buffer);
                    }
                    Err(e) => {
                        error!("Resampling error: {}", e);
                    }
                }
            }
        }
    }

    emit_frames(output_buffer, sender);
}

fn buffer_samples(samples: &[i16], output_buffer: &Arc<Mutex<Vec<i16>>>) {
    if let Ok(mut output_buf) = output_buffer.lock() {
        output_buf.extend(samples);
    }
}

/// Emit complete fixed-size frames from the output buffer
///
/// Uses `try_send` so the audio callback never blocks; on overflow the
/// frame is dropped rather than stalling capture.
fn emit_frames(output_buffer: &Arc<Mutex<Vec<i16>>>, sender: &mpsc::Sender<AudioFrame>) {
    if let Ok(mut output_buf) = output_buffer.lock() {
        while output_buf.len() >= FRAME_SIZE {
            let samples: Vec<i16> = output_buf.drain(..FRAME_SIZE).collect();
            let frame = AudioFrame {
                samples,
                sample_rate: TRANSPORT_SAMPLE_RATE,
            };
            match sender.try_send(frame) {
                Ok(_) => {}
                Err(e) => {
                    warn!("Audio buffer overflow - frame dropped: {}", e);
                    return;
                }
            }
        }
    }
}
