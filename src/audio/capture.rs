//! Microphone capture pipeline.
//!
//! Acquires the default input device at 16 kHz, slices the incoming
//! sample stream into fixed 4096-sample frames, encodes each frame as
//! PCM16 and hands it to the caller's callback. The callback runs on the
//! audio subsystem's own thread at its own pace — it must queue and
//! return, never block: a missed deadline here drops audio.
//!
//! Exactly one capture session may hold the microphone; a second
//! `start()` fails fast with [`AudioError::CaptureBusy`].

use std::sync::atomic::{AtomicBool, Ordering};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use super::codec::{sample_to_i16, AudioFormat, EncodedAudioChunk};
use super::{AudioError, FRAME_SAMPLES, INPUT_SAMPLE_RATE};

/// System-wide microphone ownership flag.
static CAPTURE_ACTIVE: AtomicBool = AtomicBool::new(false);

// ── Framing ──────────────────────────────────────────────────────

/// Accumulates samples and emits fixed-size frames.
struct FrameAccumulator {
    buf: Vec<i16>,
    frame_len: usize,
}

impl FrameAccumulator {
    fn new(frame_len: usize) -> Self {
        Self {
            buf: Vec::with_capacity(frame_len),
            frame_len,
        }
    }

    /// Push samples, invoking `emit` once per completed frame.
    fn push(&mut self, samples: impl Iterator<Item = i16>, mut emit: impl FnMut(&[i16])) {
        for sample in samples {
            self.buf.push(sample);
            if self.buf.len() == self.frame_len {
                emit(&self.buf);
                self.buf.clear();
            }
        }
    }
}

// ── Capture session ──────────────────────────────────────────────

/// Handle to a running capture session. Dropping it stops capture.
pub struct CaptureHandle {
    stream: Option<cpal::Stream>,
}

impl CaptureHandle {
    /// Release the input device and cease frame production. Idempotent.
    pub fn stop(&mut self) {
        if self.stream.take().is_some() {
            CAPTURE_ACTIVE.store(false, Ordering::SeqCst);
            tracing::info!("microphone released");
        }
    }

    pub fn is_running(&self) -> bool {
        self.stream.is_some()
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Begin producing encoded 16 kHz mono frames until the handle is
/// stopped or dropped.
///
/// `on_frame` receives one [`EncodedAudioChunk`] per [`FRAME_SAMPLES`]
/// samples, on the audio thread.
pub fn start<F>(on_frame: F) -> Result<CaptureHandle, AudioError>
where
    F: FnMut(EncodedAudioChunk) + Send + 'static,
{
    if CAPTURE_ACTIVE.swap(true, Ordering::SeqCst) {
        return Err(AudioError::CaptureBusy);
    }

    match build_stream(on_frame) {
        Ok(stream) => Ok(CaptureHandle {
            stream: Some(stream),
        }),
        Err(e) => {
            CAPTURE_ACTIVE.store(false, Ordering::SeqCst);
            Err(e)
        }
    }
}

fn build_stream<F>(mut on_frame: F) -> Result<cpal::Stream, AudioError>
where
    F: FnMut(EncodedAudioChunk) + Send + 'static,
{
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| AudioError::Device("no input device available".to_string()))?;

    let supported = pick_input_config(&device)?;
    let channels = supported.channels() as usize;
    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();

    tracing::info!(
        device = %device.name().unwrap_or_default(),
        rate = config.sample_rate.0,
        channels,
        format = ?sample_format,
        "opening microphone"
    );

    let format = AudioFormat::pcm16_mono(INPUT_SAMPLE_RATE);
    let mut frames = FrameAccumulator::new(FRAME_SAMPLES);
    let err_fn = |err| tracing::error!(error = %err, "capture stream error");

    // Multichannel devices are downmixed by taking channel 0.
    let stream = match sample_format {
        cpal::SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                frames.push(
                    data.iter().step_by(channels).map(|&s| sample_to_i16(s)),
                    |frame| on_frame(EncodedAudioChunk::from_samples(frame, format)),
                );
            },
            err_fn,
            None,
        ),
        cpal::SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                frames.push(data.iter().step_by(channels).copied(), |frame| {
                    on_frame(EncodedAudioChunk::from_samples(frame, format))
                });
            },
            err_fn,
            None,
        ),
        other => {
            return Err(AudioError::Device(format!(
                "unsupported input sample format {other:?}"
            )))
        }
    }
    .map_err(classify_build_error)?;

    stream
        .play()
        .map_err(|e| AudioError::Device(e.to_string()))?;

    Ok(stream)
}

/// Find an i16/f32 input config covering [`INPUT_SAMPLE_RATE`], fewest
/// channels winning.
fn pick_input_config(device: &cpal::Device) -> Result<cpal::SupportedStreamConfig, AudioError> {
    let ranges = device
        .supported_input_configs()
        .map_err(|e| classify_message(e.to_string()))?;

    let mut best: Option<cpal::SupportedStreamConfig> = None;
    for range in ranges {
        if !matches!(
            range.sample_format(),
            cpal::SampleFormat::F32 | cpal::SampleFormat::I16
        ) {
            continue;
        }
        if range.min_sample_rate().0 > INPUT_SAMPLE_RATE
            || range.max_sample_rate().0 < INPUT_SAMPLE_RATE
        {
            continue;
        }
        let candidate = range.with_sample_rate(cpal::SampleRate(INPUT_SAMPLE_RATE));
        let better = match &best {
            None => true,
            Some(current) => candidate.channels() < current.channels(),
        };
        if better {
            best = Some(candidate);
        }
    }
    best.ok_or_else(|| {
        AudioError::Device(format!(
            "input device has no {INPUT_SAMPLE_RATE} Hz config"
        ))
    })
}

fn classify_build_error(e: cpal::BuildStreamError) -> AudioError {
    match e {
        cpal::BuildStreamError::DeviceNotAvailable => {
            AudioError::Device("input device went away".to_string())
        }
        other => classify_message(other.to_string()),
    }
}

/// Platforms report denied microphone access as backend-specific errors;
/// match on the message to keep the taxonomy useful.
fn classify_message(message: String) -> AudioError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized")
    {
        AudioError::Permission(message)
    } else {
        AudioError::Device(message)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulator_emits_fixed_frames() {
        let mut frames = FrameAccumulator::new(4);
        let mut emitted: Vec<Vec<i16>> = Vec::new();

        frames.push([1i16, 2, 3].into_iter(), |f| emitted.push(f.to_vec()));
        assert!(emitted.is_empty());

        frames.push([4i16, 5, 6, 7, 8, 9].into_iter(), |f| {
            emitted.push(f.to_vec())
        });
        assert_eq!(emitted, vec![vec![1, 2, 3, 4], vec![5, 6, 7, 8]]);
    }

    #[test]
    fn accumulator_carries_remainder_across_pushes() {
        let mut frames = FrameAccumulator::new(3);
        let mut emitted = 0usize;
        for _ in 0..5 {
            frames.push([0i16, 0].into_iter(), |_| emitted += 1);
        }
        // 10 samples / 3 per frame
        assert_eq!(emitted, 3);
    }

    #[test]
    fn busy_guard_rejects_second_start() {
        // Claim the microphone flag directly so the test does not depend
        // on real capture hardware.
        assert!(!CAPTURE_ACTIVE.swap(true, Ordering::SeqCst));
        let result = start(|_| {});
        assert!(matches!(result, Err(AudioError::CaptureBusy)));
        CAPTURE_ACTIVE.store(false, Ordering::SeqCst);
    }

    #[test]
    fn stop_is_idempotent() {
        let mut handle = CaptureHandle { stream: None };
        handle.stop();
        handle.stop();
        assert!(!handle.is_running());
    }

    #[test]
    fn permission_messages_are_classified() {
        assert!(matches!(
            classify_message("Access denied by user".to_string()),
            AudioError::Permission(_)
        ));
        assert!(matches!(
            classify_message("no such device".to_string()),
            AudioError::Device(_)
        ));
    }
}
