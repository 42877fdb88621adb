//! Gapless playback scheduling against the output-device clock.
//!
//! Decoded buffers are scheduled back-to-back on a frame-accurate
//! timeline: each `enqueue` starts at `max(next_start_time, now)` and
//! advances `next_start_time` by the buffer's duration, so buffers play
//! in call order with no gap and no overlap even though `enqueue`
//! returns immediately. A server barge-in maps to [`PlaybackScheduler::interrupt`],
//! which silences every active source and resets the timeline.
//!
//! The device clock is the number of frames the output stream has
//! rendered. The mixer that backs it is driven by the cpal output
//! callback in production and directly by tests.

use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;

use super::codec::PlayableBuffer;
use super::{AudioError, OUTPUT_SAMPLE_RATE};

// ── Mixer state ──────────────────────────────────────────────────

/// One buffer queued or playing on the output clock.
struct ScheduledSource {
    id: u64,
    start_frame: u64,
    samples: Arc<[f32]>,
}

impl ScheduledSource {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

struct MixerState {
    sample_rate: u32,
    /// Frames rendered so far — the device clock.
    clock_frames: u64,
    /// Earliest frame the next buffer may start at.
    next_start_frame: u64,
    next_id: u64,
    /// Sources between "scheduled" and "finished". Empty at rest.
    sources: Vec<ScheduledSource>,
    device_lost: bool,
}

// ── Scheduler ────────────────────────────────────────────────────

/// Owns the playback timeline and the set of active sources.
#[derive(Clone)]
pub struct PlaybackScheduler {
    shared: Arc<Mutex<MixerState>>,
}

impl PlaybackScheduler {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            shared: Arc::new(Mutex::new(MixerState {
                sample_rate,
                clock_frames: 0,
                next_start_frame: 0,
                next_id: 0,
                sources: Vec::new(),
                device_lost: false,
            })),
        }
    }

    /// Current device-clock time in seconds.
    pub fn now(&self) -> f64 {
        let state = self.shared.lock();
        state.clock_frames as f64 / state.sample_rate as f64
    }

    /// Scheduled start of the next enqueued buffer, in seconds.
    pub fn next_start_time(&self) -> f64 {
        let state = self.shared.lock();
        state.next_start_frame as f64 / state.sample_rate as f64
    }

    /// Sources currently between "scheduled" and "finished".
    pub fn active_sources(&self) -> usize {
        self.shared.lock().sources.len()
    }

    /// Schedule a buffer to play immediately after everything already
    /// queued. Non-blocking; returns the source id.
    pub fn enqueue(&self, buffer: PlayableBuffer) -> Result<u64, AudioError> {
        let mut state = self.shared.lock();
        if state.device_lost {
            return Err(AudioError::Playback("output device lost".to_string()));
        }
        if buffer.format().sample_rate != state.sample_rate {
            return Err(AudioError::Playback(format!(
                "buffer rate {} does not match device rate {}",
                buffer.format().sample_rate,
                state.sample_rate
            )));
        }

        let start_frame = state.next_start_frame.max(state.clock_frames);
        let samples: Arc<[f32]> = buffer.into_samples().into();
        state.next_start_frame = start_frame + samples.len() as u64;

        let id = state.next_id;
        state.next_id += 1;
        state.sources.push(ScheduledSource {
            id,
            start_frame,
            samples,
        });

        tracing::trace!(source = id, start_frame, "scheduled playback buffer");
        Ok(id)
    }

    /// Barge-in: stop every active source now and reset the timeline so
    /// the next enqueue starts as soon as possible.
    pub fn interrupt(&self) {
        let mut state = self.shared.lock();
        let stopped = state.sources.len();
        state.sources.clear();
        state.next_start_frame = 0;
        if stopped > 0 {
            tracing::debug!(stopped, "playback interrupted");
        }
    }

    /// Mix all due sources into `out` (mono frames), advance the clock,
    /// and retire sources that finished. Called from the output stream
    /// callback; tests call it directly to advance time.
    pub fn render(&self, out: &mut [f32]) {
        out.fill(0.0);
        let mut state = self.shared.lock();
        let clock = state.clock_frames;
        let end = clock + out.len() as u64;

        for source in &state.sources {
            let from = source.start_frame.max(clock);
            let to = source.end_frame().min(end);
            for frame in from..to {
                out[(frame - clock) as usize] +=
                    source.samples[(frame - source.start_frame) as usize];
            }
        }

        state.clock_frames = end;
        // Finished sources self-remove from the active set.
        state.sources.retain(|s| s.end_frame() > end);
    }

    fn mark_device_lost(&self) {
        self.shared.lock().device_lost = true;
    }

    #[cfg(test)]
    fn source_start_frame(&self, id: u64) -> Option<u64> {
        self.shared
            .lock()
            .sources
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.start_frame)
    }
}

// ── Device output ────────────────────────────────────────────────

/// Open output stream feeding from a [`PlaybackScheduler`].
///
/// Dropping it releases the device; the scheduler keeps working headless
/// (time simply stops advancing).
pub struct SpeakerOutput {
    _stream: cpal::Stream,
}

impl SpeakerOutput {
    /// Open the default output device at the service's output rate.
    ///
    /// Failure here is not fatal to a session: the caller logs it and
    /// continues without audible playback.
    pub fn open(scheduler: &PlaybackScheduler) -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| AudioError::Playback("no output device".to_string()))?;

        let supported = pick_output_config(&device)?;
        let channels = supported.channels() as usize;
        let config: cpal::StreamConfig = supported.into();

        tracing::info!(
            device = %device.name().unwrap_or_default(),
            rate = config.sample_rate.0,
            channels,
            "opening speaker output"
        );

        let render_from = scheduler.clone();
        let lost = scheduler.clone();
        let mut mono: Vec<f32> = Vec::new();
        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let frames = data.len() / channels;
                    mono.resize(frames, 0.0);
                    render_from.render(&mut mono);
                    for (frame, &sample) in mono.iter().enumerate() {
                        for ch in 0..channels {
                            data[frame * channels + ch] = sample;
                        }
                    }
                },
                move |err| {
                    tracing::error!(error = %err, "output stream error");
                    lost.mark_device_lost();
                },
                None,
            )
            .map_err(|e| AudioError::Playback(e.to_string()))?;
        stream
            .play()
            .map_err(|e| AudioError::Playback(e.to_string()))?;

        Ok(Self { _stream: stream })
    }
}

/// Find an f32 output config at [`OUTPUT_SAMPLE_RATE`], fewest channels
/// winning. Anything else would need resampling, which is out of scope.
fn pick_output_config(device: &cpal::Device) -> Result<cpal::SupportedStreamConfig, AudioError> {
    let ranges = device
        .supported_output_configs()
        .map_err(|e| AudioError::Playback(e.to_string()))?;

    let mut best: Option<cpal::SupportedStreamConfig> = None;
    for range in ranges {
        if range.sample_format() != cpal::SampleFormat::F32 {
            continue;
        }
        if range.min_sample_rate().0 > OUTPUT_SAMPLE_RATE
            || range.max_sample_rate().0 < OUTPUT_SAMPLE_RATE
        {
            continue;
        }
        let candidate = range.with_sample_rate(cpal::SampleRate(OUTPUT_SAMPLE_RATE));
        let better = match &best {
            None => true,
            Some(current) => candidate.channels() < current.channels(),
        };
        if better {
            best = Some(candidate);
        }
    }
    best.ok_or_else(|| {
        AudioError::Playback(format!(
            "output device has no {OUTPUT_SAMPLE_RATE} Hz f32 config"
        ))
    })
}

// ── Tests ────────────────────────────────────────────────────────
