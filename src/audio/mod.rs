//! Audio pipeline: PCM codec, microphone capture, scheduled playback.
//!
//! The live session speaks one fixed format pair: 16 kHz mono PCM16 up,
//! 24 kHz mono PCM16 down. This module provides exactly the conversion,
//! framing and scheduling that pair needs — it is not a general DSP layer.
//!
//! ## Ownership
//! - The microphone belongs to the [`capture`] pipeline between `start()`
//!   and `stop()`; a second concurrent start fails fast.
//! - The output device clock and the playback timeline belong to the
//!   [`playback`] scheduler; nothing else touches them.

pub mod capture;
pub mod codec;
pub mod playback;

use thiserror::Error;

/// Microphone input sample rate expected by the remote service.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of audio streamed back by the remote service.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Samples per capture frame (the unit of encoding and transmission).
pub const FRAME_SAMPLES: usize = 4096;

// ── Error taxonomy ───────────────────────────────────────────────

/// Audio subsystem failures.
///
/// Per-chunk failures (`Decode`, `Playback`) are contained: the caller
/// logs and keeps the session alive. Device-level failures end the
/// recording attempt they occurred in.
#[derive(Debug, Clone, Error)]
pub enum AudioError {
    /// Microphone access denied by the user or platform.
    #[error("microphone permission denied: {0}")]
    Permission(String),

    /// No usable device, or the device went away.
    #[error("audio device unavailable: {0}")]
    Device(String),

    /// Inbound payload could not be decoded; drop it and continue.
    #[error(transparent)]
    Decode(#[from] codec::DecodeError),

    /// Output device busy or lost; the chunk's audio is lost, the
    /// session is not.
    #[error("playback unavailable: {0}")]
    Playback(String),

    /// A capture session is already holding the microphone.
    #[error("capture already active")]
    CaptureBusy,
}

pub use capture::CaptureHandle;
pub use codec::{AudioFormat, DecodeError, EncodedAudioChunk, PlayableBuffer};
pub use playback::{PlaybackScheduler, SpeakerOutput};
