//! PCM16 codec for the live-session wire format.
//!
//! The remote service exchanges raw little-endian PCM16 inside base64
//! JSON fields. Sample scaling is part of the wire contract: float
//! samples in [-1.0, 1.0] are multiplied by 32768 and truncated on the
//! way out, and divided by 32768 on the way in. No dithering.

use base64::Engine;
use thiserror::Error;

/// Bytes per PCM16 mono sample frame.
const FRAME_BYTES: usize = 2;

// ── Format tag ───────────────────────────────────────────────────

/// Sample rate and channel layout of a PCM16 payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    /// Mono PCM16 at the given rate.
    pub const fn pcm16_mono(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 1,
        }
    }

    /// MIME tag used on the wire, e.g. `audio/pcm;rate=16000`.
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }
}

// ── Errors ───────────────────────────────────────────────────────

/// Why an inbound payload could not be decoded.
#[derive(Debug, Clone, Error)]
pub enum DecodeError {
    /// Payload length is not a whole multiple of the sample frame size.
    #[error("payload of {len} bytes is not a multiple of the {FRAME_BYTES}-byte sample frame")]
    UnalignedPayload { len: usize },

    /// The payload's format does not match the requested output format;
    /// resampling is out of scope here.
    #[error("unsupported resample {from} Hz -> {to} Hz")]
    UnsupportedResample { from: u32, to: u32 },

    /// Only mono payloads are supported.
    #[error("unsupported channel count {0}")]
    UnsupportedChannels(u16),

    /// Payload was not valid base64.
    #[error("invalid base64 payload: {0}")]
    InvalidBase64(String),
}

// ── Encoded chunk ────────────────────────────────────────────────

/// One wire-transportable unit of audio: raw PCM16 bytes plus format tag.
/// Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedAudioChunk {
    pub data: Vec<u8>,
    pub format: AudioFormat,
}

impl EncodedAudioChunk {
    /// Encode a block of 16-bit samples. Deterministic and lossless.
    pub fn from_samples(samples: &[i16], format: AudioFormat) -> Self {
        let mut data = Vec::with_capacity(samples.len() * FRAME_BYTES);
        for s in samples {
            data.extend_from_slice(&s.to_le_bytes());
        }
        Self { data, format }
    }

    /// Encode float samples in [-1.0, 1.0] using the wire scaling.
    pub fn from_f32(samples: &[f32], format: AudioFormat) -> Self {
        let quantized: Vec<i16> = samples.iter().map(|&s| sample_to_i16(s)).collect();
        Self::from_samples(&quantized, format)
    }

    /// Base64 form used inside JSON frames.
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.data)
    }

    /// Parse a base64 payload received from the wire.
    pub fn from_base64(data: &str, format: AudioFormat) -> Result<Self, DecodeError> {
        let data = base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| DecodeError::InvalidBase64(e.to_string()))?;
        Ok(Self { data, format })
    }
}

// ── Decoded buffer ───────────────────────────────────────────────

/// A decoded sample buffer with known duration, ready for scheduling.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayableBuffer {
    samples: Vec<f32>,
    format: AudioFormat,
}

impl PlayableBuffer {
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / self.format.channels as usize
    }

    /// Playback duration in seconds.
    pub fn duration(&self) -> f64 {
        self.frames() as f64 / self.format.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub(crate) fn into_samples(self) -> Vec<f32> {
        self.samples
    }
}

// ── Conversion primitives ────────────────────────────────────────

/// Float sample in [-1.0, 1.0] to PCM16: multiply by 32768, truncate.
/// 1.0 lands one past `i16::MAX` and saturates to it.
pub fn sample_to_i16(sample: f32) -> i16 {
    (sample * 32768.0) as i16
}

/// PCM16 sample back to float: divide by 32768.
pub fn sample_to_f32(sample: i16) -> f32 {
    f32::from(sample) / 32768.0
}

/// Decode a PCM16 chunk into a playable buffer in the target format.
///
/// Zero-length payloads decode to an empty buffer. Payloads whose length
/// is not a whole number of sample frames, or whose format differs from
/// the target, are rejected.
pub fn decode(
    chunk: &EncodedAudioChunk,
    target: AudioFormat,
) -> Result<PlayableBuffer, DecodeError> {
    if chunk.format.channels != 1 {
        return Err(DecodeError::UnsupportedChannels(chunk.format.channels));
    }
    if chunk.format.sample_rate != target.sample_rate || target.channels != 1 {
        return Err(DecodeError::UnsupportedResample {
            from: chunk.format.sample_rate,
            to: target.sample_rate,
        });
    }
    if chunk.data.len() % FRAME_BYTES != 0 {
        return Err(DecodeError::UnalignedPayload {
            len: chunk.data.len(),
        });
    }

    let samples = chunk
        .data
        .chunks_exact(FRAME_BYTES)
        .map(|pair| sample_to_f32(i16::from_le_bytes([pair[0], pair[1]])))
        .collect();

    Ok(PlayableBuffer {
        samples,
        format: target,
    })
}

// ── Tests ────────────────────────────────────────────────────────
