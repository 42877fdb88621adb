//! Live voice session: a persistent bidirectional stream to the model.
//!
//! Outbound, the capture pipeline's encoded frames are forwarded as they
//! are produced. Inbound, the server streams transcript deltas, audio
//! deltas, turn boundaries and interruption signals; everything arrives
//! as one tagged event type ([`ServerEvent`]) consumed by a single
//! dispatch loop, which keeps turn bookkeeping deterministic and easy to
//! test.
//!
//! One session per recording; sessions are never pooled or reused.

pub mod protocol;
pub mod session;

use thiserror::Error;

use crate::audio::AudioError;

// ── Inbound events ───────────────────────────────────────────────

/// Which side of the conversation a transcript delta belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptSource {
    /// The user's own speech, transcribed by the server.
    User,
    /// The model's spoken reply.
    Model,
}

/// One inbound event from the live session, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Server acknowledged the setup message; streaming may begin.
    SetupComplete,
    /// A chunk of the model's spoken reply (raw PCM16, 24 kHz mono).
    AudioDelta { pcm: Vec<u8> },
    /// Incremental transcription text.
    TranscriptDelta {
        text: String,
        source: TranscriptSource,
    },
    /// The model finished its reply; transcript accumulators reset here.
    TurnComplete,
    /// Barge-in: stop playing the reply immediately.
    Interrupted,
    /// Server-reported error.
    Error { message: String },
}

// ── Errors ───────────────────────────────────────────────────────

/// Live session failures.
#[derive(Debug, Clone, Error)]
pub enum LiveError {
    /// Handshake or setup never completed.
    #[error("session setup failed: {0}")]
    Setup(String),

    /// Transport-level failure; the session is terminal.
    #[error("transport error: {0}")]
    Transport(String),

    /// Audio subsystem failure surfaced through the session.
    #[error(transparent)]
    Audio(#[from] AudioError),
}

pub use session::{
    ErrorCallback, LiveConversation, LiveSession, SessionState, TranscriptCallback,
};
