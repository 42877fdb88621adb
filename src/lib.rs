//! Streaming interaction engine for the Tamur assistant.
//!
//! Tamur mediates between a user interface and a hosted generative-AI
//! backend. This crate is the engine underneath that UI:
//!
//! - **Live voice** — bidirectional audio streaming: microphone capture,
//!   PCM framing, a persistent session to the model, and gapless scheduled
//!   playback of the streamed reply ([`live`], [`audio`]).
//! - **Streaming chat** — multi-turn chat with optional web-search
//!   grounding, delivered as an incremental delta stream and folded into
//!   UI-ready message state ([`chat`]).
//! - **Media generation** — one-shot image generation and analysis
//!   ([`media`]) and long-running video generation driven to completion by
//!   a polling loop with progress callbacks ([`video`]).
//!
//! The remote service is reached through an explicitly constructed
//! [`GenAiClient`]; there is no global client state. Credentials come from
//! a [`CredentialProvider`] consulted before each call, so key rotation
//! needs no client rebuild.

pub mod audio;
pub mod chat;
pub mod client;
pub mod config;
pub mod live;
pub mod media;
pub mod video;

pub use client::{GenAiClient, GenAiError};
pub use config::{CredentialProvider, EnvCredentials, GenAiConfig, StaticCredentials};
