//! Live session transport and the voice conversation controller.
//!
//! [`LiveSession`] owns one WebSocket connection: connect, send the
//! setup frame, wait for the server's acknowledgement, then split into
//! an outbound loop (capture frames out) and an inbound loop (server
//! frames parsed into [`ServerEvent`]s). The server may deliver JSON in
//! Binary frames; both are handled.
//!
//! [`LiveConversation`] is the full voice pipeline: microphone →
//! codec → session outbound, and session inbound → codec → playback
//! scheduler, with per-turn transcript accumulation surfaced through a
//! caller-supplied callback.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::protocol;
use super::{LiveError, ServerEvent, TranscriptSource};
use crate::audio::codec::{self, AudioFormat, EncodedAudioChunk};
use crate::audio::{capture, CaptureHandle, PlaybackScheduler, SpeakerOutput, OUTPUT_SAMPLE_RATE};
use crate::config::{CredentialProvider, GenAiConfig};

/// How long to wait for the server's setup acknowledgement.
const SETUP_TIMEOUT: Duration = Duration::from_secs(15);

/// Outbound queue depth. Frames beyond this are dropped, never queued
/// indefinitely.
const OUTBOUND_QUEUE: usize = 256;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Invoked with the accumulated model transcript; `true` marks the end
/// of a turn.
pub type TranscriptCallback = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// Invoked once when the session fails terminally.
pub type ErrorCallback = Arc<dyn Fn(LiveError) + Send + Sync>;

// ── Session state ────────────────────────────────────────────────

/// Transport lifecycle of one live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closed,
}

#[derive(Debug)]
enum Outbound {
    Audio(EncodedAudioChunk),
    Close,
}

/// Send-side handle shared between the capture callback and the
/// session. Frames pushed while the session is not open are dropped
/// silently — never queued against a transport that may never come up.
#[derive(Clone)]
pub(crate) struct OutboundAudio {
    inner: Arc<Mutex<GateState>>,
}

struct GateState {
    state: SessionState,
    tx: Option<mpsc::Sender<Outbound>>,
}

impl OutboundAudio {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(GateState {
                state: SessionState::Connecting,
                tx: None,
            })),
        }
    }

    fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    fn open(&self, tx: mpsc::Sender<Outbound>) {
        let mut gate = self.inner.lock();
        gate.state = SessionState::Open;
        gate.tx = Some(tx);
    }

    fn close(&self) {
        let mut gate = self.inner.lock();
        gate.state = SessionState::Closed;
        gate.tx = None;
    }

    /// Fire-and-forget: runs on the audio thread, must not block.
    pub(crate) fn push(&self, chunk: EncodedAudioChunk) {
        if chunk.data.is_empty() {
            return;
        }
        let gate = self.inner.lock();
        if gate.state != SessionState::Open {
            tracing::trace!(bytes = chunk.data.len(), "dropping frame, session not open");
            return;
        }
        if let Some(tx) = &gate.tx {
            if tx.try_send(Outbound::Audio(chunk)).is_err() {
                tracing::trace!("outbound queue full, dropping frame");
            }
        }
    }
}

// ── Live session (transport) ─────────────────────────────────────

/// One open bidirectional stream. Created by [`LiveSession::connect`];
/// terminated by [`LiveSession::close`] or a transport error.
pub struct LiveSession {
    gate: OutboundAudio,
    session_id: String,
}

impl LiveSession {
    /// Connect, perform setup, and return once the remote end signals
    /// readiness. Events arrive on the returned receiver in arrival
    /// order.
    pub async fn connect(
        config: &GenAiConfig,
        creds: &dyn CredentialProvider,
    ) -> Result<(Self, mpsc::Receiver<ServerEvent>), LiveError> {
        Self::connect_with_gate(config, creds, OutboundAudio::new()).await
    }

    pub(crate) async fn connect_with_gate(
        config: &GenAiConfig,
        creds: &dyn CredentialProvider,
        gate: OutboundAudio,
    ) -> Result<(Self, mpsc::Receiver<ServerEvent>), LiveError> {
        let api_key = creds
            .api_key()
            .ok_or_else(|| LiveError::Setup("no API key available".to_string()))?;
        let session_id = uuid::Uuid::new_v4().to_string();
        let url = format!("{}?key={}", config.live_endpoint, api_key);

        tracing::info!(
            session_id = %session_id,
            model = %config.live_model,
            "connecting live session"
        );

        let (mut ws, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| LiveError::Setup(format!("connect failed: {e}")))?;

        let setup = protocol::build_setup_message(config);
        let setup_json =
            serde_json::to_string(&setup).map_err(|e| LiveError::Setup(e.to_string()))?;
        ws.send(WsMessage::Text(setup_json.into()))
            .await
            .map_err(|e| LiveError::Setup(format!("setup send failed: {e}")))?;

        await_setup_complete(&mut ws, &session_id).await?;

        let (sink, source) = ws.split();
        let (outbound_tx, outbound_rx) = mpsc::channel::<Outbound>(OUTBOUND_QUEUE);
        let (event_tx, event_rx) = mpsc::channel::<ServerEvent>(OUTBOUND_QUEUE);

        gate.open(outbound_tx);

        let gate_out = gate.clone();
        let sid_out = session_id.clone();
        tokio::spawn(outbound_loop(outbound_rx, sink, gate_out, sid_out));

        let gate_in = gate.clone();
        let sid_in = session_id.clone();
        tokio::spawn(inbound_loop(source, event_tx, gate_in, sid_in));

        Ok((Self { gate, session_id }, event_rx))
    }

    /// Forward one encoded capture frame. Fire-and-forget; silently
    /// dropped unless the session is open.
    pub fn try_send_audio(&self, chunk: EncodedAudioChunk) {
        self.gate.push(chunk);
    }

    pub fn state(&self) -> SessionState {
        self.gate.state()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Close the session. Idempotent; safe to call after an error.
    pub fn close(&self) {
        let tx = {
            let mut gate = self.gate.inner.lock();
            if gate.state == SessionState::Closed {
                return;
            }
            gate.state = SessionState::Closed;
            gate.tx.take()
        };
        if let Some(tx) = tx {
            let _ = tx.try_send(Outbound::Close);
        }
        tracing::info!(session_id = %self.session_id, "live session closed");
    }
}

/// Read frames until the server acknowledges setup. The server sends
/// JSON in Binary frames, so both frame kinds are checked.
async fn await_setup_complete(
    ws: &mut WebSocketStream<MaybeTlsStream<TcpStream>>,
    session_id: &str,
) -> Result<(), LiveError> {
    let wait = tokio::time::timeout(SETUP_TIMEOUT, async {
        while let Some(frame) = ws.next().await {
            let frame = frame.map_err(|e| LiveError::Setup(format!("socket error: {e}")))?;
            let text = match &frame {
                WsMessage::Text(text) => Some(text.as_str().to_string()),
                WsMessage::Binary(data) => std::str::from_utf8(data).ok().map(str::to_string),
                WsMessage::Close(reason) => {
                    return Err(LiveError::Setup(format!(
                        "closed before setup completed: {reason:?}"
                    )));
                }
                _ => None,
            };
            if let Some(text) = text {
                let events = protocol::parse_server_message(&text);
                if events.contains(&ServerEvent::SetupComplete) {
                    tracing::info!(session_id = %session_id, "live session ready");
                    return Ok(());
                }
                for event in &events {
                    if let ServerEvent::Error { message } = event {
                        return Err(LiveError::Setup(message.clone()));
                    }
                }
            }
        }
        Err(LiveError::Setup(
            "stream ended before setup completed".to_string(),
        ))
    })
    .await;

    match wait {
        Ok(result) => result,
        Err(_) => Err(LiveError::Setup(format!(
            "no setup acknowledgement within {SETUP_TIMEOUT:?}"
        ))),
    }
}

// ── Transport loops ──────────────────────────────────────────────

async fn outbound_loop(
    mut rx: mpsc::Receiver<Outbound>,
    mut sink: WsSink,
    gate: OutboundAudio,
    session_id: String,
) {
    let mut chunk_count: u64 = 0;
    let mut total_bytes: u64 = 0;

    while let Some(message) = rx.recv().await {
        match message {
            Outbound::Audio(chunk) => {
                chunk_count += 1;
                total_bytes += chunk.data.len() as u64;
                if chunk_count == 1 || chunk_count % 50 == 0 {
                    tracing::debug!(
                        session_id = %session_id,
                        chunk = chunk_count,
                        total_bytes,
                        "sending audio"
                    );
                }
                let wire = protocol::build_audio_message(&chunk);
                let json = match serde_json::to_string(&wire) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::error!(session_id = %session_id, error = %e, "audio serialize failed");
                        continue;
                    }
                };
                if sink.send(WsMessage::Text(json.into())).await.is_err() {
                    tracing::warn!(session_id = %session_id, "socket send failed, stopping outbound");
                    gate.close();
                    break;
                }
            }
            Outbound::Close => {
                let _ = sink.send(WsMessage::Close(None)).await;
                gate.close();
                break;
            }
        }
    }
}

async fn inbound_loop(
    mut source: WsSource,
    event_tx: mpsc::Sender<ServerEvent>,
    gate: OutboundAudio,
    session_id: String,
) {
    while let Some(frame) = source.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => {
                if !forward_events(text.as_str(), &event_tx, &session_id).await {
                    return;
                }
            }
            // The server sends JSON control messages in Binary frames.
            Ok(WsMessage::Binary(data)) => {
                if data.is_empty() {
                    continue;
                }
                match std::str::from_utf8(&data) {
                    Ok(text) => {
                        if !forward_events(text, &event_tx, &session_id).await {
                            return;
                        }
                    }
                    Err(_) => {
                        tracing::warn!(
                            session_id = %session_id,
                            len = data.len(),
                            "skipping non-UTF-8 binary frame"
                        );
                    }
                }
            }
            Ok(WsMessage::Close(reason)) => {
                tracing::info!(session_id = %session_id, ?reason, "server closed live session");
                gate.close();
                break;
            }
            Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_)) => {}
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "live socket error");
                gate.close();
                let _ = event_tx
                    .send(ServerEvent::Error {
                        message: format!("socket error: {e}"),
                    })
                    .await;
                break;
            }
        }
    }
}

/// Parse one frame and forward its events in order. Returns `false`
/// when the event receiver is gone.
async fn forward_events(
    text: &str,
    event_tx: &mpsc::Sender<ServerEvent>,
    session_id: &str,
) -> bool {
    for event in protocol::parse_server_message(text) {
        match &event {
            ServerEvent::AudioDelta { pcm } => {
                tracing::trace!(session_id = %session_id, bytes = pcm.len(), "audio delta");
            }
            ServerEvent::TurnComplete => {
                tracing::debug!(session_id = %session_id, "turn complete");
            }
            ServerEvent::Interrupted => {
                tracing::debug!(session_id = %session_id, "interrupted");
            }
            _ => {}
        }
        if event_tx.send(event).await.is_err() {
            tracing::debug!(session_id = %session_id, "event receiver dropped");
            return false;
        }
    }
    true
}

// ── Conversation controller ──────────────────────────────────────

/// A full live voice conversation: microphone in, scheduled speech out,
/// transcripts surfaced via callback.
pub struct LiveConversation {
    capture: CaptureHandle,
    session: LiveSession,
    scheduler: PlaybackScheduler,
    // Releases the output device when the conversation is dropped.
    _speaker: Option<SpeakerOutput>,
}

impl LiveConversation {
    /// Acquire the microphone, connect the session, and start streaming.
    ///
    /// The microphone is acquired first: a permission or device failure
    /// is reported through `on_error` and no connection is attempted.
    /// Playback-device failure is not fatal — the conversation runs
    /// without audible output.
    ///
    /// Frames captured while the transport is still connecting are
    /// dropped, per the session's send contract.
    pub async fn start(
        config: &GenAiConfig,
        creds: &dyn CredentialProvider,
        on_transcript: TranscriptCallback,
        on_error: ErrorCallback,
    ) -> Result<Self, LiveError> {
        let scheduler = PlaybackScheduler::new(OUTPUT_SAMPLE_RATE);
        let speaker = match SpeakerOutput::open(&scheduler) {
            Ok(speaker) => Some(speaker),
            Err(e) => {
                tracing::warn!(error = %e, "no audible playback for this conversation");
                None
            }
        };

        let gate = OutboundAudio::new();
        let capture_gate = gate.clone();
        let capture = capture::start(move |chunk| capture_gate.push(chunk)).map_err(|e| {
            let err = LiveError::Audio(e);
            on_error(err.clone());
            err
        })?;

        let (session, events) =
            match LiveSession::connect_with_gate(config, creds, gate.clone()).await {
                Ok(connected) => connected,
                Err(e) => {
                    gate.close();
                    on_error(e.clone());
                    return Err(e);
                }
            };

        tokio::spawn(dispatch_loop(
            events,
            scheduler.clone(),
            gate,
            on_transcript,
            on_error,
            session.session_id().to_string(),
        ));

        Ok(Self {
            capture,
            session,
            scheduler,
            _speaker: speaker,
        })
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Stop capture, close the session and release the audio devices.
    /// Idempotent.
    pub fn close(&mut self) {
        self.capture.stop();
        self.session.close();
        self.scheduler.interrupt();
    }
}

impl Drop for LiveConversation {
    fn drop(&mut self) {
        self.close();
    }
}

/// Single consumer of the inbound event stream. Transcript deltas
/// accumulate per turn; audio deltas are decoded and scheduled; per-chunk
/// failures are logged and contained; a server error ends the session.
async fn dispatch_loop(
    mut events: mpsc::Receiver<ServerEvent>,
    scheduler: PlaybackScheduler,
    gate: OutboundAudio,
    on_transcript: TranscriptCallback,
    on_error: ErrorCallback,
    session_id: String,
) {
    let output_format = AudioFormat::pcm16_mono(OUTPUT_SAMPLE_RATE);
    let mut input_transcript = String::new();
    let mut output_transcript = String::new();

    while let Some(event) = events.recv().await {
        match event {
            ServerEvent::SetupComplete => {}
            ServerEvent::TranscriptDelta {
                text,
                source: TranscriptSource::Model,
            } => {
                output_transcript.push_str(&text);
                on_transcript(&output_transcript, false);
            }
            ServerEvent::TranscriptDelta {
                text,
                source: TranscriptSource::User,
            } => {
                // Accumulated but not surfaced; kept for future display.
                input_transcript.push_str(&text);
            }
            ServerEvent::TurnComplete => {
                on_transcript(&output_transcript, true);
                input_transcript.clear();
                output_transcript.clear();
            }
            ServerEvent::AudioDelta { pcm } => {
                let chunk = EncodedAudioChunk {
                    data: pcm,
                    format: output_format,
                };
                match codec::decode(&chunk, output_format) {
                    Ok(buffer) => {
                        if let Err(e) = scheduler.enqueue(buffer) {
                            tracing::warn!(session_id = %session_id, error = %e, "chunk playback lost");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(session_id = %session_id, error = %e, "dropping malformed audio payload");
                    }
                }
            }
            ServerEvent::Interrupted => {
                scheduler.interrupt();
            }
            ServerEvent::Error { message } => {
                gate.close();
                on_error(LiveError::Transport(message));
                break;
            }
        }
    }
    tracing::debug!(session_id = %session_id, "dispatch loop finished");
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::EncodedAudioChunk;

    fn chunk(bytes: &[u8]) -> EncodedAudioChunk {
        EncodedAudioChunk {
            data: bytes.to_vec(),
            format: AudioFormat::pcm16_mono(16_000),
        }
    }

    struct Harness {
        tx: mpsc::Sender<ServerEvent>,
        scheduler: PlaybackScheduler,
        gate: OutboundAudio,
        transcripts: Arc<Mutex<Vec<(String, bool)>>>,
        errors: Arc<Mutex<Vec<LiveError>>>,
        task: tokio::task::JoinHandle<()>,
    }

    fn spawn_dispatch() -> Harness {
        let (tx, rx) = mpsc::channel(64);
        let scheduler = PlaybackScheduler::new(OUTPUT_SAMPLE_RATE);
        let gate = OutboundAudio::new();
        gate.open(mpsc::channel(8).0);

        let transcripts: Arc<Mutex<Vec<(String, bool)>>> = Arc::new(Mutex::new(Vec::new()));
        let errors: Arc<Mutex<Vec<LiveError>>> = Arc::new(Mutex::new(Vec::new()));

        let t = Arc::clone(&transcripts);
        let on_transcript: TranscriptCallback =
            Arc::new(move |text, is_final| t.lock().push((text.to_string(), is_final)));
        let e = Arc::clone(&errors);
        let on_error: ErrorCallback = Arc::new(move |err| e.lock().push(err));

        let task = tokio::spawn(dispatch_loop(
            rx,
            scheduler.clone(),
            gate.clone(),
            on_transcript,
            on_error,
            "test-session".to_string(),
        ));

        Harness {
            tx,
            scheduler,
            gate,
            transcripts,
            errors,
            task,
        }
    }

    async fn finish(h: Harness) -> Harness {
        drop(h.tx);
        let Harness {
            scheduler,
            gate,
            transcripts,
            errors,
            task,
            ..
        } = h;
        task.await.unwrap();
        Harness {
            tx: mpsc::channel(1).0,
            scheduler,
            gate,
            transcripts,
            errors,
            task: tokio::spawn(async {}),
        }
    }

    fn model_delta(text: &str) -> ServerEvent {
        ServerEvent::TranscriptDelta {
            text: text.to_string(),
            source: TranscriptSource::Model,
        }
    }

    #[tokio::test]
    async fn transcripts_accumulate_and_reset_at_turn_boundary() {
        let h = spawn_dispatch();
        h.tx.send(model_delta("Salom")).await.unwrap();
        h.tx.send(model_delta(", dunyo")).await.unwrap();
        h.tx.send(ServerEvent::TurnComplete).await.unwrap();
        h.tx.send(model_delta("Ikkinchi")).await.unwrap();
        h.tx.send(ServerEvent::TurnComplete).await.unwrap();
        let h = finish(h).await;

        let calls = h.transcripts.lock().clone();
        assert_eq!(
            calls,
            vec![
                ("Salom".to_string(), false),
                ("Salom, dunyo".to_string(), false),
                ("Salom, dunyo".to_string(), true),
                // Turns never concatenate across the boundary.
                ("Ikkinchi".to_string(), false),
                ("Ikkinchi".to_string(), true),
            ]
        );
    }

    #[tokio::test]
    async fn user_transcript_is_accumulated_but_not_surfaced() {
        let h = spawn_dispatch();
        h.tx.send(ServerEvent::TranscriptDelta {
            text: "user words".to_string(),
            source: TranscriptSource::User,
        })
        .await
        .unwrap();
        let h = finish(h).await;
        assert!(h.transcripts.lock().is_empty());
    }

    #[tokio::test]
    async fn audio_deltas_are_scheduled_in_order() {
        let h = spawn_dispatch();
        h.tx.send(ServerEvent::AudioDelta {
            pcm: vec![0u8; 4800],
        })
        .await
        .unwrap();
        h.tx.send(ServerEvent::AudioDelta {
            pcm: vec![0u8; 2400],
        })
        .await
        .unwrap();
        let h = finish(h).await;

        assert_eq!(h.scheduler.active_sources(), 2);
        // 2400 + 1200 frames queued back-to-back.
        let expected = 3600.0 / OUTPUT_SAMPLE_RATE as f64;
        assert!((h.scheduler.next_start_time() - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn malformed_audio_is_dropped_and_session_continues() {
        let h = spawn_dispatch();
        // 5 bytes: not a whole number of PCM16 frames.
        h.tx.send(ServerEvent::AudioDelta {
            pcm: vec![1, 2, 3, 4, 5],
        })
        .await
        .unwrap();
        // A valid chunk afterwards still plays.
        h.tx.send(ServerEvent::AudioDelta { pcm: vec![0u8; 4] })
            .await
            .unwrap();
        h.tx.send(model_delta("still alive")).await.unwrap();
        let h = finish(h).await;

        assert_eq!(h.scheduler.active_sources(), 1);
        assert!(h.errors.lock().is_empty());
        assert_eq!(h.transcripts.lock().len(), 1);
    }

    #[tokio::test]
    async fn interrupted_clears_playback() {
        let h = spawn_dispatch();
        h.tx.send(ServerEvent::AudioDelta {
            pcm: vec![0u8; 9600],
        })
        .await
        .unwrap();
        h.tx.send(ServerEvent::Interrupted).await.unwrap();
        let h = finish(h).await;

        assert_eq!(h.scheduler.active_sources(), 0);
        assert_eq!(h.scheduler.next_start_time(), 0.0);
    }

    #[tokio::test]
    async fn server_error_is_terminal() {
        let h = spawn_dispatch();
        h.tx.send(ServerEvent::Error {
            message: "quota exceeded".to_string(),
        })
        .await
        .unwrap();
        // The loop exits on its own; no need to drop the sender.
        h.task.await.unwrap();

        let errors = h.errors.lock();
        assert_eq!(errors.len(), 1);
        assert!(matches!(&errors[0], LiveError::Transport(m) if m.contains("quota")));
        assert_eq!(h.gate.state(), SessionState::Closed);
    }

    #[test]
    fn gate_drops_frames_unless_open() {
        let gate = OutboundAudio::new();
        let (tx, mut rx) = mpsc::channel(8);

        // Connecting: dropped.
        gate.push(chunk(&[1, 2]));
        gate.open(tx);
        gate.push(chunk(&[3, 4]));
        // Closed: dropped again.
        gate.close();
        gate.push(chunk(&[5, 6]));

        let first = rx.try_recv().expect("frame sent while open");
        assert!(matches!(first, Outbound::Audio(c) if c.data == vec![3, 4]));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn gate_ignores_empty_chunks() {
        let gate = OutboundAudio::new();
        let (tx, mut rx) = mpsc::channel(8);
        gate.open(tx);
        gate.push(chunk(&[]));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn session_close_is_idempotent() {
        let gate = OutboundAudio::new();
        let (tx, mut rx) = mpsc::channel(8);
        gate.open(tx);
        let session = LiveSession {
            gate,
            session_id: "s".to_string(),
        };
        session.close();
        session.close();
        assert_eq!(session.state(), SessionState::Closed);

        assert!(matches!(rx.try_recv(), Ok(Outbound::Close)));
        assert!(rx.try_recv().is_err(), "close sent exactly once");
    }
}
