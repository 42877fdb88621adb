//! Wire messages for the bidirectional live session.
//!
//! The remote protocol is versioned and opaque; this module is the only
//! place its JSON shapes appear. Outbound messages are typed structs
//! serialized with the server's camelCase field names. Inbound frames
//! are parsed defensively into [`ServerEvent`]s — one server message can
//! carry several events (audio chunks plus transcription in the same
//! frame), and unknown fields are ignored.

use base64::Engine;
use serde::Serialize;

use super::{ServerEvent, TranscriptSource};
use crate::audio::codec::EncodedAudioChunk;
use crate::config::GenAiConfig;

// ── Setup message (first frame after connect) ────────────────────

#[derive(Debug, Serialize)]
pub struct SetupMessage {
    pub setup: SetupPayload,
}

#[derive(Debug, Serialize)]
pub struct SetupPayload {
    pub model: String,
    #[serde(rename = "generationConfig")]
    pub generation_config: GenerationConfig,
    /// Empty object enables transcription of the model's speech.
    #[serde(rename = "outputAudioTranscription")]
    pub output_audio_transcription: TranscriptionConfig,
    /// Empty object enables transcription of the user's speech.
    #[serde(rename = "inputAudioTranscription")]
    pub input_audio_transcription: TranscriptionConfig,
}

#[derive(Debug, Serialize)]
pub struct GenerationConfig {
    #[serde(rename = "responseModalities")]
    pub response_modalities: Vec<String>,
    #[serde(rename = "speechConfig")]
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
pub struct SpeechConfig {
    #[serde(rename = "voiceConfig")]
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
pub struct VoiceConfig {
    #[serde(rename = "prebuiltVoiceConfig")]
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
pub struct PrebuiltVoiceConfig {
    #[serde(rename = "voiceName")]
    pub voice_name: String,
}

#[derive(Debug, Serialize)]
pub struct TranscriptionConfig {}

/// Build the session setup message from engine configuration.
pub fn build_setup_message(config: &GenAiConfig) -> SetupMessage {
    SetupMessage {
        setup: SetupPayload {
            model: format!("models/{}", config.live_model),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: config.voice_name.clone(),
                        },
                    },
                },
            },
            output_audio_transcription: TranscriptionConfig {},
            input_audio_transcription: TranscriptionConfig {},
        },
    }
}

// ── Realtime audio input ─────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct RealtimeInputMessage {
    #[serde(rename = "realtimeInput")]
    pub realtime_input: RealtimeInput,
}

#[derive(Debug, Serialize)]
pub struct RealtimeInput {
    #[serde(rename = "mediaChunks")]
    pub media_chunks: Vec<MediaChunk>,
}

#[derive(Debug, Serialize)]
pub struct MediaChunk {
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    /// Base64-encoded PCM16.
    pub data: String,
}

/// Wrap one encoded capture frame for the wire.
pub fn build_audio_message(chunk: &EncodedAudioChunk) -> RealtimeInputMessage {
    RealtimeInputMessage {
        realtime_input: RealtimeInput {
            media_chunks: vec![MediaChunk {
                mime_type: chunk.format.mime_type(),
                data: chunk.to_base64(),
            }],
        },
    }
}

// ── Inbound parsing ──────────────────────────────────────────────

/// Parse one JSON frame from the server into events, preserving the
/// order they appear in the frame.
pub fn parse_server_message(json_text: &str) -> Vec<ServerEvent> {
    let mut events = Vec::new();

    let value: serde_json::Value = match serde_json::from_str(json_text) {
        Ok(v) => v,
        Err(e) => {
            events.push(ServerEvent::Error {
                message: format!("unparseable server message: {e}"),
            });
            return events;
        }
    };

    if value.get("setupComplete").is_some() {
        events.push(ServerEvent::SetupComplete);
    }

    if let Some(content) = value.get("serverContent") {
        if let Some(parts) = content
            .pointer("/modelTurn/parts")
            .and_then(|v| v.as_array())
        {
            for part in parts {
                if let Some(data_b64) = part.pointer("/inlineData/data").and_then(|v| v.as_str()) {
                    match base64::engine::general_purpose::STANDARD.decode(data_b64) {
                        Ok(pcm) => events.push(ServerEvent::AudioDelta { pcm }),
                        Err(e) => events.push(ServerEvent::Error {
                            message: format!("undecodable inline audio: {e}"),
                        }),
                    }
                }
                if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                    if !text.is_empty() {
                        events.push(ServerEvent::TranscriptDelta {
                            text: text.to_string(),
                            source: TranscriptSource::Model,
                        });
                    }
                }
            }
        }

        if let Some(text) = content
            .pointer("/inputTranscription/text")
            .and_then(|v| v.as_str())
        {
            if !text.is_empty() {
                events.push(ServerEvent::TranscriptDelta {
                    text: text.to_string(),
                    source: TranscriptSource::User,
                });
            }
        }

        if let Some(text) = content
            .pointer("/outputTranscription/text")
            .and_then(|v| v.as_str())
        {
            if !text.is_empty() {
                events.push(ServerEvent::TranscriptDelta {
                    text: text.to_string(),
                    source: TranscriptSource::Model,
                });
            }
        }

        if content.get("interrupted").and_then(|v| v.as_bool()) == Some(true) {
            events.push(ServerEvent::Interrupted);
        }

        // turnComplete last: transcript deltas in the same frame belong
        // to the turn that is completing.
        if content.get("turnComplete").and_then(|v| v.as_bool()) == Some(true) {
            events.push(ServerEvent::TurnComplete);
        }
    }

    if let Some(err) = value.get("error") {
        let message = err
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown server error");
        events.push(ServerEvent::Error {
            message: message.to_string(),
        });
    }

    events
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::AudioFormat;

    #[test]
    fn setup_message_shape() {
        let config = GenAiConfig::default();
        let msg = build_setup_message(&config);
        let json = serde_json::to_string(&msg).unwrap();

        assert!(json.contains("\"setup\""));
        assert!(json.contains("models/gemini-2.5-flash-native-audio-preview-09-2025"));
        assert!(json.contains("\"responseModalities\":[\"AUDIO\"]"));
        assert!(json.contains("\"voiceName\":\"Zephyr\""));
        assert!(json.contains("\"outputAudioTranscription\":{}"));
        assert!(json.contains("\"inputAudioTranscription\":{}"));
    }

    #[test]
    fn audio_message_wraps_base64() {
        let chunk =
            EncodedAudioChunk::from_samples(&[1i16, 2, 3], AudioFormat::pcm16_mono(16_000));
        let msg = build_audio_message(&chunk);
        let json = serde_json::to_string(&msg).unwrap();

        assert!(json.contains("realtimeInput"));
        assert!(json.contains("mediaChunks"));
        assert!(json.contains("audio/pcm;rate=16000"));

        let b64 = &msg.realtime_input.media_chunks[0].data;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(b64)
            .unwrap();
        assert_eq!(decoded, chunk.data);
    }

    #[test]
    fn parse_setup_complete() {
        let events = parse_server_message(r#"{"setupComplete": {}}"#);
        assert_eq!(events, vec![ServerEvent::SetupComplete]);
    }

    #[test]
    fn parse_audio_delta() {
        let b64 = base64::engine::general_purpose::STANDARD.encode([10u8, 20, 30, 40]);
        let json = format!(
            r#"{{"serverContent": {{"modelTurn": {{"parts": [{{"inlineData": {{"mimeType": "audio/pcm;rate=24000", "data": "{b64}"}}}}]}}}}}}"#
        );
        let events = parse_server_message(&json);
        assert_eq!(
            events,
            vec![ServerEvent::AudioDelta {
                pcm: vec![10, 20, 30, 40]
            }]
        );
    }

    #[test]
    fn parse_output_transcription() {
        let json = r#"{"serverContent": {"outputTranscription": {"text": "Salom"}}}"#;
        let events = parse_server_message(json);
        assert_eq!(
            events,
            vec![ServerEvent::TranscriptDelta {
                text: "Salom".to_string(),
                source: TranscriptSource::Model
            }]
        );
    }

    #[test]
    fn parse_input_transcription() {
        let json = r#"{"serverContent": {"inputTranscription": {"text": "hello"}}}"#;
        let events = parse_server_message(json);
        assert_eq!(
            events,
            vec![ServerEvent::TranscriptDelta {
                text: "hello".to_string(),
                source: TranscriptSource::User
            }]
        );
    }

    #[test]
    fn parse_turn_complete_and_interrupted() {
        let events =
            parse_server_message(r#"{"serverContent": {"turnComplete": true, "interrupted": true}}"#);
        assert_eq!(
            events,
            vec![ServerEvent::Interrupted, ServerEvent::TurnComplete]
        );
    }

    #[test]
    fn transcript_in_same_frame_precedes_turn_complete() {
        let json = r#"{"serverContent": {"outputTranscription": {"text": "done."}, "turnComplete": true}}"#;
        let events = parse_server_message(json);
        assert!(matches!(events[0], ServerEvent::TranscriptDelta { .. }));
        assert_eq!(events[1], ServerEvent::TurnComplete);
    }

    #[test]
    fn parse_error_message() {
        let events = parse_server_message(r#"{"error": {"message": "quota exceeded"}}"#);
        assert_eq!(
            events,
            vec![ServerEvent::Error {
                message: "quota exceeded".to_string()
            }]
        );
    }

    #[test]
    fn parse_invalid_json_yields_error_event() {
        let events = parse_server_message("definitely not json");
        assert!(matches!(events[0], ServerEvent::Error { .. }));
    }

    #[test]
    fn parse_empty_transcription_is_ignored() {
        let events =
            parse_server_message(r#"{"serverContent": {"inputTranscription": {"text": ""}}}"#);
        assert!(events.is_empty());
    }

    #[test]
    fn parse_bad_inline_base64_is_contained() {
        let json = r#"{"serverContent": {"modelTurn": {"parts": [{"inlineData": {"data": "!!!"}}]}}}"#;
        let events = parse_server_message(json);
        assert!(matches!(events[0], ServerEvent::Error { .. }));
    }
}
