//! HTTP client for the hosted generation service.
//!
//! One explicitly constructed handle, threaded through every component
//! that needs remote access — there is no module-level client. The
//! [`CredentialProvider`] is consulted immediately before each request,
//! so credential rotation never requires a rebuild.
//!
//! Covers the REST half of the remote surface: one-shot generation,
//! SSE-streamed generation, image prediction, long-running video jobs
//! and result download. The live WebSocket session lives in
//! [`crate::live`].

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::{CredentialProvider, GenAiConfig};
use crate::video::VideoOperation;

// ── Errors ───────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum GenAiError {
    /// No API key available from the credential provider.
    #[error("no API key available")]
    MissingCredentials,

    /// Request could not be built from the given arguments.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Transport-level HTTP failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The service answered with a non-success status.
    #[error("remote service error ({status}): {body}")]
    Api { status: u16, body: String },

    /// The service answered with something unparseable.
    #[error("malformed response: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Local I/O while materializing a downloaded payload.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ── Wire types (generateContent family) ──────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Some("user".to_string()),
            parts: vec![Part::text(text)],
        }
    }

    pub fn model_text(text: impl Into<String>) -> Self {
        Self {
            role: Some("model".to_string()),
            parts: vec![Part::text(text)],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(rename = "inlineData", skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<InlineData>,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            inline_data: None,
        }
    }

    pub fn inline(mime_type: impl Into<String>, base64_data: impl Into<String>) -> Self {
        Self {
            text: None,
            inline_data: Some(InlineData {
                mime_type: mime_type.into(),
                data: base64_data.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InlineData {
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    /// Base64-encoded payload.
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolSpec>>,
}

/// Tool augmentation attached to a request. Only web search is used.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    #[serde(rename = "googleSearch", skip_serializing_if = "Option::is_none")]
    pub google_search: Option<serde_json::Value>,
}

impl ToolSpec {
    pub fn google_search() -> Self {
        Self {
            google_search: Some(serde_json::json!({})),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<Content>,
    #[serde(rename = "groundingMetadata", default)]
    pub grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct GroundingMetadata {
    #[serde(rename = "groundingChunks", default)]
    pub grounding_chunks: Vec<GroundingChunk>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct GroundingChunk {
    #[serde(default)]
    pub web: Option<WebSource>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct WebSource {
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

impl GenerateContentResponse {
    /// Concatenated text of the first candidate's parts.
    pub fn text(&self) -> String {
        let mut out = String::new();
        if let Some(candidate) = self.candidates.first() {
            if let Some(content) = &candidate.content {
                for part in &content.parts {
                    if let Some(text) = &part.text {
                        out.push_str(text);
                    }
                }
            }
        }
        out
    }

    /// Web grounding sources attached to the first candidate.
    pub fn web_sources(&self) -> Vec<&WebSource> {
        self.candidates
            .first()
            .and_then(|c| c.grounding_metadata.as_ref())
            .map(|g| {
                g.grounding_chunks
                    .iter()
                    .filter_map(|chunk| chunk.web.as_ref())
                    .collect()
            })
            .unwrap_or_default()
    }
}

// ── Client ───────────────────────────────────────────────────────

/// Handle to the remote generation service.
#[derive(Clone)]
pub struct GenAiClient {
    http: reqwest::Client,
    config: GenAiConfig,
    creds: Arc<dyn CredentialProvider>,
}

impl GenAiClient {
    pub fn new(
        config: GenAiConfig,
        creds: Arc<dyn CredentialProvider>,
    ) -> Result<Self, GenAiError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            config,
            creds,
        })
    }

    pub fn config(&self) -> &GenAiConfig {
        &self.config
    }

    fn api_key(&self) -> Result<String, GenAiError> {
        self.creds.api_key().ok_or(GenAiError::MissingCredentials)
    }

    fn model_url(&self, model: &str, verb: &str) -> String {
        format!("{}/v1beta/models/{model}:{verb}", self.config.base_url)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, GenAiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(GenAiError::Api {
            status: status.as_u16(),
            body,
        })
    }

    // ── One-shot generation ──────────────────────────────────

    pub async fn generate_content(
        &self,
        model: &str,
        request: &GenerateContentRequest,
    ) -> Result<GenerateContentResponse, GenAiError> {
        let url = format!(
            "{}?key={}",
            self.model_url(model, "generateContent"),
            self.api_key()?
        );
        let response = self.http.post(&url).json(request).send().await?;
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }

    // ── Streaming generation (SSE) ───────────────────────────

    /// Stream a generation as it is produced. Each item is one response
    /// chunk carrying text deltas and, with web search enabled,
    /// grounding citations.
    pub async fn stream_generate_content(
        &self,
        model: &str,
        request: &GenerateContentRequest,
    ) -> Result<ReceiverStream<Result<GenerateContentResponse, GenAiError>>, GenAiError> {
        let url = format!(
            "{}?alt=sse&key={}",
            self.model_url(model, "streamGenerateContent"),
            self.api_key()?
        );
        let response = self.http.post(&url).json(request).send().await?;
        let response = Self::check(response).await?;

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut buf: Vec<u8> = Vec::new();
            while let Some(piece) = body.next().await {
                let piece = match piece {
                    Ok(piece) => piece,
                    Err(e) => {
                        let _ = tx.send(Err(GenAiError::Http(e))).await;
                        return;
                    }
                };
                buf.extend_from_slice(&piece);
                while let Some(newline) = buf.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=newline).collect();
                    let line = String::from_utf8_lossy(&line);
                    let Some(data) = line.trim().strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data.is_empty() {
                        continue;
                    }
                    let item = serde_json::from_str::<GenerateContentResponse>(data)
                        .map_err(GenAiError::Malformed);
                    if tx.send(item).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(ReceiverStream::new(rx))
    }

    // ── Image prediction ─────────────────────────────────────

    /// One-shot prediction call (image generation).
    pub async fn predict(
        &self,
        model: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, GenAiError> {
        let url = format!("{}?key={}", self.model_url(model, "predict"), self.api_key()?);
        let response = self.http.post(&url).json(body).send().await?;
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }

    // ── Long-running video jobs ──────────────────────────────

    /// Submit an asynchronous video generation job; returns the
    /// pollable operation.
    pub async fn generate_videos(
        &self,
        prompt: &str,
        image_base64: &str,
        image_mime: &str,
    ) -> Result<VideoOperation, GenAiError> {
        let body = serde_json::json!({
            "instances": [{
                "prompt": prompt,
                "image": {
                    "bytesBase64Encoded": image_base64,
                    "mimeType": image_mime,
                },
            }],
            "parameters": {
                "sampleCount": 1,
                "resolution": "720p",
                "aspectRatio": "16:9",
            },
        });
        let url = format!(
            "{}?key={}",
            self.model_url(&self.config.video_model, "predictLongRunning"),
            self.api_key()?
        );
        let response = self.http.post(&url).json(&body).send().await?;
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }

    /// Refresh a long-running operation by name.
    pub async fn get_operation(&self, name: &str) -> Result<VideoOperation, GenAiError> {
        let url = format!(
            "{}/v1beta/{}?key={}",
            self.config.base_url,
            name,
            self.api_key()?
        );
        let response = self.http.get(&url).send().await?;
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }

    // ── Result download ──────────────────────────────────────

    /// Download a result payload to a local temp file. The service
    /// requires the API key on the download URI as well.
    pub async fn download_to_file(&self, uri: &str) -> Result<tempfile::NamedTempFile, GenAiError> {
        let separator = if uri.contains('?') { '&' } else { '?' };
        let url = format!("{uri}{separator}key={}", self.api_key()?);
        let response = self.http.get(&url).send().await?;
        let response = Self::check(response).await?;

        let mut file = tempfile::NamedTempFile::new()?;
        let mut body = response.bytes_stream();
        while let Some(piece) = body.next().await {
            file.write_all(&piece?)?;
        }
        file.flush()?;
        Ok(file)
    }
}

// ── Tests ────────────────────────────────────────────────────────
