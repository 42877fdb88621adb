//! Streaming chat: multi-turn conversation state, the delta reducer,
//! and title generation.
//!
//! A [`Chat`] owns the turn history sent with every request. Replies
//! stream back as chunks; [`StreamedReply`] folds them into accumulated
//! UI-ready state — full text so far plus a deduplicated citation list —
//! so a front-end can re-render on every chunk.

use std::sync::Arc;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio_stream::wrappers::ReceiverStream;

use crate::client::{
    Content, GenAiClient, GenAiError, GenerateContentRequest, GenerateContentResponse, ToolSpec,
};

// ── Data model ───────────────────────────────────────────────────

/// Interaction mode selected in the composer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tool {
    #[serde(rename = "CHAT")]
    Chat,
    #[serde(rename = "WEB_SEARCH")]
    WebSearch,
    #[serde(rename = "IMAGE_GENERATION")]
    ImageGeneration,
    #[serde(rename = "VIDEO_GENERATION")]
    VideoGeneration,
    #[serde(rename = "IMAGE_ANALYSIS")]
    ImageAnalysis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "user")]
    User,
    #[serde(rename = "model")]
    Model,
}

/// A citation attached to a streamed reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub url: String,
    pub title: String,
    pub snippet: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttachmentKind {
    #[serde(rename = "image")]
    Image,
    #[serde(rename = "video")]
    Video,
    #[serde(rename = "audio")]
    Audio,
}

/// Media carried alongside a message: a data URI or a local handle path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub kind: AttachmentKind,
    pub data: String,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
}

/// One rendered message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub sources: Vec<Source>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn model(content: impl Into<String>) -> Self {
        Self::new(Role::Model, content)
    }

    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: format!("msg-{}", uuid::Uuid::new_v4()),
            role,
            content: content.into(),
            attachments: Vec::new(),
            sources: Vec::new(),
        }
    }
}

/// A stored conversation, ready for the persistence collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl ChatSession {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: format!("chat-{}", uuid::Uuid::new_v4()),
            title: title.into(),
            messages: Vec::new(),
        }
    }
}

// ── Streaming reducer ────────────────────────────────────────────

/// Accumulated state of a reply being streamed. Apply each chunk as it
/// arrives; `content` and `sources` are always complete so far.
#[derive(Debug, Clone, Default)]
pub struct StreamedReply {
    pub content: String,
    pub sources: Vec<Source>,
}

impl StreamedReply {
    /// Merge one streamed chunk: append its text, collect any new
    /// citations (deduplicated by URL).
    pub fn apply(&mut self, chunk: &GenerateContentResponse) {
        self.content.push_str(&chunk.text());
        for web in chunk.web_sources() {
            let url = match &web.uri {
                Some(uri) if !uri.is_empty() => uri.clone(),
                _ => continue,
            };
            if self.sources.iter().any(|s| s.url == url) {
                continue;
            }
            self.sources.push(Source {
                id: format!("src-{}", uuid::Uuid::new_v4()),
                url,
                title: web
                    .title
                    .clone()
                    .filter(|t| !t.is_empty())
                    .unwrap_or_else(|| "Manba".to_string()),
                snippet: String::new(),
            });
        }
    }

    /// Finish the stream as a renderable message.
    pub fn into_message(self) -> Message {
        let mut message = Message::model(self.content);
        message.sources = self.sources;
        message
    }
}

// ── Chat (stateful multi-turn) ───────────────────────────────────

/// A stateful chat against the hosted model. History is appended after
/// each completed stream so the next turn carries full context.
pub struct Chat {
    client: GenAiClient,
    history: Arc<Mutex<Vec<Content>>>,
    web_search: bool,
}

impl Chat {
    /// Start a chat; `Tool::WebSearch` enables search grounding for
    /// every turn of this chat.
    pub fn new(client: GenAiClient, tool: Tool) -> Self {
        Self {
            client,
            history: Arc::new(Mutex::new(Vec::new())),
            web_search: tool == Tool::WebSearch,
        }
    }

    /// Send one user turn; returns a stream of reply chunks. The user
    /// turn is recorded immediately, the model turn once its stream
    /// ends.
    pub async fn send_message_stream(
        &self,
        prompt: &str,
    ) -> Result<ReceiverStream<Result<GenerateContentResponse, GenAiError>>, GenAiError> {
        let request = {
            let mut history = self.history.lock().await;
            history.push(Content::user_text(prompt));
            GenerateContentRequest {
                contents: history.clone(),
                tools: self
                    .web_search
                    .then(|| vec![ToolSpec::google_search()]),
            }
        };

        let upstream = self
            .client
            .stream_generate_content(&self.client.config().chat_model, &request)
            .await?;

        let (tx, rx) = mpsc::channel(16);
        let history = Arc::clone(&self.history);
        tokio::spawn(async move {
            let mut upstream = upstream;
            let mut reply_text = String::new();
            while let Some(item) = upstream.next().await {
                if let Ok(chunk) = &item {
                    reply_text.push_str(&chunk.text());
                }
                if tx.send(item).await.is_err() {
                    return;
                }
            }
            if !reply_text.is_empty() {
                history.lock().await.push(Content::model_text(reply_text));
            }
        });

        Ok(ReceiverStream::new(rx))
    }

    /// Number of turns recorded so far.
    pub async fn history_len(&self) -> usize {
        self.history.lock().await.len()
    }
}

// ── Title generation ─────────────────────────────────────────────

/// Fallback conversation title when generation fails.
pub const FALLBACK_TITLE: &str = "Suhbat";

/// Generate a short 3-5 word title for a conversation's first prompt.
/// Never fails: errors fall back to [`FALLBACK_TITLE`], an empty prompt
/// yields an empty title.
pub async fn generate_title(client: &GenAiClient, prompt: &str) -> String {
    if prompt.is_empty() {
        return String::new();
    }
    let request = GenerateContentRequest {
        contents: vec![Content::user_text(format!(
            "Quyidagi so'rov uchun 3-5 so'zdan iborat qisqa sarlavha yarating. \
             Faqat sarlavhani o'zini qaytaring, qo'shtirnoqlarsiz: \"{prompt}\""
        ))],
        tools: None,
    };
    match client
        .generate_content(&client.config().chat_model, &request)
        .await
    {
        Ok(response) => response.text().trim().replace('"', ""),
        Err(e) => {
            tracing::warn!(error = %e, "title generation failed");
            FALLBACK_TITLE.to_string()
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
