//! Long-running video generation: operation model and polling loop.
//!
//! The service answers a generation request with an operation handle
//! that must be refreshed until `done`. The poller does that on a fixed
//! interval, surfacing progress through a callback, and materializes the
//! finished payload as a local temp file. Jobs run for minutes, so a
//! fixed interval is deliberate — backoff buys nothing here.
//!
//! Unlike the session primitives, the poller takes an explicit
//! cancellation token, honored at every suspension point; abandoned
//! polls do not keep hitting the network.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::client::{GenAiClient, GenAiError};

/// Fixed delay between status refreshes.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

// ── Operation model ──────────────────────────────────────────────

/// One server-side asynchronous video job. `done` is tri-state: absent
/// until first fetched, then `false` while running, `true` when
/// terminal — at which point exactly one of `error` / `response` is
/// populated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VideoOperation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<OperationProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<OperationResponse>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationProgress {
    /// Completion fraction in [0, 1].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationResponse {
    #[serde(rename = "generatedVideos", default)]
    pub generated_videos: Vec<GeneratedVideo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneratedVideo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<VideoRef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VideoRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

impl VideoOperation {
    pub fn is_done(&self) -> bool {
        self.done == Some(true)
    }

    /// Reported completion fraction, 0 when not yet reported.
    pub fn progress_fraction(&self) -> f64 {
        self.progress
            .as_ref()
            .and_then(|p| p.progress)
            .unwrap_or(0.0)
    }

    /// Download URI of the first generated video, if present.
    pub fn download_uri(&self) -> Option<&str> {
        self.response
            .as_ref()?
            .generated_videos
            .first()?
            .video
            .as_ref()?
            .uri
            .as_deref()
    }
}

// ── Errors ───────────────────────────────────────────────────────

/// Terminal poller failures. None of these are retried.
#[derive(Debug, Error)]
pub enum GenerationError {
    /// The job finished with a server-reported error.
    #[error("video generation failed: {0}")]
    Failed(String),

    /// The job finished without a result payload — a contract violation
    /// by the remote service, not a transient failure.
    #[error("video generation completed but no download link found")]
    MissingResult,

    /// The caller cancelled the poll.
    #[error("video generation cancelled")]
    Cancelled,

    /// Transport or decoding failure talking to the service.
    #[error(transparent)]
    Client(#[from] GenAiError),
}

// ── Operation source seam ────────────────────────────────────────

/// Where operation refreshes and result payloads come from. The
/// production impl is [`GenAiClient`]; tests script their own.
#[async_trait]
pub trait OperationSource: Send + Sync {
    async fn refresh(&self, operation: &VideoOperation) -> Result<VideoOperation, GenAiError>;
    async fn fetch_result(&self, uri: &str) -> Result<tempfile::NamedTempFile, GenAiError>;
}

#[async_trait]
impl OperationSource for GenAiClient {
    async fn refresh(&self, operation: &VideoOperation) -> Result<VideoOperation, GenAiError> {
        let name = operation
            .name
            .as_deref()
            .ok_or_else(|| GenAiError::InvalidRequest("operation has no name".to_string()))?;
        self.get_operation(name).await
    }

    async fn fetch_result(&self, uri: &str) -> Result<tempfile::NamedTempFile, GenAiError> {
        self.download_to_file(uri).await
    }
}

// ── Result handle ────────────────────────────────────────────────

/// A locally materialized, playable video. The backing file is deleted
/// when the handle is dropped.
#[derive(Debug)]
pub struct VideoHandle {
    file: tempfile::NamedTempFile,
}

impl VideoHandle {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Persist the file to a caller-chosen location instead of deleting
    /// it on drop.
    pub fn persist(self, to: &Path) -> Result<(), std::io::Error> {
        self.file.persist(to).map(|_| ()).map_err(|e| e.error)
    }
}

// ── Poller ───────────────────────────────────────────────────────

/// Drive an operation to completion at the standard interval.
pub async fn poll_operation<S, F>(
    source: &S,
    operation: VideoOperation,
    on_progress: F,
    cancel: &CancellationToken,
) -> Result<VideoHandle, GenerationError>
where
    S: OperationSource + ?Sized,
    F: FnMut(&str, Option<&Path>),
{
    poll_operation_every(source, operation, on_progress, cancel, POLL_INTERVAL).await
}

/// Poll with a caller-chosen interval. While the job runs, `on_progress`
/// receives a status line with the rounded percentage; on success it
/// receives the ready message plus the local path, and the handle is
/// returned.
pub async fn poll_operation_every<S, F>(
    source: &S,
    mut operation: VideoOperation,
    mut on_progress: F,
    cancel: &CancellationToken,
    interval: Duration,
) -> Result<VideoHandle, GenerationError>
where
    S: OperationSource + ?Sized,
    F: FnMut(&str, Option<&Path>),
{
    while !operation.is_done() {
        let percent = (operation.progress_fraction() * 100.0).round() as u32;
        on_progress(
            &format!("Video generatsiya qilinmoqda... ({percent}%)"),
            None,
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(GenerationError::Cancelled),
            _ = tokio::time::sleep(interval) => {}
        }

        operation = tokio::select! {
            _ = cancel.cancelled() => return Err(GenerationError::Cancelled),
            refreshed = source.refresh(&operation) => refreshed?,
        };
    }

    if let Some(error) = &operation.error {
        return Err(GenerationError::Failed(
            error
                .message
                .clone()
                .unwrap_or_else(|| "unknown error".to_string()),
        ));
    }

    let uri = operation
        .download_uri()
        .ok_or(GenerationError::MissingResult)?;

    tracing::info!(uri, "video ready, downloading");
    let file = tokio::select! {
        _ = cancel.cancelled() => return Err(GenerationError::Cancelled),
        fetched = source.fetch_result(uri) => fetched?,
    };

    let handle = VideoHandle { file };
    on_progress("Video tayyor!", Some(handle.path()));
    Ok(handle)
}

/// Submit a generation job and poll it to completion.
pub async fn generate_video<F>(
    client: &GenAiClient,
    prompt: &str,
    image_base64: &str,
    image_mime: &str,
    on_progress: F,
    cancel: &CancellationToken,
) -> Result<VideoHandle, GenerationError>
where
    F: FnMut(&str, Option<&Path>),
{
    let operation = client
        .generate_videos(prompt, image_base64, image_mime)
        .await?;
    tracing::info!(
        operation = operation.name.as_deref().unwrap_or("<unnamed>"),
        "video generation started"
    );
    poll_operation(client, operation, on_progress, cancel).await
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::io::Write;

    /// Scripted operation source: returns the queued states in order.
    struct ScriptedSource {
        states: Mutex<Vec<VideoOperation>>,
        refreshes: Mutex<u32>,
        downloads: Mutex<Vec<String>>,
    }

    impl ScriptedSource {
        fn new(states: Vec<VideoOperation>) -> Self {
            Self {
                states: Mutex::new(states),
                refreshes: Mutex::new(0),
                downloads: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl OperationSource for ScriptedSource {
        async fn refresh(&self, _: &VideoOperation) -> Result<VideoOperation, GenAiError> {
            *self.refreshes.lock() += 1;
            let mut states = self.states.lock();
            if states.is_empty() {
                return Err(GenAiError::InvalidRequest("script exhausted".to_string()));
            }
            Ok(states.remove(0))
        }

        async fn fetch_result(&self, uri: &str) -> Result<tempfile::NamedTempFile, GenAiError> {
            self.downloads.lock().push(uri.to_string());
            let mut file = tempfile::NamedTempFile::new()?;
            file.write_all(b"video-bytes")?;
            Ok(file)
        }
    }

    fn running(progress: f64) -> VideoOperation {
        VideoOperation {
            name: Some("operations/op-1".to_string()),
            done: Some(false),
            progress: Some(OperationProgress {
                progress: Some(progress),
            }),
            ..VideoOperation::default()
        }
    }

    fn finished_with_uri(uri: &str) -> VideoOperation {
        VideoOperation {
            name: Some("operations/op-1".to_string()),
            done: Some(true),
            response: Some(OperationResponse {
                generated_videos: vec![GeneratedVideo {
                    video: Some(VideoRef {
                        uri: Some(uri.to_string()),
                    }),
                }],
            }),
            ..VideoOperation::default()
        }
    }

    fn fast() -> Duration {
        Duration::from_millis(5)
    }

    #[tokio::test]
    async fn polls_until_done_and_resolves_with_result() {
        // done unreported -> false -> true with a result.
        let source = ScriptedSource::new(vec![
            running(0.4),
            finished_with_uri("https://example.com/v.mp4"),
        ]);
        let initial = VideoOperation {
            name: Some("operations/op-1".to_string()),
            ..VideoOperation::default()
        };

        let progress: Mutex<Vec<String>> = Mutex::new(Vec::new());
        let cancel = CancellationToken::new();
        let handle = poll_operation_every(
            &source,
            initial,
            |status, _| progress.lock().push(status.to_string()),
            &cancel,
            fast(),
        )
        .await
        .unwrap();

        let progress = progress.lock();
        // Reported before each wait, plus the ready message at the end.
        assert_eq!(progress.len(), 3);
        assert_eq!(progress[0], "Video generatsiya qilinmoqda... (0%)");
        assert_eq!(progress[1], "Video generatsiya qilinmoqda... (40%)");
        assert_eq!(progress[2], "Video tayyor!");
        assert_eq!(*source.refreshes.lock(), 2);
        assert_eq!(
            *source.downloads.lock(),
            vec!["https://example.com/v.mp4".to_string()]
        );
        assert_eq!(std::fs::read(handle.path()).unwrap(), b"video-bytes");
    }

    #[tokio::test]
    async fn server_error_rejects_without_success_path() {
        let mut failed = VideoOperation {
            name: Some("operations/op-1".to_string()),
            done: Some(true),
            ..VideoOperation::default()
        };
        failed.error = Some(OperationError {
            message: Some("unsafe prompt".to_string()),
        });

        let source = ScriptedSource::new(vec![failed]);
        let cancel = CancellationToken::new();
        let mut saw_ready = false;
        let err = poll_operation_every(
            &source,
            running(0.1),
            |_, path| saw_ready |= path.is_some(),
            &cancel,
            fast(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, GenerationError::Failed(m) if m.contains("unsafe prompt")));
        assert!(!saw_ready, "success path must not run");
        assert!(source.downloads.lock().is_empty());
    }

    #[tokio::test]
    async fn done_without_result_is_a_contract_violation() {
        let done_empty = VideoOperation {
            name: Some("operations/op-1".to_string()),
            done: Some(true),
            ..VideoOperation::default()
        };
        let source = ScriptedSource::new(vec![done_empty]);
        let cancel = CancellationToken::new();
        let err = poll_operation_every(&source, running(0.9), |_, _| {}, &cancel, fast())
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::MissingResult));
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop_at_the_sleep() {
        let source = ScriptedSource::new(vec![running(0.1); 1000]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = poll_operation_every(
            &source,
            running(0.0),
            |_, _| {},
            &cancel,
            Duration::from_secs(3600),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, GenerationError::Cancelled));
        assert_eq!(*source.refreshes.lock(), 0, "no refresh after cancel");
    }

    #[tokio::test]
    async fn refresh_failure_propagates() {
        let source = ScriptedSource::new(vec![]);
        let cancel = CancellationToken::new();
        let err = poll_operation_every(&source, running(0.0), |_, _| {}, &cancel, fast())
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Client(_)));
    }

    #[test]
    fn operation_deserializes_service_shape() {
        let op: VideoOperation = serde_json::from_value(serde_json::json!({
            "name": "operations/abc",
            "done": true,
            "response": {
                "generatedVideos": [{"video": {"uri": "https://dl.example/v.mp4"}}]
            }
        }))
        .unwrap();
        assert!(op.is_done());
        assert_eq!(op.download_uri(), Some("https://dl.example/v.mp4"));
    }

    #[test]
    fn unfetched_operation_is_not_done() {
        let op = VideoOperation::default();
        assert!(!op.is_done());
        assert_eq!(op.progress_fraction(), 0.0);
        assert_eq!(op.download_uri(), None);
    }

    #[test]
    fn progress_percent_rounds() {
        let op = running(0.666);
        assert_eq!((op.progress_fraction() * 100.0).round() as u32, 67);
    }
}
