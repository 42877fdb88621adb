//! One-shot media calls: image generation and image analysis.

use crate::chat::{Attachment, AttachmentKind};
use crate::client::{Content, GenAiClient, GenAiError, GenerateContentRequest, Part};

/// A generated image, carried as a data URI so the UI can render it
/// without another fetch.
#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub data_uri: String,
    pub alt_text: String,
}

impl GeneratedImage {
    /// Attachment form for the chat data model.
    pub fn into_attachment(self) -> Attachment {
        Attachment {
            kind: AttachmentKind::Image,
            data: self.data_uri,
            mime_type: "image/jpeg".to_string(),
        }
    }
}

/// Generate one square JPEG for the prompt.
pub async fn generate_image(
    client: &GenAiClient,
    prompt: &str,
) -> Result<Vec<GeneratedImage>, GenAiError> {
    let body = serde_json::json!({
        "instances": [{"prompt": prompt}],
        "parameters": {
            "sampleCount": 1,
            "aspectRatio": "1:1",
            "outputMimeType": "image/jpeg",
        },
    });
    let model = client.config().image_model.clone();
    let response = client.predict(&model, &body).await?;

    let predictions = response
        .get("predictions")
        .and_then(|p| p.as_array())
        .cloned()
        .unwrap_or_default();

    let images = predictions
        .iter()
        .filter_map(|p| p.get("bytesBase64Encoded").and_then(|b| b.as_str()))
        .map(|b64| GeneratedImage {
            data_uri: format!("data:image/jpeg;base64,{b64}"),
            alt_text: prompt.to_string(),
        })
        .collect();
    Ok(images)
}

/// Describe an uploaded image: inline bytes plus the user's question.
pub async fn analyze_image(
    client: &GenAiClient,
    prompt: &str,
    image_base64: &str,
    mime_type: &str,
) -> Result<String, GenAiError> {
    let request = GenerateContentRequest {
        contents: vec![Content {
            role: Some("user".to_string()),
            parts: vec![Part::inline(mime_type, image_base64), Part::text(prompt)],
        }],
        tools: None,
    };
    let response = client
        .generate_content(&client.config().chat_model, &request)
        .await?;
    Ok(response.text())
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GenAiConfig, StaticCredentials};
    use std::sync::Arc;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> GenAiClient {
        let config = GenAiConfig {
            base_url: server.uri(),
            ..GenAiConfig::default()
        };
        GenAiClient::new(config, Arc::new(StaticCredentials::new("test-key"))).unwrap()
    }

    #[tokio::test]
    async fn generate_image_maps_predictions_to_data_uris() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/imagen-4.0-generate-001:predict"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "predictions": [{"bytesBase64Encoded": "QUJD", "mimeType": "image/jpeg"}]
            })))
            .mount(&server)
            .await;

        let images = generate_image(&client_for(&server), "a yurt at dawn")
            .await
            .unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].data_uri, "data:image/jpeg;base64,QUJD");
        assert_eq!(images[0].alt_text, "a yurt at dawn");

        let attachment = images.into_iter().next().unwrap().into_attachment();
        assert_eq!(attachment.kind, AttachmentKind::Image);
    }

    #[tokio::test]
    async fn generate_image_with_no_predictions_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let images = generate_image(&client_for(&server), "x").await.unwrap();
        assert!(images.is_empty());
    }

    #[tokio::test]
    async fn analyze_image_sends_inline_data_and_returns_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-2.5-flash:generateContent"))
            .and(body_string_contains("inlineData"))
            .and(body_string_contains("image/png"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "candidates": [{"content": {"parts": [{"text": "Bu bir ot."}]}}]
            })))
            .mount(&server)
            .await;

        let text = analyze_image(&client_for(&server), "nima bu?", "QUJD", "image/png")
            .await
            .unwrap();
        assert_eq!(text, "Bu bir ot.");
    }
}
