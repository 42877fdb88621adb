//! Engine configuration and credential resolution.
//!
//! The configuration is built once at process start and threaded through
//! every component that talks to the remote service. Credentials are
//! resolved through the [`CredentialProvider`] trait on every call rather
//! than captured at construction, so a rotated key takes effect on the
//! next request without rebuilding any client.

// ── Credentials ──────────────────────────────────────────────────

/// Source of the API key used for remote calls.
///
/// Consulted immediately before each request. Implementations may cache,
/// re-read the environment, or talk to a secret store.
pub trait CredentialProvider: Send + Sync {
    /// Return the current API key, or `None` if no key is available.
    fn api_key(&self) -> Option<String>;
}

/// Reads the API key from an environment variable on every call.
#[derive(Debug, Clone)]
pub struct EnvCredentials {
    var: String,
}

impl EnvCredentials {
    /// Read from a custom environment variable.
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvCredentials {
    fn default() -> Self {
        Self::new("GEMINI_API_KEY")
    }
}

impl CredentialProvider for EnvCredentials {
    fn api_key(&self) -> Option<String> {
        std::env::var(&self.var).ok().filter(|k| !k.is_empty())
    }
}

/// A fixed API key, for tests and embedding scenarios.
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    key: String,
}

impl StaticCredentials {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl CredentialProvider for StaticCredentials {
    fn api_key(&self) -> Option<String> {
        if self.key.is_empty() {
            None
        } else {
            Some(self.key.clone())
        }
    }
}

// ── Configuration ────────────────────────────────────────────────

/// Remote service endpoints and model selection.
#[derive(Debug, Clone)]
pub struct GenAiConfig {
    /// REST base URL (no trailing slash).
    pub base_url: String,
    /// WebSocket endpoint for the bidirectional live session.
    pub live_endpoint: String,
    /// Model for chat, title generation and image analysis.
    pub chat_model: String,
    /// Native-audio model for the live voice session.
    pub live_model: String,
    /// Image generation model.
    pub image_model: String,
    /// Video generation model.
    pub video_model: String,
    /// Prebuilt voice used for spoken replies in the live session.
    pub voice_name: String,
}

impl Default for GenAiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://generativelanguage.googleapis.com".to_string(),
            live_endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
            chat_model: "gemini-2.5-flash".to_string(),
            live_model: "gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
            image_model: "imagen-4.0-generate-001".to_string(),
            video_model: "veo-3.1-fast-generate-preview".to_string(),
            voice_name: "Zephyr".to_string(),
        }
    }
}

impl GenAiConfig {
    /// Defaults with `TAMUR_BASE_URL` / `TAMUR_LIVE_ENDPOINT` overrides
    /// applied, for pointing the engine at a proxy or a mock.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("TAMUR_BASE_URL") {
            if !url.is_empty() {
                config.base_url = url.trim_end_matches('/').to_string();
            }
        }
        if let Ok(url) = std::env::var("TAMUR_LIVE_ENDPOINT") {
            if !url.is_empty() {
                config.live_endpoint = url;
            }
        }
        config
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_credentials_return_key() {
        let creds = StaticCredentials::new("test-key");
        assert_eq!(creds.api_key(), Some("test-key".to_string()));
    }

    #[test]
    fn static_credentials_empty_is_none() {
        let creds = StaticCredentials::new("");
        assert_eq!(creds.api_key(), None);
    }

    #[test]
    fn env_credentials_missing_var_is_none() {
        let creds = EnvCredentials::new("TAMUR_TEST_KEY_THAT_DOES_NOT_EXIST");
        assert_eq!(creds.api_key(), None);
    }

    #[test]
    fn default_config_models() {
        let config = GenAiConfig::default();
        assert_eq!(config.chat_model, "gemini-2.5-flash");
        assert!(config.live_model.contains("native-audio"));
        assert!(config.base_url.starts_with("https://"));
        assert!(config.live_endpoint.starts_with("wss://"));
        assert_eq!(config.voice_name, "Zephyr");
    }
}
