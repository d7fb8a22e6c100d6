//! HTTP backend for the primary vision-to-text model
//!
//! Talks to a local inference server (Ollama-style `/api/generate` with
//! base64 images). The model and its prompt are loaded once and shared;
//! per-call state is limited to the request itself.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::VisionConfig;
use crate::error::{Error, Result};
use crate::prompts::{PromptId, PromptLibrary};

use super::mock::MockVisionBackend;

/// Trait for the primary vision-to-text model
///
/// Implementations return the raw model response; parsing and garble
/// detection happen upstream so they stay engine-independent.
#[async_trait]
pub trait VisionBackend: Send + Sync {
    /// Run the model over an image with the given prompt
    async fn generate(&self, image: &[u8], prompt: PromptId) -> Result<String>;

    /// Check if the backend is reachable
    async fn health_check(&self) -> bool;

    /// Model name (for logging)
    fn model(&self) -> &str;

    /// Host URL (for logging)
    fn host(&self) -> &str;
}

/// Concrete vision client enum
///
/// Provides Clone and compile-time dispatch without Box<dyn> overhead.
#[derive(Clone)]
pub enum VisionClient {
    /// HTTP inference server
    Http(HttpVisionBackend),
    /// Mock backend for testing
    Mock(MockVisionBackend),
}

impl VisionClient {
    /// Create an HTTP client from config
    pub fn http(config: &VisionConfig) -> Self {
        Self::Http(HttpVisionBackend::new(
            &config.host,
            &config.model,
            config.timeout,
        ))
    }

    /// Create a mock backend for testing
    pub fn mock(backend: MockVisionBackend) -> Self {
        Self::Mock(backend)
    }
}

#[async_trait]
impl VisionBackend for VisionClient {
    async fn generate(&self, image: &[u8], prompt: PromptId) -> Result<String> {
        match self {
            Self::Http(b) => b.generate(image, prompt).await,
            Self::Mock(b) => b.generate(image, prompt).await,
        }
    }

    async fn health_check(&self) -> bool {
        match self {
            Self::Http(b) => b.health_check().await,
            Self::Mock(b) => b.health_check().await,
        }
    }

    fn model(&self) -> &str {
        match self {
            Self::Http(b) => b.model(),
            Self::Mock(b) => b.model(),
        }
    }

    fn host(&self) -> &str {
        match self {
            Self::Http(b) => b.host(),
            Self::Mock(b) => b.host(),
        }
    }
}

/// HTTP vision backend
pub struct HttpVisionBackend {
    http_client: Client,
    base_url: String,
    model: String,
    timeout: Duration,
    prompts: Arc<RwLock<PromptLibrary>>,
}

impl Clone for HttpVisionBackend {
    fn clone(&self) -> Self {
        Self {
            http_client: self.http_client.clone(),
            base_url: self.base_url.clone(),
            model: self.model.clone(),
            timeout: self.timeout,
            prompts: self.prompts.clone(),
        }
    }
}

impl HttpVisionBackend {
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Self {
        Self {
            http_client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            timeout,
            prompts: Arc::new(RwLock::new(PromptLibrary::new())),
        }
    }

    /// Create from environment variables (`VISION_HOST`, `VISION_MODEL`)
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("VISION_HOST").ok()?;
        let model =
            std::env::var("VISION_MODEL").unwrap_or_else(|_| "receipt-vision".to_string());
        Some(Self::new(&host, &model, Duration::from_secs(30)))
    }
}

/// Request to the inference server
#[derive(Debug, Serialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    images: Vec<String>,
    stream: bool,
}

/// Response from the inference server
#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

#[async_trait]
impl VisionBackend for HttpVisionBackend {
    async fn generate(&self, image: &[u8], prompt_id: PromptId) -> Result<String> {
        let prompt = {
            let mut prompts = self
                .prompts
                .write()
                .map_err(|_| Error::InvalidData("Failed to acquire prompt library lock".into()))?;
            let template = prompts.get(prompt_id)?;
            template.render_user(&HashMap::new())
        };

        let encoded = base64::engine::general_purpose::STANDARD.encode(image);
        let request = GenerateRequest {
            model: self.model.clone(),
            prompt,
            images: vec![encoded],
            stream: false,
        };

        let response = self
            .http_client
            .post(format!("{}/api/generate", self.base_url))
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Http(response.error_for_status().unwrap_err()));
        }

        let generate_response: GenerateResponse = response.json().await?;
        debug!(
            model = %self.model,
            chars = generate_response.response.len(),
            "Vision model response received"
        );

        Ok(generate_response.response)
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        match self.http_client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn host(&self) -> &str {
        &self.base_url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_backend_trims_trailing_slash() {
        let backend =
            HttpVisionBackend::new("http://localhost:11434/", "m", Duration::from_secs(5));
        assert_eq!(backend.host(), "http://localhost:11434");
        assert_eq!(backend.model(), "m");
    }

    #[tokio::test]
    async fn test_mock_client_generate() {
        let client = VisionClient::mock(MockVisionBackend::well_formed());
        let response = client.generate(b"bytes", PromptId::ParseReceipt).await.unwrap();
        assert!(response.contains("merchant"));
    }
}
