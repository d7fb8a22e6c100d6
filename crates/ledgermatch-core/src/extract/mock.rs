//! Mock vision and OCR backends for testing
//!
//! Canned responses for every engine in the fallback chain, so the chain and
//! its decision logic can be exercised without a model server or native OCR
//! library.

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::prompts::PromptId;

use super::vision::VisionBackend;

/// Mock vision backend with a configurable canned response
#[derive(Clone)]
pub struct MockVisionBackend {
    response: std::result::Result<String, String>,
    tip_response: Option<String>,
    healthy: bool,
}

impl MockVisionBackend {
    /// Respond with the given text for every generate call
    pub fn with_response(response: impl Into<String>) -> Self {
        Self {
            response: Ok(response.into()),
            tip_response: None,
            healthy: true,
        }
    }

    /// Fail every generate call
    pub fn failing(error: impl Into<String>) -> Self {
        Self {
            response: Err(error.into()),
            tip_response: None,
            healthy: false,
        }
    }

    /// A clean structured response for a typical receipt
    pub fn well_formed() -> Self {
        Self::with_response(
            r#"{"merchant": "Target", "date": "2024-01-15", "subtotal": 25.00, "total": 27.00}"#,
        )
    }

    /// A looping-decoder response that the garble detector must reject
    pub fn garbled() -> Self {
        Self::with_response(
            "total total total total total total total total total total total total total",
        )
    }

    /// Separate canned response for the tip-recovery prompt
    pub fn with_tip_response(mut self, response: impl Into<String>) -> Self {
        self.tip_response = Some(response.into());
        self
    }
}

#[async_trait]
impl VisionBackend for MockVisionBackend {
    async fn generate(&self, _image: &[u8], prompt: PromptId) -> Result<String> {
        if prompt == PromptId::ReadTip {
            if let Some(tip) = &self.tip_response {
                return Ok(tip.clone());
            }
        }
        match &self.response {
            Ok(text) => Ok(text.clone()),
            Err(message) => Err(Error::InvalidData(message.clone())),
        }
    }

    async fn health_check(&self) -> bool {
        self.healthy
    }

    fn model(&self) -> &str {
        "mock"
    }

    fn host(&self) -> &str {
        "mock://localhost"
    }
}

/// Mock OCR engine returning canned text
#[derive(Clone)]
pub struct MockOcrEngine {
    text: std::result::Result<String, String>,
}

impl MockOcrEngine {
    /// Recognize every image as the given text
    pub fn with_text(text: impl Into<String>) -> Self {
        Self {
            text: Ok(text.into()),
        }
    }

    /// Fail every recognition
    pub fn failing(error: impl Into<String>) -> Self {
        Self {
            text: Err(error.into()),
        }
    }

    pub(crate) fn recognize_text(&self) -> Result<String> {
        match &self.text {
            Ok(text) => Ok(text.clone()),
            Err(message) => Err(Error::Ocr(message.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_vision_roundtrip() {
        let backend = MockVisionBackend::well_formed();
        assert!(backend.health_check().await);
        let response = backend.generate(b"img", PromptId::ParseReceipt).await.unwrap();
        assert!(response.contains("Target"));
    }

    #[tokio::test]
    async fn test_mock_vision_tip_prompt_routing() {
        let backend = MockVisionBackend::well_formed().with_tip_response(r#"{"tip": 3.50}"#);
        let tip = backend.generate(b"img", PromptId::ReadTip).await.unwrap();
        assert!(tip.contains("3.5"));
    }

    #[tokio::test]
    async fn test_mock_vision_failure() {
        let backend = MockVisionBackend::failing("model offline");
        assert!(!backend.health_check().await);
        assert!(backend.generate(b"img", PromptId::ParseReceipt).await.is_err());
    }

    #[test]
    fn test_mock_ocr() {
        let engine = MockOcrEngine::with_text("WENDY'S\nTOTAL 8.42");
        assert!(engine.recognize_text().unwrap().contains("WENDY'S"));
        assert!(MockOcrEngine::failing("no lib").recognize_text().is_err());
    }
}
