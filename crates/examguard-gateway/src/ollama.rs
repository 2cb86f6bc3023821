//! Ollama backend (`POST /api/generate`).

use crate::parse::parse_analysis;
use crate::status_error;
use crate::prompt::build_prompt;
use base64::prelude::*;
use examguard_core::{AnalysisGateway, AnalysisResult, ExamGuardError, Frame, Result};
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Instant;
use tracing::debug;

/// Gateway to a local Ollama server running a vision model.
pub struct OllamaGateway {
    client: Client,
    base_url: String,
    model: String,
}

impl OllamaGateway {
    /// Create a gateway. `base_url` is e.g. `http://localhost:11434`.
    pub fn new(client: Client, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
        }
    }

    fn payload(&self, frame: &Frame) -> Value {
        let mut images = vec![BASE64_STANDARD.encode(&frame.primary)];
        if let Some(screen) = &frame.secondary {
            images.push(BASE64_STANDARD.encode(screen));
        }
        json!({
            "model": self.model,
            "prompt": build_prompt(frame.secondary.is_some()),
            "images": images,
            "stream": false,
            "format": "json",
            "options": {
                "temperature": 0.2,
                "top_p": 0.9,
                "top_k": 20,
                "num_predict": 256,
                "num_ctx": 2048,
            }
        })
    }
}

#[async_trait::async_trait]
impl AnalysisGateway for OllamaGateway {
    async fn analyze(&self, frame: &Frame) -> Result<AnalysisResult> {
        let started = Instant::now();
        let resp = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&self.payload(frame))
            .send()
            .await
            .map_err(|e| ExamGuardError::Gateway(format!("ollama request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(status_error("ollama", resp).await);
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| ExamGuardError::Gateway(format!("ollama response unreadable: {e}")))?;

        // Reasoning models sometimes put the JSON under "thinking".
        let content = [body.get("response"), body.get("thinking")]
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
            .find(|s| !s.trim().is_empty())
            .unwrap_or_default();

        debug!(
            model = %self.model,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Ollama inference completed"
        );
        parse_analysis(content)
    }

    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn health_check(&self) -> Result<()> {
        let resp = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await
            .map_err(|e| ExamGuardError::Gateway(format!("ollama unreachable: {e}")))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(status_error("ollama", resp).await)
        }
    }
}
