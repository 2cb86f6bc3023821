//! OpenAI-compatible backend (`POST /v1/chat/completions`).

use crate::parse::parse_analysis;
use crate::status_error;
use crate::prompt::{PROCTOR_PROMPT, SCREEN_PROMPT};
use base64::prelude::*;
use examguard_core::{AnalysisGateway, AnalysisResult, ExamGuardError, Frame, Result};
use reqwest::Client;
use serde_json::{json, Value};

/// Gateway to an OpenAI-compatible chat completions endpoint with image input.
pub struct OpenAiGateway {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl OpenAiGateway {
    /// Create a gateway. `base_url` is e.g. `https://api.openai.com`.
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
        }
    }

    fn payload(&self, frame: &Frame) -> Value {
        let image = |bytes: &[u8]| {
            json!({
                "type": "image_url",
                "image_url": { "url": format!("data:image/jpeg;base64,{}", BASE64_STANDARD.encode(bytes)) }
            })
        };

        let mut content = vec![json!({ "type": "text", "text": PROCTOR_PROMPT })];
        if frame.secondary.is_some() {
            content.push(json!({ "type": "text", "text": SCREEN_PROMPT }));
        }
        content.push(image(&frame.primary));
        if let Some(screen) = &frame.secondary {
            content.push(image(screen));
        }

        json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": content }],
            "max_tokens": 500,
            "temperature": 0.3,
        })
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

#[async_trait::async_trait]
impl AnalysisGateway for OpenAiGateway {
    async fn analyze(&self, frame: &Frame) -> Result<AnalysisResult> {
        let resp = self
            .request(
                self.client
                    .post(format!("{}/v1/chat/completions", self.base_url))
                    .json(&self.payload(frame)),
            )
            .send()
            .await
            .map_err(|e| ExamGuardError::Gateway(format!("openai request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(status_error("openai", resp).await);
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| ExamGuardError::Gateway(format!("openai response unreadable: {e}")))?;

        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| {
                ExamGuardError::InvalidAnalysis("completion has no message content".to_string())
            })?;
        parse_analysis(content)
    }

    fn name(&self) -> &'static str {
        "openai"
    }

    async fn health_check(&self) -> Result<()> {
        let resp = self
            .request(self.client.get(format!("{}/v1/models", self.base_url)))
            .send()
            .await
            .map_err(|e| ExamGuardError::Gateway(format!("openai unreachable: {e}")))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(status_error("openai", resp).await)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use examguard_core::IssueKind;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        format!("http://{addr}")
    }

    fn mock_openai() -> Router {
        async fn completions(headers: HeaderMap, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
            if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some("Bearer sk-test") {
                return (StatusCode::UNAUTHORIZED, Json(json!({"error": "bad key"})));
            }
            let parts = body["messages"][0]["content"].as_array().cloned().unwrap_or_default();
            let images = parts.iter().filter(|p| p["type"] == "image_url").count();
            let url = parts
                .iter()
                .find(|p| p["type"] == "image_url")
                .and_then(|p| p["image_url"]["url"].as_str())
                .unwrap_or_default()
                .to_string();
            assert!(url.starts_with("data:image/jpeg;base64,"));

            let content = format!(
                "```json\n{{\"is_suspicious\": true, \"confidence\": 0.9, \"severity\": 3, \"alert_type\": \"{}\"}}\n```",
                if images == 2 { "suspicious_activity" } else { "multiple_people" }
            );
            (
                StatusCode::OK,
                Json(json!({ "choices": [{ "message": { "role": "assistant", "content": content } }] })),
            )
        }
        Router::new().route("/v1/chat/completions", post(completions))
    }

    #[tokio::test]
    async fn test_analyze_parses_fenced_content() {
        let url = serve(mock_openai()).await;
        let gw = OpenAiGateway::new(Client::new(), url, "gpt-4o", Some("sk-test".into()));
        let r = gw.analyze(&Frame::new(vec![9u8; 16])).await.unwrap();
        assert!(r.suspicious);
        assert!(r.issues.contains(&IssueKind::MultiplePeople));
    }

    #[tokio::test]
    async fn test_screen_capture_is_sent_as_second_image() {
        let url = serve(mock_openai()).await;
        let gw = OpenAiGateway::new(Client::new(), url, "gpt-4o", Some("sk-test".into()));
        let frame = Frame::new(vec![1u8]).with_secondary(vec![2u8]);
        let r = gw.analyze(&frame).await.unwrap();
        assert!(r.issues.contains(&IssueKind::SuspiciousActivity));
    }

    #[tokio::test]
    async fn test_rejected_key_carries_status() {
        let url = serve(mock_openai()).await;
        let gw = OpenAiGateway::new(Client::new(), url, "gpt-4o", None);
        assert!(matches!(
            gw.analyze(&Frame::new(vec![1u8])).await,
            Err(ExamGuardError::GatewayStatus { status: 401, .. })
        ));
    }
}
