//! Vision-model analysis gateways for ExamGuard.
//!
//! Each gateway implements [`examguard_core::AnalysisGateway`]: it sends the
//! frame images (base64-encoded) to a vision model and normalises the reply
//! into an [`examguard_core::AnalysisResult`].
//!
//! - [`OllamaGateway`]: local Ollama server
//! - [`OpenAiGateway`]: OpenAI-compatible chat completions
//! - [`BreakerGateway`]: circuit breaker around either

pub mod circuit_breaker;
pub mod ollama;
pub mod openai;
pub mod parse;
pub mod prompt;

pub use circuit_breaker::{BreakerGateway, BreakerStatus, CircuitBreaker, CircuitState, FailureKind};
pub use ollama::OllamaGateway;
pub use openai::OpenAiGateway;
pub use parse::parse_analysis;

use examguard_core::{
    AnalysisGateway, CircuitBreakerConfig, ExamGuardError, GatewayConfig, GatewayProvider, Result,
};
use std::sync::Arc;
use std::time::Duration;

/// Build the configured gateway, wrapped in a circuit breaker when enabled.
///
/// `request_timeout` bounds each HTTP call; the engine applies its own
/// analysis timeout on top.
///
/// # Errors
///
/// [`ExamGuardError::Config`] if the HTTP client cannot be built.
pub fn build_gateway(
    config: &GatewayConfig,
    breaker: &CircuitBreakerConfig,
    request_timeout: Duration,
) -> Result<Arc<dyn AnalysisGateway>> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
        .timeout(request_timeout)
        .build()
        .map_err(|e| ExamGuardError::Config(format!("failed to build HTTP client: {e}")))?;

    match config.provider {
        GatewayProvider::Ollama => {
            let gw = OllamaGateway::new(client, config.base_url.clone(), config.model.clone());
            Ok(wrap(gw, breaker))
        }
        GatewayProvider::OpenAi => {
            let gw = OpenAiGateway::new(
                client,
                config.base_url.clone(),
                config.model.clone(),
                config.api_key.clone(),
            );
            Ok(wrap(gw, breaker))
        }
    }
}

/// Longest response-body prefix kept in a status error.
const ERROR_BODY_PREVIEW: usize = 200;

/// Turn a non-success reply into [`ExamGuardError::GatewayStatus`].
pub(crate) async fn status_error(backend: &str, resp: reqwest::Response) -> ExamGuardError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    let preview: String = body.trim().chars().take(ERROR_BODY_PREVIEW).collect();
    ExamGuardError::GatewayStatus {
        status,
        detail: format!("{backend}: {preview}"),
    }
}

fn wrap<G: AnalysisGateway + 'static>(
    gateway: G,
    breaker: &CircuitBreakerConfig,
) -> Arc<dyn AnalysisGateway> {
    if breaker.enabled {
        Arc::new(BreakerGateway::new(
            gateway,
            CircuitBreaker::from_config(breaker),
        ))
    } else {
        Arc::new(gateway)
    }
}
