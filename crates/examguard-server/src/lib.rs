//! ExamGuard server: library interface.
//!
//! Wires the risk engine, analysis gateway, event and evidence stores into an axum
//! router. Exposed as a library so integration tests can build the router
//! against a mock gateway.

pub mod api;
pub mod config;
pub mod logging;
pub mod shutdown;
pub mod stream;

use axum::routing::{get, post};
use axum::Router;
use examguard_core::{AnalysisGateway, EventSink, EvidenceStore, ExamGuardConfig};
use examguard_engine::{EventDispatcher, RiskEngine, ShutdownCoordinator};
use examguard_storage::{InMemoryEventStore, InMemoryEvidenceStore};
use std::sync::Arc;

/// Shared application state passed to all handlers.
pub struct AppState {
    /// Server configuration.
    pub config: ExamGuardConfig,
    /// Session risk engine.
    pub engine: RiskEngine,
    /// Event history backing `/events` and `/report`.
    pub store: Arc<InMemoryEventStore>,
    /// Alert frames, when evidence capture is enabled.
    pub evidence: Option<Arc<InMemoryEvidenceStore>>,
    /// Shutdown coordination shared with the engine and SSE streams.
    pub shutdown: ShutdownCoordinator,
}

/// Build the shared [`AppState`], constructing the gateway from configuration.
pub fn build_app_state(config: ExamGuardConfig) -> anyhow::Result<Arc<AppState>> {
    let gateway = examguard_gateway::build_gateway(
        &config.gateway,
        &config.circuit_breaker,
        config.risk.analysis_timeout(),
    )
    .map_err(|e| anyhow::anyhow!("Failed to initialize analysis gateway: {}", e))?;
    build_app_state_with(config, gateway)
}

/// Build the shared [`AppState`] around an existing gateway.
pub fn build_app_state_with(
    config: ExamGuardConfig,
    gateway: Arc<dyn AnalysisGateway>,
) -> anyhow::Result<Arc<AppState>> {
    let store = Arc::new(InMemoryEventStore::new());
    let shutdown = ShutdownCoordinator::new(config.shutdown.timeout_seconds);
    let dispatcher = EventDispatcher::new(
        config.dispatcher.observer_buffer,
        Some(Arc::clone(&store) as Arc<dyn EventSink>),
    );
    let evidence = config
        .evidence
        .enabled
        .then(|| Arc::new(InMemoryEvidenceStore::new(config.evidence.max_items)));
    let engine = RiskEngine::with_evidence(
        config.risk.clone(),
        gateway,
        dispatcher,
        shutdown.clone(),
        evidence
            .as_ref()
            .map(|store| Arc::clone(store) as Arc<dyn EvidenceStore>),
    )
    .map_err(|e| anyhow::anyhow!("Invalid risk configuration: {}", e))?;

    Ok(Arc::new(AppState {
        config,
        engine,
        store,
        evidence,
        shutdown,
    }))
}

/// Build the axum [`Router`] with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route(
            "/api/v1/sessions",
            post(api::create_session).get(api::list_sessions),
        )
        .route("/api/v1/sessions/:id", get(api::get_session))
        .route("/api/v1/sessions/:id/frames", post(api::submit_frame))
        .route("/api/v1/sessions/:id/signals", post(api::report_signal))
        .route("/api/v1/sessions/:id/submit", post(api::submit_session))
        .route("/api/v1/sessions/:id/terminate", post(api::terminate_session))
        .route("/api/v1/sessions/:id/close", post(api::close_session))
        .route("/api/v1/sessions/:id/events", get(api::list_events))
        .route("/api/v1/sessions/:id/report", get(api::get_report))
        .route("/api/v1/sessions/:id/stream", get(stream::session_stream))
        .route("/api/v1/exams/:exam_id/stream", get(stream::exam_stream))
        .route("/api/v1/evidence/:evidence_id", get(api::get_evidence))
        .with_state(state)
}
