//! REST handlers for sessions, frames, signals and event history.
//!
//! Engine errors map onto HTTP statuses in [`engine_error`]. Frame
//! rejections are not errors: a busy session answers `429` with the
//! rejection reason so clients can simply retry with the next capture.

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use examguard_core::{
    ApplyOutcome, ExamGuardError, ExamId, Frame, FrameDecision, NewSession, RejectReason,
    SessionId, SessionSnapshot, SignalKind, SubmitOutcome, TerminationReason,
};
use examguard_engine::BehaviorReport;
use examguard_storage::EventQuery;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::AppState;

// ---------------------------------------------------------------------------
// Request & response types
// ---------------------------------------------------------------------------

/// Body of `POST /api/v1/sessions`.
#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub session_id: String,
    pub exam_id: String,
    #[serde(default)]
    pub student_id: Option<String>,
    /// Per-exam override of the configured auto-submit threshold.
    #[serde(default)]
    pub auto_submit_threshold: Option<f64>,
    /// Exam duration; the session is submitted when it runs out.
    #[serde(default)]
    pub time_limit_seconds: Option<u64>,
}

/// Body of `POST /api/v1/sessions/:id/frames`.
///
/// Images are base64, optionally as a `data:` URL.
#[derive(Debug, Deserialize)]
pub struct FrameRequest {
    /// Webcam capture.
    pub image: String,
    /// Optional screen capture analysed together with the webcam frame.
    #[serde(default)]
    pub screen: Option<String>,
}

/// Body of `POST /api/v1/sessions/:id/signals`.
#[derive(Debug, Deserialize)]
pub struct SignalRequest {
    /// `tab_switch`, `window_blur`, `fullscreen_exit` or `copy_paste`.
    pub signal: String,
}

/// Body of `POST /api/v1/sessions/:id/terminate`.
#[derive(Debug, Deserialize)]
pub struct TerminateRequest {
    pub reason: String,
}

/// Query parameters for `GET /api/v1/sessions`.
#[derive(Debug, Deserialize)]
pub struct ListSessionsParams {
    pub exam_id: Option<String>,
}

/// Query parameters for `GET /api/v1/sessions/:id/events`.
#[derive(Debug, Deserialize)]
pub struct ListEventsParams {
    /// Only events of this type (`alert`, `positive_feedback`, ...).
    pub kind: Option<String>,
    /// Only events at or after this instant (RFC 3339).
    pub since: Option<DateTime<Utc>>,
    /// Maximum number of results (default 100, max 1000).
    pub limit: Option<usize>,
    /// Number of results to skip (default 0).
    pub offset: Option<usize>,
}

/// Answer to a frame submission.
#[derive(Debug, Serialize)]
pub struct FrameResponse {
    /// `accepted` or `rejected`.
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
}

/// Outcome of a mutation together with the resulting session state.
#[derive(Debug, Serialize)]
pub struct MutationResponse {
    pub outcome: &'static str,
    pub session: SessionSnapshot,
}

/// Paginated event history.
#[derive(Debug, Serialize)]
pub struct EventsResponse<T: Serialize> {
    pub data: Vec<T>,
    /// Matching events before pagination.
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

/// API error response body.
#[derive(Debug, Serialize)]
struct ApiError {
    error: ApiErrorDetail,
}

/// Inner error detail.
#[derive(Debug, Serialize)]
struct ApiErrorDetail {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Default page size for event history.
const DEFAULT_LIMIT: usize = 100;

/// Maximum page size for event history.
const MAX_LIMIT: usize = 1000;

/// Build a JSON error response.
fn api_error(status: StatusCode, error_type: &str, message: &str) -> Response {
    let body = ApiError {
        error: ApiErrorDetail {
            message: message.to_string(),
            error_type: error_type.to_string(),
        },
    };
    (status, Json(body)).into_response()
}

/// Map an engine error onto an HTTP response.
pub(crate) fn engine_error(err: ExamGuardError) -> Response {
    let (status, error_type) = match &err {
        ExamGuardError::SessionUnknown(_) => (StatusCode::NOT_FOUND, "session_unknown"),
        ExamGuardError::AlreadyExists(_) => (StatusCode::CONFLICT, "already_exists"),
        ExamGuardError::NotTerminal(_) => (StatusCode::CONFLICT, "not_terminal"),
        ExamGuardError::Config(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
        ExamGuardError::Gateway(_)
        | ExamGuardError::GatewayStatus { .. }
        | ExamGuardError::InvalidAnalysis(_) => {
            (StatusCode::BAD_GATEWAY, "gateway_error")
        }
        ExamGuardError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "api_error"),
    };
    api_error(status, error_type, &err.to_string())
}

/// Decode a base64 image, accepting an optional `data:<mime>;base64,` prefix.
fn decode_image(encoded: &str) -> Result<Vec<u8>, String> {
    let payload = match encoded.strip_prefix("data:") {
        Some(rest) => rest
            .split_once(',')
            .map(|(_, data)| data)
            .ok_or_else(|| "malformed data URL".to_string())?,
        None => encoded,
    };
    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|e| format!("invalid base64 image: {e}"))?;
    if bytes.is_empty() {
        return Err("image is empty".to_string());
    }
    Ok(bytes)
}

fn apply_outcome_str(outcome: ApplyOutcome) -> &'static str {
    match outcome {
        ApplyOutcome::Applied => "applied",
        ApplyOutcome::Stale => "stale",
        ApplyOutcome::AlreadyTerminal => "already_terminal",
    }
}

fn submit_outcome_str(outcome: SubmitOutcome) -> &'static str {
    match outcome {
        SubmitOutcome::Ok => "ok",
        SubmitOutcome::AlreadyTerminal => "already_terminal",
    }
}

/// Attach the post-mutation snapshot to an outcome.
async fn with_snapshot(state: &AppState, id: &SessionId, outcome: &'static str) -> Response {
    match state.engine.get_state(id).await {
        Ok(session) => Json(MutationResponse { outcome, session }).into_response(),
        Err(e) => engine_error(e),
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health`: gateway, storage and engine status.
pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    let gateway = state.engine.gateway_health().await;
    let storage_ok = examguard_core::EventSink::health_check(state.store.as_ref())
        .await
        .is_ok();
    let evidence_items = match state.evidence.as_ref() {
        Some(store) => store.len().await,
        None => 0,
    };
    let gateway_ok = gateway.is_ok();
    let all_healthy = gateway_ok && storage_ok;

    let body = serde_json::json!({
        "status": if all_healthy { "healthy" } else { "degraded" },
        "gateway": {
            "name": state.engine.gateway_name(),
            "model": state.config.gateway.model,
            "healthy": gateway_ok,
            "error": gateway.err().map(|e| e.to_string()),
        },
        "storage": { "healthy": storage_ok },
        "evidence": {
            "enabled": state.evidence.is_some(),
            "items": evidence_items,
        },
        "sessions": state.engine.session_count(),
        "dropped_events": state.engine.dispatcher().dropped_events(),
    });
    (StatusCode::OK, Json(body)).into_response()
}

/// `POST /api/v1/sessions`: start monitoring a session.
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSessionRequest>,
) -> Response {
    if req.session_id.trim().is_empty() || req.exam_id.trim().is_empty() {
        return api_error(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "session_id and exam_id must not be empty",
        );
    }

    let mut params = NewSession::new(req.session_id, req.exam_id);
    if let Some(student) = req.student_id {
        params = params.with_student(student);
    }
    if let Some(threshold) = req.auto_submit_threshold {
        params = params.with_auto_submit_threshold(threshold);
    }
    if let Some(secs) = req.time_limit_seconds {
        if secs == 0 {
            return api_error(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                "time_limit_seconds must be greater than zero",
            );
        }
        params = params.with_time_limit(Duration::from_secs(secs));
    }

    match state.engine.start_session(params) {
        Ok(snapshot) => (StatusCode::CREATED, Json(snapshot)).into_response(),
        Err(e) => engine_error(e),
    }
}

/// `GET /api/v1/sessions`: list registered sessions, optionally per exam.
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListSessionsParams>,
) -> Response {
    let exam = params.exam_id.map(ExamId::from);
    let sessions = state.engine.list_sessions(exam.as_ref()).await;
    Json(sessions).into_response()
}

/// `GET /api/v1/sessions/:id`: current session snapshot.
pub async fn get_session(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.engine.get_state(&SessionId::from(id)).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => engine_error(e),
    }
}

/// `POST /api/v1/sessions/:id/frames`: submit a capture for analysis.
///
/// Returns `202` with the sequence token when accepted. Analysis results
/// arrive on the event stream, never in this response.
pub async fn submit_frame(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<FrameRequest>,
) -> Response {
    let primary = match decode_image(&req.image) {
        Ok(bytes) => bytes,
        Err(msg) => return api_error(StatusCode::BAD_REQUEST, "invalid_image", &msg),
    };
    let mut frame = Frame::new(primary);
    if let Some(screen) = req.screen.as_deref() {
        match decode_image(screen) {
            Ok(bytes) => frame = frame.with_secondary(bytes),
            Err(msg) => return api_error(StatusCode::BAD_REQUEST, "invalid_image", &msg),
        }
    }

    let decision = state.engine.submit_frame(&SessionId::from(id), frame).await;
    let (status, body) = match decision {
        FrameDecision::Accepted(seq) => (
            StatusCode::ACCEPTED,
            FrameResponse {
                status: "accepted",
                seq: Some(seq),
                reason: None,
            },
        ),
        FrameDecision::Rejected(reason) => {
            let status = match reason {
                RejectReason::AnalysisBusy => StatusCode::TOO_MANY_REQUESTS,
                RejectReason::SessionNotActive => StatusCode::CONFLICT,
                RejectReason::SessionUnknown => StatusCode::NOT_FOUND,
            };
            (
                status,
                FrameResponse {
                    status: "rejected",
                    seq: None,
                    reason: Some(reason),
                },
            )
        }
    };
    (status, Json(body)).into_response()
}

/// `POST /api/v1/sessions/:id/signals`: report a browser integrity signal.
pub async fn report_signal(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<SignalRequest>,
) -> Response {
    let signal: SignalKind = match req.signal.parse() {
        Ok(s) => s,
        Err(_) => {
            return api_error(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                &format!("unknown signal: {}", req.signal),
            )
        }
    };
    let id = SessionId::from(id);
    match state.engine.report_signal(&id, signal).await {
        Ok(outcome) => with_snapshot(&state, &id, apply_outcome_str(outcome)).await,
        Err(e) => engine_error(e),
    }
}

/// `POST /api/v1/sessions/:id/submit`: student submission.
pub async fn submit_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let id = SessionId::from(id);
    match state.engine.submit(&id).await {
        Ok(outcome) => with_snapshot(&state, &id, submit_outcome_str(outcome)).await,
        Err(e) => engine_error(e),
    }
}

/// `POST /api/v1/sessions/:id/terminate`: administrative termination.
pub async fn terminate_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<TerminateRequest>,
) -> Response {
    let id = SessionId::from(id);
    info!(session_id = %id, reason = %req.reason, "Administrative termination requested");
    let reason = TerminationReason::Administrative { reason: req.reason };
    match state.engine.force_terminate(&id, reason).await {
        Ok(outcome) => with_snapshot(&state, &id, submit_outcome_str(outcome)).await,
        Err(e) => engine_error(e),
    }
}

/// `POST /api/v1/sessions/:id/close`: evict a terminal session.
pub async fn close_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.engine.close_session(&SessionId::from(id)).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => engine_error(e),
    }
}

/// `GET /api/v1/sessions/:id/events`: stored event history, oldest first.
///
/// History outlives the session, so closed sessions still answer here.
pub async fn list_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<ListEventsParams>,
) -> Response {
    let id = SessionId::from(id);
    state.engine.dispatcher().flush().await;

    let filter = EventQuery {
        kind: params.kind,
        since: params.since,
        ..EventQuery::for_session(id.clone())
    };
    let total = state.store.query(&filter).await.len();
    if total == 0
        && state.engine.get_state(&id).await.is_err()
        && state.store.events_for_session(&id).await.is_empty()
    {
        return engine_error(ExamGuardError::SessionUnknown(id));
    }

    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    let offset = params.offset.unwrap_or(0);
    let page = EventQuery {
        limit: Some(limit),
        offset: Some(offset),
        ..filter
    };
    let data = state.store.query(&page).await;
    debug!(session_id = %id, total, returned = data.len(), "Listed events");

    Json(EventsResponse {
        data,
        total,
        limit,
        offset,
    })
    .into_response()
}

/// `GET /api/v1/sessions/:id/report`: behaviour report from the history.
pub async fn get_report(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let id = SessionId::from(id);
    state.engine.dispatcher().flush().await;

    let events = state.store.events_for_session(&id).await;
    if events.is_empty() && state.engine.get_state(&id).await.is_err() {
        return engine_error(ExamGuardError::SessionUnknown(id));
    }
    Json(BehaviorReport::from_events(&id, &events)).into_response()
}

/// `GET /api/v1/evidence/:evidence_id`: the frame behind an alert.
pub async fn get_evidence(
    State(state): State<Arc<AppState>>,
    Path(evidence_id): Path<String>,
) -> Response {
    let stored = match state.evidence.as_ref() {
        Some(store) => store.get(&evidence_id).await,
        None => None,
    };
    match stored {
        Some(item) => ([(header::CONTENT_TYPE, item.content_type())], item.image).into_response(),
        None => api_error(
            StatusCode::NOT_FOUND,
            "evidence_unknown",
            &format!("Evidence not found: {evidence_id}"),
        ),
    }
}
