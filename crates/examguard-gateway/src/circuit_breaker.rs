//! Circuit breaker around an analysis gateway.
//!
//! When the vision backend keeps failing, every frame would otherwise wait
//! out the full analysis timeout. Failures are classified first: a backend
//! that is down or overloaded opens the circuit after `failure_threshold`
//! consecutive failures, while a backend that rejects our requests (bad key,
//! unknown model) opens it at once. A model that answers with unusable
//! output is up and never counts. After the recovery timeout a limited
//! number of probe frames are let through.

use examguard_core::{
    AnalysisGateway, AnalysisResult, CircuitBreakerConfig, ExamGuardError, Frame, Result,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Frames are analysed.
    Closed,
    /// Frames fail fast.
    Open,
    /// A limited number of probe frames are analysed.
    HalfOpen,
}

/// Why an analysis call failed, as far as the breaker cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No HTTP answer: connection refused, reset or timed out.
    Unreachable,
    /// HTTP 429 or 503: the model server is saturated.
    Overloaded,
    /// Any other 5xx.
    ServerError,
    /// 4xx other than 429: the backend rejects our requests.
    Misconfigured,
}

impl FailureKind {
    /// Classify a gateway error. `None` means the backend answered and the
    /// call says nothing about its health.
    pub fn classify(err: &ExamGuardError) -> Option<Self> {
        match err {
            ExamGuardError::Gateway(_) => Some(Self::Unreachable),
            ExamGuardError::GatewayStatus { status, .. } => Some(match *status {
                429 | 503 => Self::Overloaded,
                500..=599 => Self::ServerError,
                _ => Self::Misconfigured,
            }),
            _ => None,
        }
    }

    /// Failures of this kind open the circuit without waiting for the
    /// threshold.
    pub fn opens_immediately(self) -> bool {
        self == Self::Misconfigured
    }

    /// Stable wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unreachable => "unreachable",
            Self::Overloaded => "overloaded",
            Self::ServerError => "server_error",
            Self::Misconfigured => "misconfigured",
        }
    }
}

/// Point-in-time view of the breaker for health reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerStatus {
    pub state: CircuitState,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Kind of the most recent failure.
    pub last_failure: Option<FailureKind>,
    /// Failures per kind since the breaker was created.
    pub failures_by_kind: BTreeMap<FailureKind, u64>,
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_calls: u32,
    opened_at: Option<Instant>,
    last_failure: Option<FailureKind>,
    failures_by_kind: BTreeMap<FailureKind, u64>,
}

/// Failure tracker with open/half-open/closed transitions.
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    half_open_max_calls: u32,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a breaker with the given thresholds.
    pub fn new(failure_threshold: u32, recovery_timeout: Duration, half_open_max_calls: u32) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            half_open_max_calls: half_open_max_calls.max(1),
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_calls: 0,
                opened_at: None,
                last_failure: None,
                failures_by_kind: BTreeMap::new(),
            }),
        }
    }

    /// Create a breaker from configuration.
    pub fn from_config(cfg: &CircuitBreakerConfig) -> Self {
        Self::new(
            cfg.failure_threshold,
            Duration::from_millis(cfg.recovery_timeout_ms),
            cfg.half_open_max_calls,
        )
    }

    // Never held across an await.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns `true` if the frame may be sent to the backend.
    pub fn allow(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let recovered = inner
                    .opened_at
                    .map_or(true, |at| at.elapsed() >= self.recovery_timeout);
                if recovered {
                    // This call is the first probe.
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_calls = 1;
                    info!("Analysis circuit half-open; probing gateway");
                }
                recovered
            }
            CircuitState::HalfOpen => {
                inner.half_open_calls += 1;
                inner.half_open_calls <= self.half_open_max_calls
            }
        }
    }

    /// Record a call the backend answered; closes a half-open circuit.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
            info!("Analysis circuit closed");
        }
    }

    /// Record a failed call of the given kind; may open the circuit.
    pub fn record_failure(&self, kind: FailureKind) {
        let mut inner = self.lock();
        inner.consecutive_failures += 1;
        inner.last_failure = Some(kind);
        *inner.failures_by_kind.entry(kind).or_insert(0) += 1;

        let open = match inner.state {
            CircuitState::Closed => {
                kind.opens_immediately() || inner.consecutive_failures >= self.failure_threshold
            }
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };
        if open {
            let was_probing = inner.state == CircuitState::HalfOpen;
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            if was_probing {
                warn!(reason = kind.as_str(), "Analysis probe failed; circuit re-opened");
            } else {
                warn!(
                    reason = kind.as_str(),
                    failures = inner.consecutive_failures,
                    "Analysis circuit opened"
                );
            }
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Snapshot of state and failure counters.
    pub fn status(&self) -> BreakerStatus {
        let inner = self.lock();
        BreakerStatus {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_failure: inner.last_failure,
            failures_by_kind: inner.failures_by_kind.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// BreakerGateway
// ---------------------------------------------------------------------------

/// Wraps a gateway so that a failing backend is skipped instead of waited on.
pub struct BreakerGateway<G> {
    inner: G,
    breaker: CircuitBreaker,
}

impl<G: AnalysisGateway> BreakerGateway<G> {
    /// Wrap `inner` with `breaker`.
    pub fn new(inner: G, breaker: CircuitBreaker) -> Self {
        Self { inner, breaker }
    }

    /// The breaker, for health reporting.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    fn open_error(&self) -> ExamGuardError {
        let reason = self
            .breaker
            .status()
            .last_failure
            .map_or("unknown", FailureKind::as_str);
        ExamGuardError::Gateway(format!(
            "{} circuit open (last failure: {reason})",
            self.inner.name()
        ))
    }
}

#[async_trait::async_trait]
impl<G: AnalysisGateway> AnalysisGateway for BreakerGateway<G> {
    async fn analyze(&self, frame: &Frame) -> Result<AnalysisResult> {
        if !self.breaker.allow() {
            return Err(self.open_error());
        }
        let result = self.inner.analyze(frame).await;
        match result.as_ref().err().and_then(FailureKind::classify) {
            Some(kind) => self.breaker.record_failure(kind),
            None => self.breaker.record_success(),
        }
        result
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn health_check(&self) -> Result<()> {
        if self.breaker.state() == CircuitState::Open {
            return Err(self.open_error());
        }
        self.inner.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU16, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_closed_allows_calls() {
        let cb = CircuitBreaker::new(3, Duration::from_secs(5), 1);
        assert!(cb.allow());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_classification() {
        let classify = |status| {
            FailureKind::classify(&ExamGuardError::GatewayStatus {
                status,
                detail: String::new(),
            })
        };
        assert_eq!(classify(503), Some(FailureKind::Overloaded));
        assert_eq!(classify(429), Some(FailureKind::Overloaded));
        assert_eq!(classify(500), Some(FailureKind::ServerError));
        assert_eq!(classify(404), Some(FailureKind::Misconfigured));
        assert_eq!(
            FailureKind::classify(&ExamGuardError::Gateway("refused".into())),
            Some(FailureKind::Unreachable)
        );
        assert_eq!(
            FailureKind::classify(&ExamGuardError::InvalidAnalysis("prose".into())),
            None
        );
    }

    #[test]
    fn test_transient_failures_open_after_threshold() {
        let cb = CircuitBreaker::new(3, Duration::from_secs(60), 1);
        cb.record_failure(FailureKind::Unreachable);
        cb.record_failure(FailureKind::Overloaded);
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure(FailureKind::ServerError);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow());

        let status = cb.status();
        assert_eq!(status.consecutive_failures, 3);
        assert_eq!(status.last_failure, Some(FailureKind::ServerError));
        assert_eq!(status.failures_by_kind[&FailureKind::Overloaded], 1);
    }

    #[test]
    fn test_rejected_requests_open_at_once() {
        let cb = CircuitBreaker::new(5, Duration::from_secs(60), 1);
        cb.record_failure(FailureKind::Misconfigured);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let cb = CircuitBreaker::new(3, Duration::from_secs(60), 1);
        cb.record_failure(FailureKind::Unreachable);
        cb.record_failure(FailureKind::Unreachable);
        cb.record_success();
        cb.record_failure(FailureKind::Unreachable);
        assert_eq!(cb.state(), CircuitState::Closed);
        // Totals survive the reset.
        assert_eq!(cb.status().failures_by_kind[&FailureKind::Unreachable], 3);
    }

    #[tokio::test]
    async fn test_half_open_probe_cycle() {
        let cb = CircuitBreaker::new(1, Duration::from_millis(10), 1);
        cb.record_failure(FailureKind::Unreachable);
        assert!(!cb.allow());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cb.allow());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        // Only one probe at a time.
        assert!(!cb.allow());

        cb.record_failure(FailureKind::Overloaded);
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cb.allow());
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    /// Gateway answering with a settable HTTP status; 0 means connection
    /// refused, 200 a clean result.
    struct Scripted {
        status: Arc<AtomicU16>,
    }

    #[async_trait::async_trait]
    impl AnalysisGateway for Scripted {
        async fn analyze(&self, _frame: &Frame) -> Result<AnalysisResult> {
            match self.status.load(Ordering::SeqCst) {
                0 => Err(ExamGuardError::Gateway("connection refused".into())),
                200 => Ok(AnalysisResult::clean(0.9)),
                204 => Err(ExamGuardError::InvalidAnalysis("prose".into())),
                status => Err(ExamGuardError::GatewayStatus {
                    status,
                    detail: "scripted".into(),
                }),
            }
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    fn scripted(status: u16, threshold: u32, recovery: Duration) -> (Arc<AtomicU16>, BreakerGateway<Scripted>) {
        let handle = Arc::new(AtomicU16::new(status));
        let gw = BreakerGateway::new(
            Scripted {
                status: handle.clone(),
            },
            CircuitBreaker::new(threshold, recovery, 1),
        );
        (handle, gw)
    }

    #[tokio::test]
    async fn test_breaker_gateway_fails_fast_then_recovers() {
        let (status, gw) = scripted(0, 2, Duration::from_millis(20));
        let frame = Frame::new(vec![0u8]);

        assert!(gw.analyze(&frame).await.is_err());
        assert!(gw.analyze(&frame).await.is_err());
        assert_eq!(gw.breaker().state(), CircuitState::Open);

        let err = gw.analyze(&frame).await.unwrap_err();
        assert!(err.to_string().contains("circuit open (last failure: unreachable)"));
        assert!(gw.health_check().await.is_err());

        status.store(200, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(gw.analyze(&frame).await.is_ok());
        assert_eq!(gw.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_missing_model_opens_on_first_frame() {
        let (_status, gw) = scripted(404, 5, Duration::from_secs(60));
        let frame = Frame::new(vec![0u8]);
        assert!(matches!(
            gw.analyze(&frame).await,
            Err(ExamGuardError::GatewayStatus { status: 404, .. })
        ));
        let err = gw.analyze(&frame).await.unwrap_err();
        assert!(err.to_string().contains("misconfigured"));
    }

    #[tokio::test]
    async fn test_malformed_output_does_not_trip_breaker() {
        let (_status, gw) = scripted(204, 1, Duration::from_secs(60));
        let frame = Frame::new(vec![0u8]);
        for _ in 0..3 {
            assert!(matches!(
                gw.analyze(&frame).await,
                Err(ExamGuardError::InvalidAnalysis(_))
            ));
        }
        assert_eq!(gw.breaker().state(), CircuitState::Closed);
        assert!(gw.breaker().status().failures_by_kind.is_empty());
    }
}
