//! The session risk engine.
//!
//! [`RiskEngine`] owns the registry of sessions. Each session has its own
//! mutex, so mutations of one session are totally ordered while different
//! sessions never contend beyond the registry map. Analysis runs in a spawned
//! task outside the critical section; its completion comes back as an
//! [`AnalysisCompletion`] applied through the same per-session path as every
//! other mutation. When an evidence store is configured, the frame behind
//! an alerting result is stored before the result is applied.

use crate::dispatcher::{EventDispatcher, Subscription, Topic};
use crate::shutdown::ShutdownCoordinator;
use crate::state::{SessionRiskState, Transition};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use examguard_core::{
    AnalysisCompletion, AnalysisGateway, AnalysisOutcome, AnalysisResult, ApplyOutcome,
    EvidenceStore, ExamGuardError, ExamId, Frame, FrameDecision, NewSession, ObserverId, RejectReason, Result, RiskConfig, RiskEvent,
    RiskEventKind, SessionId, SessionSnapshot, SessionStatus, SignalKind, SubmitOrigin,
    SubmitOutcome, TerminationReason,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One registry entry.
struct SessionSlot {
    state: Mutex<SessionRiskState>,
    /// Cancelled when the session turns terminal; stops its analysis and timer.
    cancel: CancellationToken,
}

struct EngineInner {
    config: RiskConfig,
    gateway: Arc<dyn AnalysisGateway>,
    evidence: Option<Arc<dyn EvidenceStore>>,
    dispatcher: EventDispatcher,
    shutdown: ShutdownCoordinator,
    sessions: DashMap<SessionId, Arc<SessionSlot>>,
}

/// Cheaply cloneable handle to the engine.
#[derive(Clone)]
pub struct RiskEngine {
    inner: Arc<EngineInner>,
}

impl RiskEngine {
    /// Create an engine.
    ///
    /// # Errors
    ///
    /// Returns [`ExamGuardError::Config`] if `config` fails validation.
    pub fn new(
        config: RiskConfig,
        gateway: Arc<dyn AnalysisGateway>,
        dispatcher: EventDispatcher,
        shutdown: ShutdownCoordinator,
    ) -> Result<Self> {
        Self::with_evidence(config, gateway, dispatcher, shutdown, None)
    }

    /// Create an engine that keeps the frame behind each analysis alert in
    /// `evidence`.
    ///
    /// # Errors
    ///
    /// Returns [`ExamGuardError::Config`] if `config` fails validation.
    pub fn with_evidence(
        config: RiskConfig,
        gateway: Arc<dyn AnalysisGateway>,
        dispatcher: EventDispatcher,
        shutdown: ShutdownCoordinator,
        evidence: Option<Arc<dyn EvidenceStore>>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                gateway,
                evidence,
                dispatcher,
                shutdown,
                sessions: DashMap::new(),
            }),
        })
    }

    /// Active risk configuration.
    pub fn config(&self) -> &RiskConfig {
        &self.inner.config
    }

    /// The event dispatcher this engine publishes to.
    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.inner.dispatcher
    }

    /// Name of the configured analysis gateway.
    pub fn gateway_name(&self) -> &'static str {
        self.inner.gateway.name()
    }

    /// Probe the analysis gateway.
    pub async fn gateway_health(&self) -> Result<()> {
        self.inner.gateway.health_check().await
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Register a new `Active` session.
    ///
    /// # Errors
    ///
    /// [`ExamGuardError::AlreadyExists`] if the id is already registered;
    /// [`ExamGuardError::Config`] for a threshold override that is not a
    /// positive finite number.
    pub fn start_session(&self, params: NewSession) -> Result<SessionSnapshot> {
        if let Some(threshold) = params.auto_submit_threshold {
            if !threshold.is_finite() || threshold <= 0.0 {
                return Err(ExamGuardError::Config(format!(
                    "auto_submit_threshold must be positive and finite, got {threshold}"
                )));
            }
        }
        let state = SessionRiskState::new(&params, &self.inner.config);
        let snapshot = state.snapshot();
        let slot = Arc::new(SessionSlot {
            state: Mutex::new(state),
            cancel: self.inner.shutdown.token().child_token(),
        });

        match self.inner.sessions.entry(params.session_id.clone()) {
            Entry::Occupied(_) => return Err(ExamGuardError::AlreadyExists(params.session_id)),
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::clone(&slot));
            }
        }

        info!(
            session_id = %params.session_id,
            exam_id = %params.exam_id,
            threshold = snapshot.auto_submit_threshold,
            "Session started"
        );

        if let Some(limit) = params.time_limit {
            self.arm_timer(params.session_id, slot.cancel.clone(), limit);
        }
        Ok(snapshot)
    }

    /// Evict a terminal session from the registry, marking it `Closed`.
    ///
    /// # Errors
    ///
    /// [`ExamGuardError::SessionUnknown`] if the session is not registered or
    /// another caller closed it first; [`ExamGuardError::NotTerminal`] for an
    /// active session.
    pub async fn close_session(&self, id: &SessionId) -> Result<SessionSnapshot> {
        let slot = self.slot(id)?;
        let snapshot = {
            let mut state = slot.state.lock().await;
            if !state.close() {
                return Err(match state.status() {
                    SessionStatus::Closed => ExamGuardError::SessionUnknown(id.clone()),
                    _ => ExamGuardError::NotTerminal(id.clone()),
                });
            }
            state.snapshot()
        };
        // The id may already belong to a restarted session; only evict ours.
        let evicted = self
            .inner
            .sessions
            .remove_if(id, |_, current| Arc::ptr_eq(current, &slot))
            .is_some();
        if evicted {
            self.inner.dispatcher.close_topic(&Topic::Session(id.clone()));
        }
        info!(session_id = %id, evicted, "Session closed");
        Ok(snapshot)
    }

    // -----------------------------------------------------------------------
    // Frames & results
    // -----------------------------------------------------------------------

    /// Submit a frame for analysis. Never waits on the gateway.
    pub async fn submit_frame(&self, id: &SessionId, frame: Frame) -> FrameDecision {
        let Ok(slot) = self.slot(id) else {
            return FrameDecision::Rejected(RejectReason::SessionUnknown);
        };
        let decision = slot.state.lock().await.begin_analysis();
        match decision {
            FrameDecision::Accepted(seq) => {
                debug!(session_id = %id, seq, "Frame accepted for analysis");
                self.spawn_analysis(id.clone(), seq, frame, slot.cancel.clone());
            }
            FrameDecision::Rejected(reason) => {
                debug!(session_id = %id, ?reason, "Frame rejected");
            }
        }
        decision
    }

    /// Apply the completion of an analysis started by
    /// [`submit_frame`](Self::submit_frame).
    ///
    /// # Errors
    ///
    /// [`ExamGuardError::SessionUnknown`] if the session was never started or
    /// has been closed.
    pub async fn apply_result(&self, completion: AnalysisCompletion) -> Result<ApplyOutcome> {
        let AnalysisCompletion {
            session_id,
            seq,
            outcome,
        } = completion;
        let outcome = self
            .mutate(&session_id, move |state, config| {
                state.apply_result(seq, outcome, config)
            })
            .await?;
        if outcome == ApplyOutcome::Stale {
            debug!(%session_id, seq, "Discarded stale analysis result");
        }
        Ok(outcome)
    }

    /// Apply a client-reported integrity signal.
    pub async fn report_signal(&self, id: &SessionId, signal: SignalKind) -> Result<ApplyOutcome> {
        self.mutate(id, move |state, config| state.apply_signal(signal, config))
            .await
    }

    // -----------------------------------------------------------------------
    // Terminal transitions
    // -----------------------------------------------------------------------

    /// Student submission. Succeeds immediately even with an analysis
    /// outstanding; the late result is discarded.
    pub async fn submit(&self, id: &SessionId) -> Result<SubmitOutcome> {
        self.submit_with_origin(id, SubmitOrigin::Student).await
    }

    /// Submission with an explicit trigger.
    pub async fn submit_with_origin(
        &self,
        id: &SessionId,
        origin: SubmitOrigin,
    ) -> Result<SubmitOutcome> {
        self.mutate(id, move |state, _| state.submit(origin)).await
    }

    /// Administrative termination; the session ends as `AutoSubmitted`.
    pub async fn force_terminate(
        &self,
        id: &SessionId,
        reason: TerminationReason,
    ) -> Result<SubmitOutcome> {
        self.mutate(id, move |state, _| state.force_terminate(reason))
            .await
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Consistent snapshot of one session.
    pub async fn get_state(&self, id: &SessionId) -> Result<SessionSnapshot> {
        let slot = self.slot(id)?;
        let snapshot = slot.state.lock().await.snapshot();
        Ok(snapshot)
    }

    /// Snapshots of every registered session, optionally limited to one exam.
    pub async fn list_sessions(&self, exam: Option<&ExamId>) -> Vec<SessionSnapshot> {
        // Collect handles first so no registry guard is held across an await.
        let slots: Vec<Arc<SessionSlot>> = self
            .inner
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            let snapshot = slot.state.lock().await.snapshot();
            if exam.map_or(true, |e| *e == snapshot.exam_id) {
                out.push(snapshot);
            }
        }
        out.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        out
    }

    /// Number of registered sessions.
    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    // -----------------------------------------------------------------------
    // Observers
    // -----------------------------------------------------------------------

    /// Observe one session or an exam's proctor room.
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        self.inner.dispatcher.subscribe(topic)
    }

    /// Remove an observer.
    pub fn unsubscribe(&self, topic: &Topic, id: ObserverId) -> bool {
        self.inner.dispatcher.unsubscribe(topic, id)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn slot(&self, id: &SessionId) -> Result<Arc<SessionSlot>> {
        self.inner
            .sessions
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ExamGuardError::SessionUnknown(id.clone()))
    }

    /// Run one mutation under the session lock and publish its events before
    /// releasing it, which keeps per-session emission order.
    async fn mutate<O, F>(&self, id: &SessionId, f: F) -> Result<O>
    where
        F: FnOnce(&mut SessionRiskState, &RiskConfig) -> Transition<O> + Send,
        O: Send,
    {
        let slot = self.slot(id)?;
        let mut state = slot.state.lock().await;
        let transition = f(&mut state, &self.inner.config);
        for event in transition.events {
            log_event(&event);
            self.inner.dispatcher.publish(event);
        }
        if state.status().is_terminal() {
            slot.cancel.cancel();
        }
        Ok(transition.outcome)
    }

    fn spawn_analysis(&self, session_id: SessionId, seq: u64, frame: Frame, cancel: CancellationToken) {
        let engine = self.clone();
        let guard = self.inner.shutdown.track_task();
        tokio::spawn(async move {
            let _guard = guard;
            let timeout = engine.inner.config.analysis_timeout();
            let gateway = Arc::clone(&engine.inner.gateway);

            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(%session_id, seq, "Analysis abandoned");
                    return;
                }
                res = tokio::time::timeout(timeout, gateway.analyze(&frame)) => match res {
                    Ok(Ok(result)) => AnalysisOutcome::Completed(result),
                    Ok(Err(e)) => {
                        warn!(%session_id, seq, gateway = gateway.name(), "Analysis failed: {e}");
                        AnalysisOutcome::Failed(e.to_string())
                    }
                    Err(_) => {
                        warn!(%session_id, seq, timeout_ms = timeout.as_millis() as u64, "Analysis timed out");
                        AnalysisOutcome::TimedOut
                    }
                },
            };

            let outcome = match outcome {
                AnalysisOutcome::Completed(result) => AnalysisOutcome::Completed(
                    engine.capture_evidence(&session_id, seq, &frame, result).await,
                ),
                other => other,
            };

            let completion = AnalysisCompletion {
                session_id: session_id.clone(),
                seq,
                outcome,
            };
            if let Err(e) = engine.apply_result(completion).await {
                debug!(%session_id, seq, "Analysis result not applied: {e}");
            }
        });
    }

    /// Store the frame behind a result that will raise an alert. A failed
    /// upload leaves the alert without evidence.
    async fn capture_evidence(
        &self,
        session_id: &SessionId,
        seq: u64,
        frame: &Frame,
        result: AnalysisResult,
    ) -> AnalysisResult {
        let Some(store) = self.inner.evidence.as_ref() else {
            return result;
        };
        if !self.inner.config.is_alert(&result) {
            return result;
        }
        match store
            .store(session_id, result.primary_issue(), frame.primary.clone())
            .await
        {
            Ok(evidence_id) => {
                debug!(%session_id, seq, %evidence_id, "Evidence stored");
                result.with_evidence(evidence_id)
            }
            Err(e) => {
                warn!(%session_id, seq, "Evidence capture failed: {e}");
                result
            }
        }
    }

    fn arm_timer(&self, session_id: SessionId, cancel: CancellationToken, limit: Duration) {
        let engine = self.clone();
        let guard = self.inner.shutdown.track_task();
        tokio::spawn(async move {
            let _guard = guard;
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(limit) => {
                    info!(%session_id, "Exam time limit reached");
                    if let Err(e) = engine.submit_with_origin(&session_id, SubmitOrigin::TimeLimit).await {
                        debug!(%session_id, "Timed submission skipped: {e}");
                    }
                }
            }
        });
    }
}

fn log_event(event: &RiskEvent) {
    match &event.kind {
        RiskEventKind::Alert {
            cumulative_score,
            alert_count,
            severity,
            evidence_id,
            ..
        } => warn!(
            session_id = %event.session_id,
            exam_id = %event.exam_id,
            severity,
            score = cumulative_score,
            alert_count,
            evidence = evidence_id.as_deref().unwrap_or("-"),
            "Alert raised"
        ),
        RiskEventKind::AutoSubmitted {
            reason,
            cumulative_score,
            ..
        } => warn!(
            session_id = %event.session_id,
            score = cumulative_score,
            "Session auto-submitted: {reason}"
        ),
        RiskEventKind::Submitted { origin, .. } => {
            info!(session_id = %event.session_id, ?origin, "Session submitted")
        }
        RiskEventKind::PositiveFeedback { clean_streak, .. } => {
            debug!(session_id = %event.session_id, clean_streak, "Positive feedback")
        }
        RiskEventKind::AnalysisDiagnostic { seq, timed_out, .. } => {
            debug!(session_id = %event.session_id, seq, timed_out, "Analysis diagnostic")
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use examguard_core::IssueKind;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Gateway that replays scripted results, optionally after a delay.
    struct ScriptedGateway {
        results: std::sync::Mutex<VecDeque<Result<AnalysisResult>>>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl ScriptedGateway {
        fn new(results: Vec<Result<AnalysisResult>>, delay: Duration) -> Self {
            Self {
                results: std::sync::Mutex::new(results.into()),
                delay,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl AnalysisGateway for ScriptedGateway {
        async fn analyze(&self, _frame: &Frame) -> Result<AnalysisResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            let next = self.results.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok(AnalysisResult::clean(0.9)))
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    /// Gateway that blocks until released.
    struct GatedGateway {
        release: Notify,
    }

    #[async_trait::async_trait]
    impl AnalysisGateway for GatedGateway {
        async fn analyze(&self, _frame: &Frame) -> Result<AnalysisResult> {
            self.release.notified().await;
            Ok(AnalysisResult::new(true, 1.0, 5, "phone".into()).with_issue(IssueKind::PhoneDetected))
        }

        fn name(&self) -> &'static str {
            "gated"
        }
    }

    /// Evidence store that keeps references only, or always fails.
    #[derive(Default)]
    struct RecordingEvidence {
        stored: std::sync::Mutex<Vec<(SessionId, IssueKind, usize)>>,
        broken: bool,
    }

    #[async_trait::async_trait]
    impl EvidenceStore for RecordingEvidence {
        async fn store(
            &self,
            session_id: &SessionId,
            issue: IssueKind,
            image: bytes::Bytes,
        ) -> Result<String> {
            if self.broken {
                return Err(ExamGuardError::Storage("bucket unavailable".into()));
            }
            let mut stored = self.stored.lock().unwrap();
            stored.push((session_id.clone(), issue, image.len()));
            Ok(format!("ev-{}", stored.len()))
        }

        async fn health_check(&self) -> Result<()> {
            Ok(())
        }
    }

    fn engine_with(gateway: Arc<dyn AnalysisGateway>, config: RiskConfig) -> RiskEngine {
        let dispatcher = EventDispatcher::new(64, None);
        RiskEngine::new(config, gateway, dispatcher, ShutdownCoordinator::new(1)).unwrap()
    }

    fn frame() -> Frame {
        Frame::new(vec![0xFF, 0xD8, 0xFF])
    }

    fn sid(s: &str) -> SessionId {
        s.into()
    }

    async fn wait_idle(engine: &RiskEngine, id: &SessionId) -> SessionSnapshot {
        for _ in 0..200 {
            let snap = engine.get_state(id).await.unwrap();
            if !snap.in_flight {
                return snap;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("analysis never completed");
    }

    fn phone(severity: u8, confidence: f64) -> Result<AnalysisResult> {
        Ok(AnalysisResult::new(true, confidence, severity, "phone".into())
            .with_issue(IssueKind::PhoneDetected))
    }

    #[tokio::test]
    async fn test_start_session_twice_fails() {
        let engine = engine_with(
            Arc::new(ScriptedGateway::new(vec![], Duration::ZERO)),
            RiskConfig::default(),
        );
        engine.start_session(NewSession::new("s-1", "exam-1")).unwrap();
        let err = engine
            .start_session(NewSession::new("s-1", "exam-1"))
            .unwrap_err();
        assert!(matches!(err, ExamGuardError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_bad_threshold_override_rejected() {
        let engine = engine_with(
            Arc::new(ScriptedGateway::new(vec![], Duration::ZERO)),
            RiskConfig::default(),
        );
        for threshold in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let err = engine
                .start_session(
                    NewSession::new("s-1", "exam-1").with_auto_submit_threshold(threshold),
                )
                .unwrap_err();
            assert!(matches!(err, ExamGuardError::Config(_)));
        }
        assert_eq!(engine.session_count(), 0);
        engine
            .start_session(NewSession::new("s-1", "exam-1").with_auto_submit_threshold(0.5))
            .unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = RiskConfig {
            alert_confidence_threshold: 2.0,
            ..RiskConfig::default()
        };
        let result = RiskEngine::new(
            config,
            Arc::new(ScriptedGateway::new(vec![], Duration::ZERO)),
            EventDispatcher::new(8, None),
            ShutdownCoordinator::new(1),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_unknown_session_everywhere() {
        let engine = engine_with(
            Arc::new(ScriptedGateway::new(vec![], Duration::ZERO)),
            RiskConfig::default(),
        );
        let id = sid("ghost");
        assert_eq!(
            engine.submit_frame(&id, frame()).await,
            FrameDecision::Rejected(RejectReason::SessionUnknown)
        );
        assert!(matches!(
            engine.get_state(&id).await,
            Err(ExamGuardError::SessionUnknown(_))
        ));
        assert!(engine.submit(&id).await.is_err());
        assert!(engine.report_signal(&id, SignalKind::TabSwitch).await.is_err());
    }

    #[tokio::test]
    async fn test_scenario_back_to_back_frames() {
        let gateway = Arc::new(GatedGateway {
            release: Notify::new(),
        });
        let engine = engine_with(gateway.clone(), RiskConfig::default());
        let id = sid("s-1");
        engine.start_session(NewSession::new("s-1", "exam-1")).unwrap();

        assert_eq!(
            engine.submit_frame(&id, frame()).await,
            FrameDecision::Accepted(1)
        );
        assert_eq!(
            engine.submit_frame(&id, frame()).await,
            FrameDecision::Rejected(RejectReason::AnalysisBusy)
        );

        gateway.release.notify_one();
        let snap = wait_idle(&engine, &id).await;
        assert_eq!(snap.alert_count, 1);
        assert_eq!(snap.last_accepted_seq, 1);
        assert_eq!(
            engine.submit_frame(&id, frame()).await,
            FrameDecision::Accepted(2)
        );
    }

    #[tokio::test]
    async fn test_concurrent_submissions_start_one_analysis() {
        let gateway = Arc::new(ScriptedGateway::new(vec![], Duration::from_millis(50)));
        let engine = engine_with(gateway.clone(), RiskConfig::default());
        engine.start_session(NewSession::new("s-1", "exam-1")).unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine.submit_frame(&sid("s-1"), frame()).await
            }));
        }
        let mut accepted = 0;
        for h in handles {
            if matches!(h.await.unwrap(), FrameDecision::Accepted(_)) {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);
        wait_idle(&engine, &sid("s-1")).await;
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_analysis_results_drive_auto_submit() {
        let gateway = Arc::new(ScriptedGateway::new(
            vec![phone(5, 0.8), phone(5, 0.8), phone(5, 0.8)],
            Duration::ZERO,
        ));
        let engine = engine_with(gateway, RiskConfig::default());
        let id = sid("s-1");
        engine.start_session(NewSession::new("s-1", "exam-1")).unwrap();
        let mut sub = engine.subscribe(Topic::Session(id.clone()));

        for _ in 0..3 {
            assert!(matches!(
                engine.submit_frame(&id, frame()).await,
                FrameDecision::Accepted(_)
            ));
            wait_idle(&engine, &id).await;
        }

        let snap = engine.get_state(&id).await.unwrap();
        assert_eq!(snap.status, SessionStatus::AutoSubmitted);
        assert!((snap.cumulative_score - 12.0).abs() < 1e-9);

        engine.dispatcher().flush().await;
        let mut names = Vec::new();
        while let Ok(event) = sub.receiver.try_recv() {
            names.push(event.kind.name());
        }
        assert_eq!(names, vec!["alert", "alert", "alert", "auto_submitted"]);
    }

    #[tokio::test]
    async fn test_alerting_frames_are_kept_as_evidence() {
        let gateway = Arc::new(ScriptedGateway::new(
            vec![
                phone(3, 0.9),
                Ok(AnalysisResult::clean(0.9)),
                phone(3, 0.3),
            ],
            Duration::ZERO,
        ));
        let evidence = Arc::new(RecordingEvidence::default());
        let engine = RiskEngine::with_evidence(
            RiskConfig::default(),
            gateway,
            EventDispatcher::new(64, None),
            ShutdownCoordinator::new(1),
            Some(evidence.clone() as Arc<dyn EvidenceStore>),
        )
        .unwrap();
        let id = sid("s-1");
        engine.start_session(NewSession::new("s-1", "exam-1")).unwrap();
        let mut sub = engine.subscribe(Topic::Session(id.clone()));

        for _ in 0..3 {
            engine.submit_frame(&id, frame()).await;
            wait_idle(&engine, &id).await;
        }

        // Only the confident alert is kept; clean and inconclusive frames are not.
        let stored = evidence.stored.lock().unwrap().clone();
        assert_eq!(stored, vec![(id.clone(), IssueKind::PhoneDetected, 3)]);

        engine.dispatcher().flush().await;
        let event = sub.receiver.recv().await.unwrap();
        match &event.kind {
            RiskEventKind::Alert { evidence_id, .. } => {
                assert_eq!(evidence_id.as_deref(), Some("ev-1"))
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_evidence_failure_still_raises_alert() {
        let gateway = Arc::new(ScriptedGateway::new(vec![phone(3, 0.9)], Duration::ZERO));
        let evidence = Arc::new(RecordingEvidence {
            broken: true,
            ..RecordingEvidence::default()
        });
        let engine = RiskEngine::with_evidence(
            RiskConfig::default(),
            gateway,
            EventDispatcher::new(64, None),
            ShutdownCoordinator::new(1),
            Some(evidence as Arc<dyn EvidenceStore>),
        )
        .unwrap();
        let id = sid("s-1");
        engine.start_session(NewSession::new("s-1", "exam-1")).unwrap();
        let mut sub = engine.subscribe(Topic::Session(id.clone()));

        engine.submit_frame(&id, frame()).await;
        let snap = wait_idle(&engine, &id).await;
        assert_eq!(snap.alert_count, 1);

        engine.dispatcher().flush().await;
        let event = sub.receiver.recv().await.unwrap();
        assert!(matches!(
            event.kind,
            RiskEventKind::Alert { evidence_id: None, .. }
        ));
    }

    #[tokio::test]
    async fn test_timeout_frees_slot_without_alert() {
        let gateway = Arc::new(ScriptedGateway::new(
            vec![phone(5, 1.0)],
            Duration::from_millis(500),
        ));
        let config = RiskConfig {
            analysis_timeout_ms: 20,
            ..RiskConfig::default()
        };
        let engine = engine_with(gateway, config);
        let id = sid("s-1");
        engine.start_session(NewSession::new("s-1", "exam-1")).unwrap();

        engine.submit_frame(&id, frame()).await;
        let snap = wait_idle(&engine, &id).await;
        assert_eq!(snap.analysis_failures, 1);
        assert_eq!(snap.alert_count, 0);
        assert_eq!(snap.cumulative_score, 0.0);
    }

    #[tokio::test]
    async fn test_gateway_error_is_absorbed() {
        let gateway = Arc::new(ScriptedGateway::new(
            vec![Err(ExamGuardError::Gateway("model offline".into()))],
            Duration::ZERO,
        ));
        let engine = engine_with(gateway, RiskConfig::default());
        let id = sid("s-1");
        engine.start_session(NewSession::new("s-1", "exam-1")).unwrap();
        engine.submit_frame(&id, frame()).await;
        let snap = wait_idle(&engine, &id).await;
        assert_eq!(snap.analysis_failures, 1);
        assert_eq!(snap.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn test_submit_not_blocked_by_outstanding_analysis() {
        let gateway = Arc::new(GatedGateway {
            release: Notify::new(),
        });
        let engine = engine_with(gateway.clone(), RiskConfig::default());
        let id = sid("s-1");
        engine.start_session(NewSession::new("s-1", "exam-1")).unwrap();
        engine.submit_frame(&id, frame()).await;

        let outcome = tokio::time::timeout(Duration::from_millis(200), engine.submit(&id))
            .await
            .expect("submit blocked")
            .unwrap();
        assert_eq!(outcome, SubmitOutcome::Ok);
        assert_eq!(engine.submit(&id).await.unwrap(), SubmitOutcome::AlreadyTerminal);

        // The late result is dropped with the cancelled task.
        gateway.release.notify_one();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let snap = engine.get_state(&id).await.unwrap();
        assert_eq!(snap.status, SessionStatus::Submitted);
        assert_eq!(snap.alert_count, 0);
    }

    #[tokio::test]
    async fn test_late_completion_after_terminal_is_noop() {
        let engine = engine_with(
            Arc::new(ScriptedGateway::new(vec![], Duration::ZERO)),
            RiskConfig::default(),
        );
        let id = sid("s-1");
        engine.start_session(NewSession::new("s-1", "exam-1")).unwrap();
        engine
            .force_terminate(
                &id,
                TerminationReason::Administrative {
                    reason: "proctor".into(),
                },
            )
            .await
            .unwrap();

        let outcome = engine
            .apply_result(AnalysisCompletion {
                session_id: id.clone(),
                seq: 1,
                outcome: AnalysisOutcome::Completed(phone(5, 1.0).unwrap()),
            })
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::AlreadyTerminal);
        assert_eq!(
            engine.report_signal(&id, SignalKind::TabSwitch).await.unwrap(),
            ApplyOutcome::AlreadyTerminal
        );
    }

    #[tokio::test]
    async fn test_time_limit_submits_session() {
        let engine = engine_with(
            Arc::new(ScriptedGateway::new(vec![], Duration::ZERO)),
            RiskConfig::default(),
        );
        let id = sid("s-1");
        engine
            .start_session(
                NewSession::new("s-1", "exam-1").with_time_limit(Duration::from_millis(30)),
            )
            .unwrap();
        let mut sub = engine.subscribe(Topic::Session(id.clone()));

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(
            engine.get_state(&id).await.unwrap().status,
            SessionStatus::Submitted
        );
        engine.dispatcher().flush().await;
        let event = sub.receiver.recv().await.unwrap();
        assert!(matches!(
            event.kind,
            RiskEventKind::Submitted {
                origin: SubmitOrigin::TimeLimit,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_close_session_evicts_terminal_only() {
        let engine = engine_with(
            Arc::new(ScriptedGateway::new(vec![], Duration::ZERO)),
            RiskConfig::default(),
        );
        let id = sid("s-1");
        engine.start_session(NewSession::new("s-1", "exam-1")).unwrap();
        assert!(matches!(
            engine.close_session(&id).await,
            Err(ExamGuardError::NotTerminal(_))
        ));

        engine.submit(&id).await.unwrap();
        let snap = engine.close_session(&id).await.unwrap();
        assert_eq!(snap.status, SessionStatus::Closed);
        assert_eq!(engine.session_count(), 0);
        assert!(matches!(
            engine.get_state(&id).await,
            Err(ExamGuardError::SessionUnknown(_))
        ));
        // The id can be reused once evicted.
        engine.start_session(NewSession::new("s-1", "exam-1")).unwrap();
    }

    #[tokio::test]
    async fn test_racing_close_does_not_evict_restarted_session() {
        let engine = engine_with(
            Arc::new(ScriptedGateway::new(vec![], Duration::ZERO)),
            RiskConfig::default(),
        );
        let id = sid("s-1");
        engine.start_session(NewSession::new("s-1", "exam-1")).unwrap();
        engine.submit(&id).await.unwrap();

        // Hold the old session's lock so the racing close queues behind it.
        let old = engine.slot(&id).unwrap();
        let mut guard = old.state.lock().await;
        let racing = tokio::spawn({
            let engine = engine.clone();
            let id = id.clone();
            async move { engine.close_session(&id).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Meanwhile the first close finishes and the id is reused.
        assert!(guard.close());
        engine.inner.sessions.remove(&id);
        engine.start_session(NewSession::new("s-1", "exam-1")).unwrap();
        drop(guard);

        assert!(matches!(
            racing.await.unwrap(),
            Err(ExamGuardError::SessionUnknown(_))
        ));
        assert_eq!(engine.session_count(), 1);
        assert_eq!(
            engine.get_state(&id).await.unwrap().status,
            SessionStatus::Active
        );
    }

    #[tokio::test]
    async fn test_list_sessions_filters_by_exam() {
        let engine = engine_with(
            Arc::new(ScriptedGateway::new(vec![], Duration::ZERO)),
            RiskConfig::default(),
        );
        engine.start_session(NewSession::new("a", "exam-1")).unwrap();
        engine.start_session(NewSession::new("b", "exam-2")).unwrap();
        engine.start_session(NewSession::new("c", "exam-1")).unwrap();

        assert_eq!(engine.list_sessions(None).await.len(), 3);
        let exam1 = engine.list_sessions(Some(&ExamId::from("exam-1"))).await;
        assert_eq!(exam1.len(), 2);
        assert!(exam1.iter().all(|s| s.exam_id.as_str() == "exam-1"));
    }

    #[tokio::test]
    async fn test_proctor_room_sees_all_sessions_of_exam() {
        let engine = engine_with(
            Arc::new(ScriptedGateway::new(vec![], Duration::ZERO)),
            RiskConfig::default(),
        );
        engine.start_session(NewSession::new("a", "exam-1")).unwrap();
        engine.start_session(NewSession::new("b", "exam-1")).unwrap();
        let mut room = engine.subscribe(Topic::ExamRoom("exam-1".into()));

        engine.report_signal(&sid("a"), SignalKind::TabSwitch).await.unwrap();
        engine.report_signal(&sid("b"), SignalKind::WindowBlur).await.unwrap();
        engine.dispatcher().flush().await;

        let first = room.receiver.recv().await.unwrap();
        let second = room.receiver.recv().await.unwrap();
        assert_eq!(first.session_id.as_str(), "a");
        assert_eq!(second.session_id.as_str(), "b");
    }

    #[tokio::test]
    async fn test_concurrent_signals_are_all_counted() {
        let config = RiskConfig {
            auto_submit_threshold: 1_000.0,
            ..RiskConfig::default()
        };
        let engine = engine_with(Arc::new(ScriptedGateway::new(vec![], Duration::ZERO)), config);
        engine.start_session(NewSession::new("s-1", "exam-1")).unwrap();

        let mut handles = Vec::new();
        for _ in 0..50 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .report_signal(&sid("s-1"), SignalKind::WindowBlur)
                    .await
                    .unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let snap = engine.get_state(&sid("s-1")).await.unwrap();
        assert_eq!(snap.alert_count, 50);
        assert!((snap.cumulative_score - 50.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_outstanding_analysis() {
        let gateway = Arc::new(GatedGateway {
            release: Notify::new(),
        });
        let shutdown = ShutdownCoordinator::new(1);
        let engine = RiskEngine::new(
            RiskConfig::default(),
            gateway,
            EventDispatcher::new(8, None),
            shutdown.clone(),
        )
        .unwrap();
        engine.start_session(NewSession::new("s-1", "exam-1")).unwrap();
        engine.submit_frame(&sid("s-1"), frame()).await;
        assert_eq!(shutdown.in_flight_count(), 1);

        shutdown.trigger();
        assert!(shutdown.wait_for_tasks().await);
    }
}
