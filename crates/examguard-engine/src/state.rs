//! Per-session risk state machine.
//!
//! [`SessionRiskState`] is plain synchronous data. Every mutation returns a
//! [`Transition`] carrying the operation outcome plus the events it emitted,
//! so the caller decides how the state is serialized and where the events go.
//! The engine wraps each state in its own mutex; tests drive it directly.

use chrono::{DateTime, Utc};
use examguard_core::{
    AlertSource, AnalysisOutcome, AnalysisResult, ApplyOutcome, ExamId, FrameDecision, NewSession,
    RejectReason, RiskConfig, RiskEvent, RiskEventKind, SessionId, SessionSnapshot, SessionStatus,
    SignalKind, SubmitOrigin, SubmitOutcome, TerminationReason,
};
use uuid::Uuid;

/// Messages rotated through on positive-feedback events.
const POSITIVE_FEEDBACK_MESSAGES: [&str; 6] = [
    "Great job! You're doing well. Keep it up!",
    "Excellent focus! Keep up the good work!",
    "Perfect! You're maintaining good exam behavior!",
    "Well done! Your focus is impressive!",
    "Fantastic! Keep maintaining this level of focus!",
    "Outstanding! You're following all exam guidelines!",
];

/// Outcome of a state mutation together with the events it produced, in
/// emission order.
#[derive(Debug)]
pub struct Transition<O> {
    /// Operation result.
    pub outcome: O,
    /// Events emitted by the mutation.
    pub events: Vec<RiskEvent>,
}

impl<O> Transition<O> {
    fn quiet(outcome: O) -> Self {
        Self {
            outcome,
            events: Vec::new(),
        }
    }
}

/// Mutable risk record of one session.
#[derive(Debug, Clone)]
pub struct SessionRiskState {
    session_id: SessionId,
    exam_id: ExamId,
    student_id: Option<String>,
    status: SessionStatus,
    cumulative_score: f64,
    alert_count: u32,
    clean_streak: u32,
    /// Sequence token handed to the next accepted frame.
    next_seq: u64,
    /// Sequence token of the outstanding analysis.
    in_flight: Option<u64>,
    last_accepted_seq: u64,
    analysis_failures: u32,
    auto_submit_threshold: f64,
    /// Per-session event counter; the last value handed out.
    event_seq: u64,
    feedback_cursor: usize,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
}

impl SessionRiskState {
    /// Create an `Active` session with a zero score.
    pub fn new(params: &NewSession, config: &RiskConfig) -> Self {
        Self {
            session_id: params.session_id.clone(),
            exam_id: params.exam_id.clone(),
            student_id: params.student_id.clone(),
            status: SessionStatus::Active,
            cumulative_score: 0.0,
            alert_count: 0,
            clean_streak: 0,
            next_seq: 1,
            in_flight: None,
            last_accepted_seq: 0,
            analysis_failures: 0,
            auto_submit_threshold: params
                .auto_submit_threshold
                .unwrap_or(config.auto_submit_threshold),
            event_seq: 0,
            feedback_cursor: 0,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    /// Lifecycle status.
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Sequence token of the outstanding analysis, if any.
    pub fn in_flight(&self) -> Option<u64> {
        self.in_flight
    }

    /// Consistent copy of the observable fields.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            exam_id: self.exam_id.clone(),
            student_id: self.student_id.clone(),
            status: self.status,
            cumulative_score: self.cumulative_score,
            alert_count: self.alert_count,
            clean_streak: self.clean_streak,
            in_flight: self.in_flight.is_some(),
            last_accepted_seq: self.last_accepted_seq,
            last_event_seq: self.event_seq,
            analysis_failures: self.analysis_failures,
            auto_submit_threshold: self.auto_submit_threshold,
            started_at: self.started_at,
            ended_at: self.ended_at,
        }
    }

    // -----------------------------------------------------------------------
    // Frame submission
    // -----------------------------------------------------------------------

    /// Reserve the analysis slot and hand out the next sequence token.
    pub fn begin_analysis(&mut self) -> FrameDecision {
        if self.status.is_terminal() {
            return FrameDecision::Rejected(RejectReason::SessionNotActive);
        }
        if self.in_flight.is_some() {
            return FrameDecision::Rejected(RejectReason::AnalysisBusy);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.in_flight = Some(seq);
        FrameDecision::Accepted(seq)
    }

    // -----------------------------------------------------------------------
    // Result application
    // -----------------------------------------------------------------------

    /// Apply the completion of the analysis carrying `seq`.
    pub fn apply_result(
        &mut self,
        seq: u64,
        outcome: AnalysisOutcome,
        config: &RiskConfig,
    ) -> Transition<ApplyOutcome> {
        // A completion frees the slot only if it is not older than the
        // outstanding request.
        if self.in_flight.is_some_and(|pending| pending <= seq) {
            self.in_flight = None;
        }
        if self.status.is_terminal() {
            return Transition::quiet(ApplyOutcome::AlreadyTerminal);
        }
        if seq <= self.last_accepted_seq {
            return Transition::quiet(ApplyOutcome::Stale);
        }
        self.last_accepted_seq = seq;
        self.next_seq = self.next_seq.max(seq + 1);

        let mut events = Vec::new();
        match outcome {
            AnalysisOutcome::Completed(result) => {
                self.apply_analysis(seq, result, config, &mut events);
            }
            AnalysisOutcome::Failed(detail) => {
                self.analysis_failures += 1;
                let kind = RiskEventKind::AnalysisDiagnostic {
                    seq,
                    timed_out: false,
                    detail,
                };
                events.push(self.emit(kind));
            }
            AnalysisOutcome::TimedOut => {
                self.analysis_failures += 1;
                let kind = RiskEventKind::AnalysisDiagnostic {
                    seq,
                    timed_out: true,
                    detail: format!(
                        "analysis did not complete within {} ms",
                        config.analysis_timeout_ms
                    ),
                };
                events.push(self.emit(kind));
            }
        }

        Transition {
            outcome: ApplyOutcome::Applied,
            events,
        }
    }

    fn apply_analysis(
        &mut self,
        seq: u64,
        result: AnalysisResult,
        config: &RiskConfig,
        events: &mut Vec<RiskEvent>,
    ) {
        if !result.suspicious {
            self.clean_streak += 1;
            let interval = config.positive_feedback_interval;
            if interval > 0 && self.clean_streak % interval == 0 {
                let decay = config.score_decay_amount.min(self.cumulative_score);
                self.cumulative_score -= decay;
                let message = POSITIVE_FEEDBACK_MESSAGES
                    [self.feedback_cursor % POSITIVE_FEEDBACK_MESSAGES.len()]
                .to_string();
                self.feedback_cursor += 1;
                let kind = RiskEventKind::PositiveFeedback {
                    message,
                    clean_streak: self.clean_streak,
                    score_decay: decay,
                    cumulative_score: self.cumulative_score,
                };
                events.push(self.emit(kind));
            }
            return;
        }

        // Low-confidence suspicion, or suspicion that names no issue, is
        // inconclusive: no score, no alert and the clean streak survives.
        if !config.is_alert(&result) {
            return;
        }

        self.clean_streak = 0;
        let increment = result.score_increment();
        self.raise_alert(
            AlertSource::Analysis { seq },
            result,
            increment,
            events,
        );
    }

    // -----------------------------------------------------------------------
    // Client signals
    // -----------------------------------------------------------------------

    /// Apply a client-reported integrity signal.
    ///
    /// Signals count as alerts but leave the clean streak alone, since the
    /// streak only tracks analysis results.
    pub fn apply_signal(&mut self, signal: SignalKind, config: &RiskConfig) -> Transition<ApplyOutcome> {
        if self.status.is_terminal() {
            return Transition::quiet(ApplyOutcome::AlreadyTerminal);
        }
        let result = AnalysisResult::new(true, 1.0, signal.severity(), signal.description().to_string())
            .with_issue(signal.issue_kind());
        let mut events = Vec::new();
        self.raise_alert(
            AlertSource::Signal { signal },
            result,
            config.signal_increment(signal),
            &mut events,
        );
        Transition {
            outcome: ApplyOutcome::Applied,
            events,
        }
    }

    /// Score the alert and, in the same step, auto-submit on crossing the
    /// threshold.
    fn raise_alert(
        &mut self,
        source: AlertSource,
        result: AnalysisResult,
        increment: f64,
        events: &mut Vec<RiskEvent>,
    ) {
        self.cumulative_score += increment;
        self.alert_count += 1;
        let kind = RiskEventKind::Alert {
            source,
            issues: result.issues,
            severity: result.severity,
            confidence: result.confidence,
            description: result.description,
            score_increment: increment,
            cumulative_score: self.cumulative_score,
            alert_count: self.alert_count,
            auto_submit_threshold: self.auto_submit_threshold,
            evidence_id: result.evidence_id,
        };
        events.push(self.emit(kind));

        if self.cumulative_score >= self.auto_submit_threshold {
            let reason = TerminationReason::ScoreThreshold {
                threshold: self.auto_submit_threshold,
            };
            events.push(self.terminate(SessionStatus::AutoSubmitted, reason));
        }
    }

    // -----------------------------------------------------------------------
    // Terminal transitions
    // -----------------------------------------------------------------------

    /// Student- or timer-driven submission.
    pub fn submit(&mut self, origin: SubmitOrigin) -> Transition<SubmitOutcome> {
        if self.status.is_terminal() {
            return Transition::quiet(SubmitOutcome::AlreadyTerminal);
        }
        self.close_out(SessionStatus::Submitted);
        let kind = RiskEventKind::Submitted {
            origin,
            cumulative_score: self.cumulative_score,
            alert_count: self.alert_count,
        };
        let event = self.emit(kind);
        Transition {
            outcome: SubmitOutcome::Ok,
            events: vec![event],
        }
    }

    /// Administrative termination; ends as `AutoSubmitted`.
    pub fn force_terminate(&mut self, reason: TerminationReason) -> Transition<SubmitOutcome> {
        if self.status.is_terminal() {
            return Transition::quiet(SubmitOutcome::AlreadyTerminal);
        }
        let event = self.terminate(SessionStatus::AutoSubmitted, reason);
        Transition {
            outcome: SubmitOutcome::Ok,
            events: vec![event],
        }
    }

    /// Mark a finished session as cleaned up. Returns `false` while active
    /// and for a session that is already `Closed`, so only one caller ever
    /// performs the close.
    pub fn close(&mut self) -> bool {
        if !matches!(
            self.status,
            SessionStatus::Submitted | SessionStatus::AutoSubmitted
        ) {
            return false;
        }
        self.status = SessionStatus::Closed;
        true
    }

    fn terminate(&mut self, status: SessionStatus, reason: TerminationReason) -> RiskEvent {
        self.close_out(status);
        let kind = RiskEventKind::AutoSubmitted {
            reason,
            cumulative_score: self.cumulative_score,
            alert_count: self.alert_count,
        };
        self.emit(kind)
    }

    fn close_out(&mut self, status: SessionStatus) {
        self.status = status;
        self.in_flight = None;
        self.ended_at = Some(Utc::now());
    }

    fn emit(&mut self, kind: RiskEventKind) -> RiskEvent {
        self.event_seq += 1;
        RiskEvent {
            id: Uuid::new_v4(),
            session_id: self.session_id.clone(),
            exam_id: self.exam_id.clone(),
            student_id: self.student_id.clone(),
            sequence: self.event_seq,
            timestamp: Utc::now(),
            kind,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
