//! Core types, traits, and errors for ExamGuard
//!
//! This crate contains the foundational types shared across all ExamGuard
//! components: session and exam identifiers, analysis results, the risk
//! events emitted by the engine, configuration structs, and the collaborator
//! interfaces (vision-analysis gateway, evidence capture, event persistence).

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// Unique identifier for one student's attempt at one exam.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of an exam. All sessions of one exam share a proctor room.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExamId(pub String);

impl ExamId {
    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ExamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExamId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ExamId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier handed out to an event observer on subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObserverId(pub Uuid);

impl ObserverId {
    /// Create a new random observer ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ObserverId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ObserverId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Issue & signal types
// ---------------------------------------------------------------------------

/// Closed set of behaviours the vision analysis can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// Student is looking away from the screen for a sustained period.
    LookingAway,
    /// More than one person is visible.
    MultiplePeople,
    /// A phone or other electronic device is in use.
    PhoneDetected,
    /// Student is reading from books, notes, or papers.
    ReadingFromMaterial,
    /// Student has left the frame or is only partially visible.
    StudentAbsent,
    /// Student is speaking to someone off-camera.
    TalkingToSomeone,
    /// Browser tab or window switch reported by the client.
    TabSwitch,
    /// Anything suspicious that does not fit a more specific kind.
    SuspiciousActivity,
}

impl IssueKind {
    /// Every issue kind, in declaration order.
    pub const ALL: [IssueKind; 8] = [
        Self::LookingAway,
        Self::MultiplePeople,
        Self::PhoneDetected,
        Self::ReadingFromMaterial,
        Self::StudentAbsent,
        Self::TalkingToSomeone,
        Self::TabSwitch,
        Self::SuspiciousActivity,
    ];

    /// Stable wire name (matches the serde representation).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LookingAway => "looking_away",
            Self::MultiplePeople => "multiple_people",
            Self::PhoneDetected => "phone_detected",
            Self::ReadingFromMaterial => "reading_from_material",
            Self::StudentAbsent => "student_absent",
            Self::TalkingToSomeone => "talking_to_someone",
            Self::TabSwitch => "tab_switch",
            Self::SuspiciousActivity => "suspicious_activity",
        }
    }

    /// Human-readable label shown to proctors.
    pub fn label(self) -> &'static str {
        match self {
            Self::LookingAway => "Looking away from the screen",
            Self::MultiplePeople => "Multiple people in frame",
            Self::PhoneDetected => "Phone or device in use",
            Self::ReadingFromMaterial => "Reading from unauthorized material",
            Self::StudentAbsent => "Student not visible",
            Self::TalkingToSomeone => "Talking to someone off-camera",
            Self::TabSwitch => "Browser tab or window switch",
            Self::SuspiciousActivity => "Suspicious activity",
        }
    }
}

impl std::fmt::Display for IssueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for IssueKind {
    type Err = String;

    /// Accepts the wire name plus the loose spellings vision models tend to
    /// produce (`"Phone Detected"`, `"multiple-people"`, `"phone"`).
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalised = s.trim().to_lowercase().replace([' ', '-'], "_");
        match normalised.as_str() {
            "looking_away" | "gaze_away" => Ok(Self::LookingAway),
            "multiple_people" | "multiple_persons" | "another_person" => Ok(Self::MultiplePeople),
            "phone_detected" | "phone" | "device_detected" | "phone_in_use" => {
                Ok(Self::PhoneDetected)
            }
            "reading_from_material" | "reading_material" | "reading_notes" => {
                Ok(Self::ReadingFromMaterial)
            }
            "student_absent" | "absent" | "no_face" | "not_visible" => Ok(Self::StudentAbsent),
            "talking_to_someone" | "talking" => Ok(Self::TalkingToSomeone),
            "tab_switch" => Ok(Self::TabSwitch),
            "suspicious_activity" | "suspicious" => Ok(Self::SuspiciousActivity),
            _ => Err(format!("unknown issue kind: {s}")),
        }
    }
}

/// Integrity signals reported directly by the exam client, outside the
/// image-analysis pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    /// The student switched to another browser tab.
    TabSwitch,
    /// The exam window lost focus.
    WindowBlur,
    /// The student left fullscreen mode.
    FullscreenExit,
    /// A copy or paste was attempted.
    CopyPaste,
}

impl SignalKind {
    /// Stable wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TabSwitch => "tab_switch",
            Self::WindowBlur => "window_blur",
            Self::FullscreenExit => "fullscreen_exit",
            Self::CopyPaste => "copy_paste",
        }
    }

    /// Issue kind recorded on the alert raised for this signal.
    pub fn issue_kind(self) -> IssueKind {
        match self {
            Self::TabSwitch | Self::WindowBlur => IssueKind::TabSwitch,
            Self::FullscreenExit | Self::CopyPaste => IssueKind::SuspiciousActivity,
        }
    }

    /// Severity (1–5) attached to the alert raised for this signal.
    pub fn severity(self) -> u8 {
        match self {
            Self::WindowBlur => 1,
            Self::TabSwitch | Self::FullscreenExit | Self::CopyPaste => 2,
        }
    }

    /// Description attached to the alert raised for this signal.
    pub fn description(self) -> &'static str {
        match self {
            Self::TabSwitch => "Student switched browser tab",
            Self::WindowBlur => "Exam window lost focus",
            Self::FullscreenExit => "Student left fullscreen mode",
            Self::CopyPaste => "Copy or paste attempt detected",
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SignalKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "tab_switch" => Ok(Self::TabSwitch),
            "window_blur" | "blur" => Ok(Self::WindowBlur),
            "fullscreen_exit" => Ok(Self::FullscreenExit),
            "copy_paste" | "copy" | "paste" => Ok(Self::CopyPaste),
            _ => Err(format!("unknown signal kind: {s}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Analysis types
// ---------------------------------------------------------------------------

/// One sampled frame submitted for analysis: the webcam image and an
/// optional auxiliary image (usually a screen capture).
#[derive(Debug, Clone)]
pub struct Frame {
    /// Primary (webcam) image bytes.
    pub primary: Bytes,
    /// Optional secondary (screen capture) image bytes.
    pub secondary: Option<Bytes>,
}

impl Frame {
    /// Create a frame with only a primary image.
    pub fn new(primary: impl Into<Bytes>) -> Self {
        Self {
            primary: primary.into(),
            secondary: None,
        }
    }

    /// Attach a secondary image.
    pub fn with_secondary(mut self, secondary: impl Into<Bytes>) -> Self {
        self.secondary = Some(secondary.into());
        self
    }
}

/// Lowest severity an analysis result may carry.
pub const MIN_SEVERITY: u8 = 1;
/// Highest severity an analysis result may carry.
pub const MAX_SEVERITY: u8 = 5;

/// Classification returned by the vision-analysis gateway for one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Whether the model considers the frame suspicious.
    pub suspicious: bool,
    /// Model confidence (0.0 to 1.0).
    pub confidence: f64,
    /// Issues detected in the frame.
    pub issues: BTreeSet<IssueKind>,
    /// Severity (1 to 5).
    pub severity: u8,
    /// Short free-text description from the model.
    pub description: String,
    /// Reference to the captured frame, once evidence has been stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_id: Option<String>,
}

impl AnalysisResult {
    /// Create a result, clamping confidence to `[0, 1]` and severity to `[1, 5]`.
    pub fn new(suspicious: bool, confidence: f64, severity: u8, description: String) -> Self {
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            suspicious,
            confidence,
            issues: BTreeSet::new(),
            severity: severity.clamp(MIN_SEVERITY, MAX_SEVERITY),
            description,
            evidence_id: None,
        }
    }

    /// A not-suspicious result.
    pub fn clean(confidence: f64) -> Self {
        Self::new(false, confidence, MIN_SEVERITY, "No violation observed".to_string())
    }

    /// Add a detected issue.
    pub fn with_issue(mut self, issue: IssueKind) -> Self {
        self.issues.insert(issue);
        self
    }

    /// Attach the reference of the stored evidence frame.
    pub fn with_evidence(mut self, evidence_id: impl Into<String>) -> Self {
        self.evidence_id = Some(evidence_id.into());
        self
    }

    /// Issue the evidence is filed under: the first detected issue.
    pub fn primary_issue(&self) -> IssueKind {
        self.issues
            .iter()
            .next()
            .copied()
            .unwrap_or(IssueKind::SuspiciousActivity)
    }

    /// Score contribution of this result when it counts as an alert.
    pub fn score_increment(&self) -> f64 {
        f64::from(self.severity) * self.confidence
    }
}

/// How an analysis request ended.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisOutcome {
    /// The gateway returned a classification.
    Completed(AnalysisResult),
    /// The gateway failed.
    Failed(String),
    /// The gateway did not answer within the configured timeout.
    TimedOut,
}

/// Completion message for an analysis started by `submit_frame`, applied
/// through the same per-session path as every other mutation.
#[derive(Debug, Clone)]
pub struct AnalysisCompletion {
    /// Session the analysis belongs to.
    pub session_id: SessionId,
    /// Sequence token assigned at submission.
    pub seq: u64,
    /// Result of the gateway call.
    pub outcome: AnalysisOutcome,
}

// ---------------------------------------------------------------------------
// Session types
// ---------------------------------------------------------------------------

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Exam in progress; the only status that accepts mutations.
    Active,
    /// Submitted by the student or by the exam timer.
    Submitted,
    /// Forcibly submitted (score threshold or administrative action).
    AutoSubmitted,
    /// Post-terminal cleanup done; evicted from the registry.
    Closed,
}

impl SessionStatus {
    /// `true` for `Submitted`, `AutoSubmitted` and `Closed`.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Submitted => write!(f, "submitted"),
            Self::AutoSubmitted => write!(f, "auto_submitted"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Parameters for starting a session.
#[derive(Debug, Clone)]
pub struct NewSession {
    /// Session identifier (must not already be registered).
    pub session_id: SessionId,
    /// Exam the session belongs to.
    pub exam_id: ExamId,
    /// Student taking the exam, if known.
    pub student_id: Option<String>,
    /// Per-exam override of the auto-submit threshold.
    pub auto_submit_threshold: Option<f64>,
    /// Exam time limit; the session is submitted when it expires.
    pub time_limit: Option<Duration>,
}

impl NewSession {
    /// Create session parameters with defaults for everything optional.
    pub fn new(session_id: impl Into<SessionId>, exam_id: impl Into<ExamId>) -> Self {
        Self {
            session_id: session_id.into(),
            exam_id: exam_id.into(),
            student_id: None,
            auto_submit_threshold: None,
            time_limit: None,
        }
    }

    /// Set the student identifier.
    pub fn with_student(mut self, student_id: impl Into<String>) -> Self {
        self.student_id = Some(student_id.into());
        self
    }

    /// Override the auto-submit threshold for this session.
    pub fn with_auto_submit_threshold(mut self, threshold: f64) -> Self {
        self.auto_submit_threshold = Some(threshold);
        self
    }

    /// Arm an exam timer.
    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = Some(limit);
        self
    }
}

/// Point-in-time, internally consistent view of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Session identifier.
    pub session_id: SessionId,
    /// Owning exam.
    pub exam_id: ExamId,
    /// Student taking the exam, if known.
    pub student_id: Option<String>,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Accumulated suspicion score.
    pub cumulative_score: f64,
    /// Number of alerts raised.
    pub alert_count: u32,
    /// Consecutive clean analysis results.
    pub clean_streak: u32,
    /// Whether an analysis is outstanding.
    pub in_flight: bool,
    /// Sequence number of the last applied analysis result.
    pub last_accepted_seq: u64,
    /// Sequence of the last event emitted for this session; events up to
    /// it are reflected in this snapshot.
    pub last_event_seq: u64,
    /// Gateway failures and timeouts (never part of the score).
    pub analysis_failures: u32,
    /// Threshold at which the session is auto-submitted.
    pub auto_submit_threshold: f64,
    /// When the session started.
    pub started_at: DateTime<Utc>,
    /// When the session reached a terminal status.
    pub ended_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Operation outcomes
// ---------------------------------------------------------------------------

/// Why a frame submission was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// An analysis is already outstanding (load shedding, not an error).
    AnalysisBusy,
    /// The session exists but is no longer active.
    SessionNotActive,
    /// No such session is registered.
    SessionUnknown,
}

/// Result of `submit_frame`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDecision {
    /// Analysis dispatched with the given sequence token.
    Accepted(u64),
    /// Frame dropped.
    Rejected(RejectReason),
}

/// Result of applying an analysis result or client signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The state was updated (possibly a no-change inconclusive result).
    Applied,
    /// The sequence number was not newer than the last applied one.
    Stale,
    /// The session is terminal; nothing changed and nothing was emitted.
    AlreadyTerminal,
}

/// Result of `submit` and `force_terminate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The session transitioned to a terminal status.
    Ok,
    /// The session was already terminal; nothing changed.
    AlreadyTerminal,
}

/// What triggered a regular submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitOrigin {
    /// The student submitted.
    Student,
    /// The exam timer expired.
    TimeLimit,
}

/// Why a session was forcibly submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TerminationReason {
    /// The cumulative score reached the auto-submit threshold.
    ScoreThreshold {
        /// Threshold that was crossed.
        threshold: f64,
    },
    /// A proctor or administrator terminated the session.
    Administrative {
        /// Free-text reason.
        reason: String,
    },
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ScoreThreshold { threshold } => {
                write!(f, "cheating threshold exceeded ({threshold})")
            }
            Self::Administrative { reason } => write!(f, "terminated by proctor: {reason}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Risk events
// ---------------------------------------------------------------------------

/// Where an alert originated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertSource {
    /// Image analysis with the given sequence token.
    Analysis {
        /// Sequence token of the analysed frame.
        seq: u64,
    },
    /// Client-reported integrity signal.
    Signal {
        /// Reported signal.
        signal: SignalKind,
    },
}

/// Payload of a risk event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RiskEventKind {
    /// Suspicious behaviour crossed the confidence threshold.
    Alert {
        /// Analysis or client signal.
        source: AlertSource,
        /// Detected issues.
        issues: BTreeSet<IssueKind>,
        /// Severity (1–5).
        severity: u8,
        /// Confidence (0.0–1.0).
        confidence: f64,
        /// Description for the proctor and the student warning.
        description: String,
        /// Amount added to the score.
        score_increment: f64,
        /// Score after the increment.
        cumulative_score: f64,
        /// Alert count after this alert.
        alert_count: u32,
        /// Threshold the score is compared against.
        auto_submit_threshold: f64,
        /// Stored frame behind an analysis alert, when evidence capture is on.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        evidence_id: Option<String>,
    },
    /// A run of clean results earned a score decay.
    PositiveFeedback {
        /// Encouraging message for the student.
        message: String,
        /// Current clean streak.
        clean_streak: u32,
        /// Amount actually removed from the score (floored at zero).
        score_decay: f64,
        /// Score after the decay.
        cumulative_score: f64,
    },
    /// The session was forcibly submitted.
    AutoSubmitted {
        /// Trigger.
        reason: TerminationReason,
        /// Final score.
        cumulative_score: f64,
        /// Final alert count.
        alert_count: u32,
    },
    /// The session was submitted by the student or the exam timer.
    Submitted {
        /// Trigger.
        origin: SubmitOrigin,
        /// Final score.
        cumulative_score: f64,
        /// Final alert count.
        alert_count: u32,
    },
    /// The analysis gateway failed or timed out. Never counts as evidence.
    AnalysisDiagnostic {
        /// Sequence token of the failed analysis.
        seq: u64,
        /// Whether the failure was a timeout.
        timed_out: bool,
        /// Failure detail.
        detail: String,
    },
}

impl RiskEventKind {
    /// Short name used in logs and SSE event names.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Alert { .. } => "alert",
            Self::PositiveFeedback { .. } => "positive_feedback",
            Self::AutoSubmitted { .. } => "auto_submitted",
            Self::Submitted { .. } => "submitted",
            Self::AnalysisDiagnostic { .. } => "analysis_diagnostic",
        }
    }

    /// `true` for events that end the session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::AutoSubmitted { .. } | Self::Submitted { .. })
    }
}

/// An event emitted by the risk engine for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskEvent {
    /// Unique identifier for this event.
    pub id: Uuid,
    /// Session the event belongs to.
    pub session_id: SessionId,
    /// Exam (proctor room) the session belongs to.
    pub exam_id: ExamId,
    /// Student, if known.
    pub student_id: Option<String>,
    /// Per-session emission counter, starting at 1 and without gaps.
    pub sequence: u64,
    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,
    /// Event payload.
    #[serde(flatten)]
    pub kind: RiskEventKind,
}

// ---------------------------------------------------------------------------
// Configuration types
// ---------------------------------------------------------------------------

/// Top-level configuration for the ExamGuard server.
///
/// # Example (YAML)
///
/// ```yaml
/// listen_addr: "0.0.0.0:8000"
/// risk:
///   alert_confidence_threshold: 0.7
///   auto_submit_threshold: 10
/// gateway:
///   provider: ollama
///   base_url: "http://localhost:11434"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExamGuardConfig {
    /// Address the HTTP server binds to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Risk scoring policy.
    #[serde(default)]
    pub risk: RiskConfig,
    /// Vision-analysis gateway.
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Circuit breaker around the gateway.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    /// Event fan-out.
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    /// Evidence frames kept for alerts.
    #[serde(default)]
    pub evidence: EvidenceConfig,
    /// Logging.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Graceful shutdown.
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8000".to_string()
}

impl Default for ExamGuardConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            risk: RiskConfig::default(),
            gateway: GatewayConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            dispatcher: DispatcherConfig::default(),
            evidence: EvidenceConfig::default(),
            logging: LoggingConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

/// Risk scoring policy. All constants are tunable; none is assumed optimal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Minimum confidence (0.0–1.0) for a suspicious result to count as an alert.
    #[serde(default = "default_alert_confidence_threshold")]
    pub alert_confidence_threshold: f64,
    /// Score at which a session is auto-submitted.
    #[serde(default = "default_auto_submit_threshold")]
    pub auto_submit_threshold: f64,
    /// Number of consecutive clean results per positive-feedback event.
    /// `0` disables positive feedback.
    #[serde(default = "default_positive_feedback_interval")]
    pub positive_feedback_interval: u32,
    /// Score removed on each positive-feedback event (floored at zero).
    #[serde(default = "default_score_decay_amount")]
    pub score_decay_amount: f64,
    /// Fixed score increment per client signal kind.
    #[serde(default = "default_signal_score_increments")]
    pub signal_score_increments: BTreeMap<SignalKind, f64>,
    /// Upper bound on a single gateway call, in milliseconds.
    #[serde(default = "default_analysis_timeout_ms")]
    pub analysis_timeout_ms: u64,
}

fn default_alert_confidence_threshold() -> f64 {
    0.7
}

fn default_auto_submit_threshold() -> f64 {
    10.0
}

fn default_positive_feedback_interval() -> u32 {
    15
}

fn default_score_decay_amount() -> f64 {
    1.0
}

fn default_signal_increment(kind: SignalKind) -> f64 {
    match kind {
        SignalKind::TabSwitch | SignalKind::FullscreenExit => 2.0,
        SignalKind::WindowBlur | SignalKind::CopyPaste => 1.0,
    }
}

fn default_signal_score_increments() -> BTreeMap<SignalKind, f64> {
    [
        SignalKind::TabSwitch,
        SignalKind::WindowBlur,
        SignalKind::FullscreenExit,
        SignalKind::CopyPaste,
    ]
    .into_iter()
    .map(|k| (k, default_signal_increment(k)))
    .collect()
}

fn default_analysis_timeout_ms() -> u64 {
    5_000
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            alert_confidence_threshold: default_alert_confidence_threshold(),
            auto_submit_threshold: default_auto_submit_threshold(),
            positive_feedback_interval: default_positive_feedback_interval(),
            score_decay_amount: default_score_decay_amount(),
            signal_score_increments: default_signal_score_increments(),
            analysis_timeout_ms: default_analysis_timeout_ms(),
        }
    }
}

impl RiskConfig {
    /// Gateway timeout as a [`Duration`].
    pub fn analysis_timeout(&self) -> Duration {
        Duration::from_millis(self.analysis_timeout_ms)
    }

    /// Score increment for a client signal. Kinds missing from the map fall
    /// back to the built-in defaults.
    pub fn signal_increment(&self, kind: SignalKind) -> f64 {
        self.signal_score_increments
            .get(&kind)
            .copied()
            .unwrap_or_else(|| default_signal_increment(kind))
    }

    /// Whether an analysis result is strong enough to raise an alert: it
    /// must be suspicious, name at least one issue and meet the confidence
    /// threshold. Anything else suspicious is inconclusive.
    pub fn is_alert(&self, result: &AnalysisResult) -> bool {
        result.suspicious
            && !result.issues.is_empty()
            && result.confidence >= self.alert_confidence_threshold
    }

    /// Reject values that would make the state machine meaningless.
    ///
    /// # Errors
    ///
    /// Returns [`ExamGuardError::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.alert_confidence_threshold) {
            return Err(ExamGuardError::Config(format!(
                "alert_confidence_threshold must be within [0, 1], got {}",
                self.alert_confidence_threshold
            )));
        }
        if !self.auto_submit_threshold.is_finite() || self.auto_submit_threshold <= 0.0 {
            return Err(ExamGuardError::Config(format!(
                "auto_submit_threshold must be positive, got {}",
                self.auto_submit_threshold
            )));
        }
        if !self.score_decay_amount.is_finite() || self.score_decay_amount < 0.0 {
            return Err(ExamGuardError::Config(format!(
                "score_decay_amount must be non-negative, got {}",
                self.score_decay_amount
            )));
        }
        if let Some((kind, inc)) = self
            .signal_score_increments
            .iter()
            .find(|(_, v)| !v.is_finite() || **v < 0.0)
        {
            return Err(ExamGuardError::Config(format!(
                "signal increment for {kind} must be non-negative, got {inc}"
            )));
        }
        if self.analysis_timeout_ms == 0 {
            return Err(ExamGuardError::Config(
                "analysis_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Vision model backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayProvider {
    /// Local Ollama server (`/api/generate`).
    Ollama,
    /// OpenAI-compatible chat completions (`/v1/chat/completions`).
    #[serde(rename = "openai")]
    OpenAi,
}

/// Vision-analysis gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Which backend to call.
    #[serde(default = "default_gateway_provider")]
    pub provider: GatewayProvider,
    /// Base URL of the backend.
    #[serde(default = "default_gateway_base_url")]
    pub base_url: String,
    /// Model name.
    #[serde(default = "default_gateway_model")]
    pub model: String,
    /// Bearer token (OpenAI-compatible backends).
    #[serde(default)]
    pub api_key: Option<String>,
    /// TCP connect timeout in milliseconds.
    #[serde(default = "default_gateway_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_gateway_provider() -> GatewayProvider {
    GatewayProvider::Ollama
}

fn default_gateway_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_gateway_model() -> String {
    "qwen3-vl:8b".to_string()
}

fn default_gateway_connect_timeout_ms() -> u64 {
    2_000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            provider: default_gateway_provider(),
            base_url: default_gateway_base_url(),
            model: default_gateway_model(),
            api_key: None,
            connect_timeout_ms: default_gateway_connect_timeout_ms(),
        }
    }
}

/// Circuit breaker configuration for the analysis gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Enable the breaker.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Consecutive failures before the circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Time the circuit stays open before probing, in milliseconds.
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
    /// Probe calls allowed while half-open.
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
}

fn default_true() -> bool {
    true
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_ms() -> u64 {
    30_000
}

fn default_half_open_max_calls() -> u32 {
    1
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

/// Event dispatcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Per-observer buffer. Events for a full buffer are dropped.
    #[serde(default = "default_observer_buffer")]
    pub observer_buffer: usize,
}

fn default_observer_buffer() -> usize {
    64
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            observer_buffer: default_observer_buffer(),
        }
    }
}

/// Evidence capture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceConfig {
    /// Keep the frame behind each analysis alert.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Frames kept in memory; the oldest is dropped beyond this.
    #[serde(default = "default_evidence_max_items")]
    pub max_items: usize,
}

fn default_evidence_max_items() -> usize {
    1_000
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            max_items: default_evidence_max_items(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format: `text` (human-readable) or `json` (structured).
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Graceful shutdown configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Maximum seconds to wait for outstanding analyses after a shutdown
    /// signal before the process exits anyway.
    #[serde(default = "default_shutdown_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_shutdown_timeout_seconds() -> u64 {
    10
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_shutdown_timeout_seconds(),
        }
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Core error types.
#[derive(thiserror::Error, Debug)]
pub enum ExamGuardError {
    /// The session is not registered (never started or already closed).
    #[error("Unknown session: {0}")]
    SessionUnknown(SessionId),

    /// A session with this identifier is already registered.
    #[error("Session already exists: {0}")]
    AlreadyExists(SessionId),

    /// The operation requires a terminal session.
    #[error("Session is still active: {0}")]
    NotTerminal(SessionId),

    /// The analysis gateway could not be reached or its reply not read.
    #[error("Analysis gateway error: {0}")]
    Gateway(String),

    /// The analysis gateway answered with a non-success HTTP status.
    #[error("Analysis gateway returned HTTP {status}: {detail}")]
    GatewayStatus {
        /// HTTP status code.
        status: u16,
        /// Backend name and a prefix of the response body.
        detail: String,
    },

    /// The model answered with something that is not a usable classification.
    #[error("Invalid analysis output: {0}")]
    InvalidAnalysis(String),

    /// Event or evidence persistence error.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Convenience alias for `std::result::Result<T, ExamGuardError>`.
pub type Result<T> = std::result::Result<T, ExamGuardError>;

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

/// Vision-analysis capability. Implementations may be slow (seconds), may
/// fail, and give no ordering guarantee between calls.
#[async_trait::async_trait]
pub trait AnalysisGateway: Send + Sync {
    /// Classify one frame.
    async fn analyze(&self, frame: &Frame) -> Result<AnalysisResult>;

    /// Gateway name for logs and health output.
    fn name(&self) -> &'static str;

    /// Check whether the backend is reachable.
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// Evidence collaborator. Keeps the frame behind an accepted analysis
/// alert and returns a reference that travels on the alert event.
#[async_trait::async_trait]
pub trait EvidenceStore: Send + Sync {
    /// Store `image` for `session_id`, filed under `issue`. Returns the
    /// evidence reference.
    async fn store(&self, session_id: &SessionId, issue: IssueKind, image: Bytes) -> Result<String>;

    /// Health check for the store.
    async fn health_check(&self) -> Result<()>;
}

/// Persistence collaborator. The engine hands every emitted event over
/// exactly once and never retries.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    /// Durably record one event.
    async fn record(&self, event: &RiskEvent) -> Result<()>;

    /// Health check for the sink.
    async fn health_check(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
