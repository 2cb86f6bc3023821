//! Post-session behaviour report built from a session's event history.

use examguard_core::{AlertSource, IssueKind, RiskEvent, RiskEventKind, SessionId, SessionStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Coarse risk bucket for a finished session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Moderate,
    High,
    Critical,
}

impl RiskLevel {
    /// Bucket a normalised 0–10 risk score.
    pub fn from_score(score: f64) -> Self {
        if score < 2.0 {
            Self::Low
        } else if score < 5.0 {
            Self::Moderate
        } else if score < 8.0 {
            Self::High
        } else {
            Self::Critical
        }
    }

    /// One-sentence summary shown to reviewers.
    pub fn summary(self) -> &'static str {
        match self {
            Self::Low => "Low risk - Student behavior appears normal with minimal suspicious activity.",
            Self::Moderate => {
                "Moderate risk - Some suspicious behaviors detected. Manual review recommended."
            }
            Self::High => "High risk - Multiple instances of suspicious behavior detected. Exam integrity may be compromised.",
            Self::Critical => "Critical risk - Severe and frequent cheating behaviors detected. Exam should be invalidated.",
        }
    }
}

/// Aggregated view of a session's alerts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorReport {
    pub session_id: SessionId,
    /// Alerts from analysis and client signals.
    pub total_alerts: u32,
    /// Alerts per issue kind. An alert with several issues counts once per issue.
    pub issue_breakdown: BTreeMap<IssueKind, u32>,
    /// Reviewer-facing lines such as `"Phone or device in use (2)"`, most
    /// frequent issue first.
    pub findings: Vec<String>,
    /// Alerts that came from client signals.
    pub signal_alerts: u32,
    /// `min(Σ severity × confidence / 10, 10)`, rounded to two decimals.
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub summary: String,
    pub positive_feedback_count: u32,
    pub analysis_failures: u32,
    /// Terminal status, if the history contains the terminal event.
    pub final_status: Option<SessionStatus>,
}

impl BehaviorReport {
    /// Build a report from the events recorded for `session_id`. Events of
    /// other sessions are ignored.
    pub fn from_events(session_id: &SessionId, events: &[RiskEvent]) -> Self {
        let mut total_alerts = 0;
        let mut signal_alerts = 0;
        let mut issue_breakdown = BTreeMap::new();
        let mut weighted = 0.0;
        let mut positive_feedback_count = 0;
        let mut analysis_failures = 0;
        let mut final_status = None;

        for event in events.iter().filter(|e| &e.session_id == session_id) {
            match &event.kind {
                RiskEventKind::Alert {
                    source,
                    issues,
                    severity,
                    confidence,
                    ..
                } => {
                    total_alerts += 1;
                    if matches!(source, AlertSource::Signal { .. }) {
                        signal_alerts += 1;
                    }
                    for issue in issues {
                        *issue_breakdown.entry(*issue).or_insert(0) += 1;
                    }
                    weighted += f64::from(*severity) * confidence;
                }
                RiskEventKind::PositiveFeedback { .. } => positive_feedback_count += 1,
                RiskEventKind::AnalysisDiagnostic { .. } => analysis_failures += 1,
                RiskEventKind::Submitted { .. } => final_status = Some(SessionStatus::Submitted),
                RiskEventKind::AutoSubmitted { .. } => {
                    final_status = Some(SessionStatus::AutoSubmitted)
                }
            }
        }

        let mut ranked: Vec<(IssueKind, u32)> =
            issue_breakdown.iter().map(|(k, n)| (*k, *n)).collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let findings = ranked
            .into_iter()
            .map(|(kind, count)| format!("{} ({count})", kind.label()))
            .collect();

        let risk_score = ((weighted / 10.0).min(10.0) * 100.0).round() / 100.0;
        let risk_level = RiskLevel::from_score(risk_score);

        Self {
            session_id: session_id.clone(),
            total_alerts,
            issue_breakdown,
            findings,
            signal_alerts,
            risk_score,
            risk_level,
            summary: risk_level.summary().to_string(),
            positive_feedback_count,
            analysis_failures,
            final_status,
        }
    }
}
