//! Risk event and evidence storage for ExamGuard.
//!
//! Event stores implement [`examguard_core::EventSink`] so the engine's
//! dispatcher can hand events over, and expose query methods for the report
//! and history endpoints. Evidence stores implement
//! [`examguard_core::EvidenceStore`].

pub mod evidence;
pub mod memory;

pub use evidence::{InMemoryEvidenceStore, StoredEvidence};
pub use memory::InMemoryEventStore;

use chrono::{DateTime, Utc};
use examguard_core::{ExamId, RiskEvent, SessionId};
use serde::Deserialize;

/// Filter for stored events. Every `None` field matches everything.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventQuery {
    /// Only events of this session.
    #[serde(default)]
    pub session_id: Option<SessionId>,
    /// Only events of this exam.
    #[serde(default)]
    pub exam_id: Option<ExamId>,
    /// Only events of this type (`alert`, `positive_feedback`, ...).
    #[serde(default)]
    pub kind: Option<String>,
    /// Only events at or after this instant.
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    /// Maximum number of events returned.
    #[serde(default)]
    pub limit: Option<usize>,
    /// Number of matching events skipped.
    #[serde(default)]
    pub offset: Option<usize>,
}

impl EventQuery {
    /// Query for the history of one session.
    pub fn for_session(session_id: SessionId) -> Self {
        Self {
            session_id: Some(session_id),
            ..Self::default()
        }
    }

    /// Whether `event` passes every filter.
    pub fn matches(&self, event: &RiskEvent) -> bool {
        if let Some(ref id) = self.session_id {
            if event.session_id != *id {
                return false;
            }
        }
        if let Some(ref id) = self.exam_id {
            if event.exam_id != *id {
                return false;
            }
        }
        if let Some(ref kind) = self.kind {
            if event.kind.name() != kind {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.timestamp < since {
                return false;
            }
        }
        true
    }
}
