//! In-memory risk event store.
//!
//! Keeps every recorded event in insertion order. Data is lost when the
//! store is dropped; queries are linear scans, recording is constant time.

use crate::EventQuery;
use async_trait::async_trait;
use examguard_core::{EventSink, Result, RiskEvent, SessionId};
use std::collections::HashSet;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Log {
    events: Vec<RiskEvent>,
    /// Ids of everything in `events`.
    seen: HashSet<Uuid>,
}

/// Append-only in-memory event log.
pub struct InMemoryEventStore {
    log: RwLock<Log>,
}

impl InMemoryEventStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            log: RwLock::new(Log::default()),
        }
    }

    /// Events matching `query`, oldest first.
    pub async fn query(&self, query: &EventQuery) -> Vec<RiskEvent> {
        let log = self.log.read().await;
        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(usize::MAX);
        log.events
            .iter()
            .filter(|e| query.matches(e))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Full history of one session, oldest first.
    pub async fn events_for_session(&self, session_id: &SessionId) -> Vec<RiskEvent> {
        self.query(&EventQuery::for_session(session_id.clone())).await
    }

    /// Number of stored events.
    pub async fn len(&self) -> usize {
        self.log.read().await.events.len()
    }

    /// Whether the store holds no events.
    pub async fn is_empty(&self) -> bool {
        self.log.read().await.events.is_empty()
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventSink for InMemoryEventStore {
    async fn record(&self, event: &RiskEvent) -> Result<()> {
        let mut log = self.log.write().await;
        // The dispatcher hands each event over once; ignore accidental replays.
        if log.seen.insert(event.id) {
            log.events.push(event.clone());
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
