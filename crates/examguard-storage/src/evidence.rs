//! In-memory evidence store.
//!
//! Keeps alert frames keyed by an opaque reference. Bounded: once
//! `max_items` frames are held, each new frame evicts the oldest.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use examguard_core::{EvidenceStore, ExamGuardError, IssueKind, Result, SessionId};
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;
use uuid::Uuid;

/// One stored frame.
#[derive(Debug, Clone)]
pub struct StoredEvidence {
    pub session_id: SessionId,
    pub issue: IssueKind,
    pub image: Bytes,
    pub captured_at: DateTime<Utc>,
}

impl StoredEvidence {
    /// MIME type sniffed from the image header; JPEG unless it looks like PNG.
    pub fn content_type(&self) -> &'static str {
        if self.image.starts_with(b"\x89PNG") {
            "image/png"
        } else {
            "image/jpeg"
        }
    }
}

#[derive(Default)]
struct Inner {
    items: HashMap<String, StoredEvidence>,
    /// References in insertion order, for eviction.
    order: VecDeque<String>,
}

/// Bounded in-memory frame store.
pub struct InMemoryEvidenceStore {
    inner: RwLock<Inner>,
    max_items: usize,
}

impl InMemoryEvidenceStore {
    /// Create a store holding at most `max_items` frames.
    pub fn new(max_items: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            max_items,
        }
    }

    /// Look up a stored frame.
    pub async fn get(&self, evidence_id: &str) -> Option<StoredEvidence> {
        self.inner.read().await.items.get(evidence_id).cloned()
    }

    /// Number of stored frames.
    pub async fn len(&self) -> usize {
        self.inner.read().await.items.len()
    }

    /// Whether no frame is stored.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.items.is_empty()
    }
}

#[async_trait]
impl EvidenceStore for InMemoryEvidenceStore {
    async fn store(&self, session_id: &SessionId, issue: IssueKind, image: Bytes) -> Result<String> {
        if self.max_items == 0 {
            return Err(ExamGuardError::Storage(
                "evidence store has no capacity".to_string(),
            ));
        }
        let evidence_id = format!("{}_{}", issue.as_str(), Uuid::new_v4().simple());
        let stored = StoredEvidence {
            session_id: session_id.clone(),
            issue,
            image,
            captured_at: Utc::now(),
        };

        let mut inner = self.inner.write().await;
        while inner.order.len() >= self.max_items {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.items.remove(&oldest);
                }
                None => break,
            }
        }
        inner.order.push_back(evidence_id.clone());
        inner.items.insert(evidence_id.clone(), stored);
        Ok(evidence_id)
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
