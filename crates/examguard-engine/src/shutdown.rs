//! Shutdown coordination for engine background work.
//!
//! A single [`CancellationToken`] broadcasts shutdown to every outstanding
//! analysis and exam timer. Each spawned task holds a [`TaskGuard`] so the
//! server can wait for them to drain before exiting.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Shutdown coordinator
// ---------------------------------------------------------------------------

/// Live-task counter shared by the coordinator and its guards.
#[derive(Default)]
struct TaskCounter {
    live: AtomicUsize,
    drained: Notify,
}

/// Coordinates graceful shutdown of engine tasks.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    /// Root token; per-session tokens are children of it.
    token: CancellationToken,
    tasks: Arc<TaskCounter>,
    /// Upper bound on the drain after shutdown is requested.
    drain_timeout: Duration,
}

impl ShutdownCoordinator {
    /// Create a coordinator that waits at most `timeout_seconds` for tasks.
    pub fn new(timeout_seconds: u64) -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: Arc::new(TaskCounter::default()),
            drain_timeout: Duration::from_secs(timeout_seconds),
        }
    }

    /// Clone of the root cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Returns `true` once shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Register a spawned analysis or timer. The count drops with the guard.
    pub fn track_task(&self) -> TaskGuard {
        self.tasks.live.fetch_add(1, Ordering::SeqCst);
        TaskGuard {
            tasks: Arc::clone(&self.tasks),
        }
    }

    /// Number of tracked tasks still running.
    pub fn in_flight_count(&self) -> usize {
        self.tasks.live.load(Ordering::SeqCst)
    }

    /// Request shutdown.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Wait until every tracked task has finished or the drain timeout
    /// expires. Returns `false` on timeout.
    pub async fn wait_for_tasks(&self) -> bool {
        let drained = async {
            loop {
                // Register interest before checking, so a guard dropped in
                // between still wakes us.
                let notified = self.tasks.drained.notified();
                if self.in_flight_count() == 0 {
                    return;
                }
                notified.await;
            }
        };

        match tokio::time::timeout(self.drain_timeout, drained).await {
            Ok(()) => {
                info!("Engine tasks drained");
                true
            }
            Err(_) => {
                warn!(
                    remaining_tasks = self.in_flight_count(),
                    timeout_ms = self.drain_timeout.as_millis() as u64,
                    "Engine tasks still running after drain timeout"
                );
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Task guard
// ---------------------------------------------------------------------------

/// Keeps one task counted until dropped.
pub struct TaskGuard {
    tasks: Arc<TaskCounter>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if self.tasks.live.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.tasks.drained.notify_waiters();
        }
    }
}
