//! Event fan-out to observers and the persistence collaborator.
//!
//! The engine hands events to [`EventDispatcher::publish`], which never
//! blocks: events go onto an unbounded queue drained by a background task.
//! That task delivers each event to every observer of the session topic and
//! of the owning exam's proctor room, then forwards it to the persistence
//! task. Observers get a bounded buffer; when it is full the event is
//! dropped for that observer only (at-most-once, best-effort). Observers are
//! expected to reconcile via the pull-based report on reconnect.

use dashmap::DashMap;
use examguard_core::{EventSink, ExamId, ObserverId, RiskEvent, SessionId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

// ---------------------------------------------------------------------------
// Topics & subscriptions
// ---------------------------------------------------------------------------

/// What an observer listens to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// All events of one session.
    Session(SessionId),
    /// All events of every session of one exam (the proctor room).
    ExamRoom(ExamId),
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Session(id) => write!(f, "session:{id}"),
            Self::ExamRoom(id) => write!(f, "proctor_{id}"),
        }
    }
}

/// Receiving end of a subscription. Dropping it unsubscribes lazily on the
/// next delivery attempt.
#[derive(Debug)]
pub struct Subscription {
    /// Handle used for [`EventDispatcher::unsubscribe`].
    pub id: ObserverId,
    /// Subscribed topic.
    pub topic: Topic,
    /// Delivered events, in per-session emission order.
    pub receiver: mpsc::Receiver<Arc<RiskEvent>>,
}

struct Observer {
    id: ObserverId,
    tx: mpsc::Sender<Arc<RiskEvent>>,
}

enum Dispatch {
    Event(Arc<RiskEvent>),
    Flush(oneshot::Sender<()>),
}

type ObserverMap = DashMap<Topic, Vec<Observer>>;

// ---------------------------------------------------------------------------
// EventDispatcher
// ---------------------------------------------------------------------------

/// Cloneable handle to the fan-out pipeline.
#[derive(Clone)]
pub struct EventDispatcher {
    observers: Arc<ObserverMap>,
    queue: mpsc::UnboundedSender<Dispatch>,
    buffer: usize,
    dropped: Arc<AtomicU64>,
}

impl EventDispatcher {
    /// Start the fan-out and persistence tasks. Must be called inside a
    /// tokio runtime. The tasks exit once every handle is dropped.
    pub fn new(observer_buffer: usize, sink: Option<Arc<dyn EventSink>>) -> Self {
        let observers: Arc<ObserverMap> = Arc::new(DashMap::new());
        let dropped = Arc::new(AtomicU64::new(0));
        let (queue, rx) = mpsc::unbounded_channel();
        let (persist_tx, persist_rx) = mpsc::unbounded_channel();

        tokio::spawn(fan_out(
            rx,
            Arc::clone(&observers),
            Arc::clone(&dropped),
            persist_tx,
        ));
        tokio::spawn(persist(persist_rx, sink));

        Self {
            observers,
            queue,
            buffer: observer_buffer.max(1),
            dropped,
        }
    }

    /// Queue an event for delivery. Never blocks.
    pub fn publish(&self, event: RiskEvent) {
        if self.queue.send(Dispatch::Event(Arc::new(event))).is_err() {
            warn!("Event dispatcher stopped; event discarded");
        }
    }

    /// Register an observer for `topic`.
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let (tx, receiver) = mpsc::channel(self.buffer);
        let id = ObserverId::new();
        self.observers
            .entry(topic.clone())
            .or_default()
            .push(Observer { id, tx });
        debug!(%topic, observer = %id, "Observer subscribed");
        Subscription {
            id,
            topic,
            receiver,
        }
    }

    /// Remove an observer. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, topic: &Topic, id: ObserverId) -> bool {
        let removed = match self.observers.get_mut(topic) {
            Some(mut list) => {
                let before = list.len();
                list.retain(|o| o.id != id);
                list.len() != before
            }
            None => false,
        };
        self.observers.remove_if(topic, |_, list| list.is_empty());
        removed
    }

    /// Drop every observer of `topic`, ending their streams.
    pub fn close_topic(&self, topic: &Topic) {
        self.observers.remove(topic);
    }

    /// Number of observers currently registered for `topic`.
    pub fn observer_count(&self, topic: &Topic) -> usize {
        self.observers.get(topic).map_or(0, |list| list.len())
    }

    /// Total events dropped because an observer buffer was full.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Wait until every event published before this call has been delivered
    /// to observers and handed to the sink.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.queue.send(Dispatch::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

async fn fan_out(
    mut rx: mpsc::UnboundedReceiver<Dispatch>,
    observers: Arc<ObserverMap>,
    dropped: Arc<AtomicU64>,
    persist_tx: mpsc::UnboundedSender<Dispatch>,
) {
    while let Some(msg) = rx.recv().await {
        if let Dispatch::Event(event) = &msg {
            let topics = [
                Topic::Session(event.session_id.clone()),
                Topic::ExamRoom(event.exam_id.clone()),
            ];
            for topic in &topics {
                deliver(&observers, topic, event, &dropped);
            }
        }
        if persist_tx.send(msg).is_err() {
            error!("Event persistence task stopped");
        }
    }
    debug!("Event fan-out task exiting");
}

fn deliver(observers: &ObserverMap, topic: &Topic, event: &Arc<RiskEvent>, dropped: &AtomicU64) {
    let Some(mut list) = observers.get_mut(topic) else {
        return;
    };
    list.retain(|observer| match observer.tx.try_send(Arc::clone(event)) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            dropped.fetch_add(1, Ordering::Relaxed);
            debug!(%topic, observer = %observer.id, "Observer buffer full; event dropped");
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!(%topic, observer = %observer.id, "Observer disconnected");
            false
        }
    });
    drop(list);
    observers.remove_if(topic, |_, list| list.is_empty());
}

async fn persist(mut rx: mpsc::UnboundedReceiver<Dispatch>, sink: Option<Arc<dyn EventSink>>) {
    while let Some(msg) = rx.recv().await {
        match msg {
            Dispatch::Event(event) => {
                let Some(sink) = sink.as_ref() else {
                    continue;
                };
                // Persistence is fire-and-forget: failures are logged, never retried.
                if let Err(e) = sink.record(&event).await {
                    error!(
                        session_id = %event.session_id,
                        event_id = %event.id,
                        "Failed to persist risk event: {e}"
                    );
                }
            }
            Dispatch::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
