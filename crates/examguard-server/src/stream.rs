//! Server-sent event streams for students and proctors.
//!
//! A session stream opens with a `snapshot` event carrying the current
//! session state, then relays that session's later risk events and ends
//! right after the terminal one. The exam stream is the proctor room: every event
//! of every session of the exam, until the client disconnects or the server
//! shuts down. Events dropped because a client fell behind are not
//! replayed; clients reconcile through `/report` on reconnect.

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use examguard_core::{ExamId, RiskEvent, SessionId};
use examguard_engine::Topic;
use futures_util::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::AppState;

/// Interval of SSE keep-alive comments.
const KEEP_ALIVE_SECS: u64 = 15;

type EventStream = BoxStream<'static, Result<Event, axum::Error>>;

/// `GET /api/v1/sessions/:id/stream`
pub async fn session_stream(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let id = SessionId::from(id);
    // Subscribe before reading the snapshot so nothing falls in between.
    let subscription = state.engine.subscribe(Topic::Session(id.clone()));
    let snapshot = match state.engine.get_state(&id).await {
        Ok(s) => s,
        Err(e) => {
            state
                .engine
                .unsubscribe(&subscription.topic, subscription.id);
            return crate::api::engine_error(e);
        }
    };
    debug!(session_id = %id, observer = %subscription.id, "Session stream opened");

    let terminal = snapshot.status.is_terminal();
    let covered = snapshot.last_event_seq;
    let opening: EventStream =
        stream::once(async move { Event::default().event("snapshot").json_data(&snapshot) })
            .boxed();

    let live: EventStream = if terminal {
        stream::empty().boxed()
    } else {
        live_session_events(subscription.receiver, covered)
            .map(|event| to_sse(&event, false))
            .boxed()
    };

    sse(opening.chain(live), state.shutdown.token())
}

/// `GET /api/v1/exams/:exam_id/stream`
pub async fn exam_stream(
    State(state): State<Arc<AppState>>,
    Path(exam_id): Path<String>,
) -> Response {
    let subscription = state
        .engine
        .subscribe(Topic::ExamRoom(ExamId::from(exam_id)));
    debug!(topic = %subscription.topic, observer = %subscription.id, "Proctor stream opened");

    let events = ReceiverStream::new(subscription.receiver).map(|event| to_sse(&event, true));
    sse(events, state.shutdown.token())
}

/// Events after `covered`, ending after the terminal one. Events emitted
/// between subscribing and taking the snapshot arrive on the channel too and
/// are skipped here.
fn live_session_events(
    rx: mpsc::Receiver<Arc<RiskEvent>>,
    covered: u64,
) -> BoxStream<'static, Arc<RiskEvent>> {
    stream::unfold((rx, false), move |(mut rx, done)| async move {
        if done {
            return None;
        }
        loop {
            let event = rx.recv().await?;
            if event.sequence <= covered {
                continue;
            }
            let ended = event.kind.is_terminal();
            return Some((event, (rx, ended)));
        }
    })
    .boxed()
}

fn to_sse(event: &RiskEvent, room: bool) -> Result<Event, axum::Error> {
    // Sequence numbers are per session; the room interleaves sessions.
    let id = if room {
        format!("{}:{}", event.session_id, event.sequence)
    } else {
        event.sequence.to_string()
    };
    Event::default().event(event.kind.name()).id(id).json_data(event)
}

fn sse<S>(events: S, shutdown: CancellationToken) -> Response
where
    S: futures_util::Stream<Item = Result<Event, axum::Error>> + Send + 'static,
{
    let events = events.take_until(shutdown.cancelled_owned());
    Sse::new(events)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(KEEP_ALIVE_SECS)))
        .into_response()
}
