//! Session risk engine for ExamGuard.
//!
//! Turns a stream of asynchronous, possibly late or failed frame analyses
//! into a consistent per-session risk state, emits alerts and positive
//! feedback, and auto-submits sessions that cross their threshold.
//!
//! # Architecture
//!
//! - [`state`]: the synchronous per-session state machine
//! - [`engine`]: session registry, analysis dispatch, exam timers
//! - [`dispatcher`]: non-blocking fan-out to observers and persistence
//! - [`report`]: behaviour report over a session's event history
//! - [`shutdown`]: cancellation and drain of background tasks

pub mod dispatcher;
pub mod engine;
pub mod report;
pub mod shutdown;
pub mod state;

pub use dispatcher::{EventDispatcher, Subscription, Topic};
pub use engine::RiskEngine;
pub use report::{BehaviorReport, RiskLevel};
pub use shutdown::{ShutdownCoordinator, TaskGuard};
pub use state::{SessionRiskState, Transition};
