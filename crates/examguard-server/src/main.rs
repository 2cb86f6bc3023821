//! ExamGuard Session Risk Engine Server
//!
//! Accepts webcam and screen captures from exam clients, runs them through
//! a vision model without blocking the capture loop, scores suspicious
//! behaviour per session, and streams alerts to students and proctors over
//! SSE. Sessions are auto-submitted once their score crosses the threshold.

use examguard_core::ExamGuardConfig;
use examguard_server::config::{apply_env_overrides, load_config};
use examguard_server::logging::init_logging;
use examguard_server::shutdown::shutdown_signal;
use examguard_server::{build_app_state, build_router};
use std::path::PathBuf;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration: from CLI arg, env var, or default
    let mut config = load_server_config()?;
    apply_env_overrides(&mut config);
    init_logging(&config.logging)?;

    info!(
        listen_addr = %config.listen_addr,
        gateway = ?config.gateway.provider,
        model = %config.gateway.model,
        auto_submit_threshold = config.risk.auto_submit_threshold,
        "Starting ExamGuard server"
    );

    let listen_addr = config.listen_addr.clone();

    // Build shared application state
    let state = build_app_state(config)?;
    let shutdown = state.shutdown.clone();
    let dispatcher = state.engine.dispatcher().clone();

    let app = build_router(state);

    // Bind and serve
    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    info!(%listen_addr, "ExamGuard server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    // Drain spawned analyses and timers, then the event pipeline.
    if !shutdown.wait_for_tasks().await {
        warn!("Exiting with engine tasks still running");
    }
    dispatcher.flush().await;
    info!("ExamGuard server stopped");

    Ok(())
}

/// Resolve the configuration file path.
///
/// Checks (in order):
/// 1. First CLI argument as config path
/// 2. `EXAMGUARD_CONFIG` environment variable
fn config_path(
    arg: Option<String>,
    env: impl FnOnce() -> Option<String>,
) -> Option<PathBuf> {
    arg.or_else(env).map(PathBuf::from)
}

/// Load server configuration from a YAML file or fall back to defaults.
fn load_server_config() -> anyhow::Result<ExamGuardConfig> {
    match config_path(std::env::args().nth(1), || {
        std::env::var("EXAMGUARD_CONFIG").ok()
    }) {
        Some(path) => load_config(&path),
        None => Ok(ExamGuardConfig::default()),
    }
}
