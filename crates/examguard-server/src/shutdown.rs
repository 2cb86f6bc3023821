//! OS signal handling for graceful shutdown.
//!
//! [`shutdown_signal`] resolves on SIGTERM, SIGINT or an external cancel of
//! the coordinator token, and then cancels the token so the HTTP server,
//! SSE streams and engine tasks all wind down.

use examguard_engine::ShutdownCoordinator;
use tracing::{info, warn};

/// Resolve when a shutdown signal is received, then trigger the coordinator.
///
/// On Unix this listens for both SIGTERM and SIGINT; elsewhere for Ctrl-C.
pub async fn shutdown_signal(coordinator: ShutdownCoordinator) {
    let token = coordinator.token();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Shutdown signal received (SIGTERM)"),
                    _ = sigint.recv() => info!("Shutdown signal received (SIGINT)"),
                    _ = token.cancelled() => info!("Shutdown signal received (token cancelled)"),
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!("Failed to install signal handlers: {e}; waiting for cancellation only");
                token.cancelled().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Shutdown signal received (Ctrl-C)"),
            _ = token.cancelled() => info!("Shutdown signal received (token cancelled)"),
        }
    }

    coordinator.trigger();
}
