//! OS signal handling.
//!
//! # Responsibilities
//! - Wait for SIGTERM/SIGINT and turn them into a shutdown
//! - Reopen the log file on SIGUSR1
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - A handler that cannot be installed is logged, not fatal

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::observability::LogHandle;

/// Resolve on SIGINT (Ctrl+C) or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}

/// Reopen the log file on every SIGUSR1 until `token` is cancelled.
#[cfg(unix)]
pub fn spawn_log_rotation(log: LogHandle, token: CancellationToken) -> JoinHandle<()> {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut sigusr1 = match signal(SignalKind::user_defined1()) {
            Ok(sigusr1) => sigusr1,
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGUSR1 handler");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                received = sigusr1.recv() => {
                    if received.is_none() {
                        break;
                    }
                    tracing::info!("Received SIGUSR1, reopening log file");
                    if let Err(e) = log.reopen() {
                        tracing::error!(error = %e, "Failed to reopen log file");
                    }
                }
            }
        }
    })
}

#[cfg(not(unix))]
pub fn spawn_log_rotation(_log: LogHandle, token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move { token.cancelled().await })
}
