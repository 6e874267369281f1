//! Process-wide shutdown hook.

use std::sync::Arc;

use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::manager::RemoteCommunicationManager;

/// Dispose `manager` when the process receives Ctrl+C or SIGTERM.
///
/// Disposal is idempotent, so an explicit `dispose` racing with the hook
/// stops the workers only once. Abort the returned handle to uninstall.
pub fn install_shutdown_hook(manager: Arc<RemoteCommunicationManager>) -> JoinHandle<()> {
    tokio::spawn(async move {
        shutdown_signal().await;
        if manager.dispose().await {
            info!("Workers stopped by shutdown hook");
        }
    })
}

/// Wait for Ctrl+C or SIGTERM. Never resolves if no handler can be installed.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}
