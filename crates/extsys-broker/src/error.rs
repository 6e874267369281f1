//! Broker error types.

use std::time::Duration;

use extsys_core::WorkerKey;
use extsys_remote::RpcError;
use thiserror::Error;

/// Errors surfaced by facade acquisition.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The launch spec cannot describe a runnable worker.
    #[error("Invalid launch spec: {0}")]
    InvalidLaunchSpec(String),

    /// The worker executable could not be started.
    #[error("Failed to spawn worker '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The worker did not publish its facade in time. It has been killed.
    #[error("Worker for '{key}' did not publish its facade within {timeout:?}")]
    ConnectionTimeout { key: WorkerKey, timeout: Duration },

    /// The worker died or misbehaved before publishing its facade.
    #[error("Worker for '{key}' failed to start: {source}")]
    Handshake {
        key: WorkerKey,
        #[source]
        source: RpcError,
    },

    /// The worker was stopped by `release`/`stop_all` while it was starting.
    #[error("Worker for '{0}' was stopped while starting")]
    ShutdownRace(WorkerKey),

    /// The broker has been disposed.
    #[error("Communication manager has been disposed")]
    Disposed,

    /// A facade call made during acquisition failed.
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// The notification endpoint could not be exported.
///
/// Never fatal: acquisition carries on without progress reporting.
#[derive(Debug, Error)]
#[error("Failed to export notification endpoint: {0}")]
pub struct ExportError(pub String);
