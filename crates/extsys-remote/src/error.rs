//! Error types for the cross-process facade layer.

use extsys_core::CoreError;
use thiserror::Error;

/// Errors that can occur when calling a facade.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The worker cannot be reached: its pipes are closed or broken.
    ///
    /// This is the signal that the worker process is dead.
    #[error("Worker unreachable: {0}")]
    Communication(String),

    /// The worker answered, but the call itself failed inside the worker.
    #[error("Worker reported an error: {0}")]
    Remote(String),

    /// The worker violated the wire protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Encoding a wire message failed.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Timeout waiting for the worker.
    #[error("Timeout waiting for worker")]
    Timeout,
}

impl RpcError {
    /// Whether this error means the worker could not be talked to at all.
    pub fn is_communication(&self) -> bool {
        matches!(self, Self::Communication(_))
    }
}

/// Errors a [`ProjectResolver`](crate::ProjectResolver) can report.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The project path does not exist.
    #[error("Project path not found: {0}")]
    NotFound(String),

    /// The project path is not a directory.
    #[error("Not a directory: {0}")]
    NotADirectory(String),

    /// The task was cancelled before it completed.
    #[error("Resolution cancelled")]
    Cancelled,

    /// Filesystem error while scanning.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
