//! Core domain errors.

use thiserror::Error;

/// Core domain errors for extsys.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Worker keys must name something.
    #[error("Invalid worker key: {0:?}")]
    InvalidKey(String),

    /// A wire message could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
