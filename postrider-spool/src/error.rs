//! Error types for the spool crate.

use thiserror::Error;

/// Failure of a spool operation.
#[derive(Debug, Error)]
pub enum SpoolError {
    /// File read/write/delete failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata could not be encoded or decoded.
    #[error("metadata encoding error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Specialized `Result` for spool operations.
pub type Result<T> = std::result::Result<T, SpoolError>;

// Storage failures during a delivery stage surface through the
// delivery-target error contract.
impl From<SpoolError> for postrider_common::Error {
    fn from(err: SpoolError) -> Self {
        match err {
            SpoolError::Io(err) => Self::Io(err),
            SpoolError::Serialization(err) => Self::Failure(err.to_string()),
        }
    }
}
