//! Object store error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("{op} on `{key}` timed out after {limit_ms} ms")]
    Timeout {
        op: &'static str,
        key: String,
        limit_ms: u64,
    },

    #[error("S3 error: {0}")]
    S3(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid object key: {0}")]
    InvalidKey(String),

    #[error("object size {size} outside allowed range {min}..={max}")]
    SizeOutOfRange { size: u64, min: u64, max: u64 },

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Result type for object store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
