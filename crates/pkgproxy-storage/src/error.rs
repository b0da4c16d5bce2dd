//! Storage error types.

use thiserror::Error;

/// Errors that can occur in storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// IO error (reading or writing blobs, creating directories).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error for the record snapshot.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// No blob stored under the key.
    #[error("Key not found: {0}")]
    NotFound(String),

    /// Key cannot be stored.
    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

impl StorageError {
    /// Returns true if this error means the key is absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
