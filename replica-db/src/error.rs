//! Error types for the local store.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error (file system).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection mutex was poisoned by a panicking writer.
    #[error("store connection poisoned")]
    Poisoned,

    /// A parameter or row value could not be mapped to SQLite.
    #[error("invalid data: {0}")]
    InvalidData(String),
}
