//! Error types for the sync layer.

use replica_db::StoreError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Network error talking to the remote source.
    #[error("network error: {0}")]
    Network(String),

    /// Protocol error (invalid message format or unexpected reply).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Local store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A blocking task panicked or was cancelled.
    #[error("background task failed: {0}")]
    TaskFailed(String),

    /// No reply within the request timeout.
    #[error("operation timed out")]
    Timeout,

    /// Channel closed.
    #[error("channel closed")]
    ChannelClosed,

    /// The local store is not open.
    #[error("store not ready: {0}")]
    NotReady(String),

    /// The host answered with an `ERROR` reply.
    #[error("host error: {0}")]
    Host(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}
