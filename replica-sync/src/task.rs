use crate::error::{SyncError, SyncResult};
use replica_db::StoreError;

/// Runs a blocking store call on the blocking pool.
pub(crate) async fn run_blocking<T, F>(f: F) -> SyncResult<T>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SyncError::TaskFailed(e.to_string()))?
        .map_err(SyncError::from)
}
