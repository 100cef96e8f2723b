//! Runtime capability detection.
//!
//! Detected once when a host starts. Every check is best effort: anything
//! that fails counts as unsupported.

use replica_db::check_durable_storage;
use replica_types::Capabilities;
use std::path::{Path, PathBuf};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, info, warn};

/// Whether a shared host can serve many consumers concurrently, i.e. the
/// current runtime schedules tasks on several worker threads.
pub fn detect_multi_consumer() -> bool {
    match Handle::try_current() {
        Ok(handle) => handle.runtime_flavor() == RuntimeFlavor::MultiThread,
        Err(_) => false,
    }
}

/// Whether write-ahead-logged file storage works under `data_dir`.
pub fn detect_durable_storage(data_dir: &Path) -> bool {
    match check_durable_storage(data_dir) {
        Ok(supported) => supported,
        Err(e) => {
            debug!("Durable storage check failed: {}", e);
            false
        }
    }
}

/// Detects everything.
pub async fn detect(data_dir: PathBuf) -> Capabilities {
    let multi_consumer_worker_supported = detect_multi_consumer();
    let durable_fast_storage_supported =
        match tokio::task::spawn_blocking(move || detect_durable_storage(&data_dir)).await {
            Ok(supported) => supported,
            Err(e) => {
                warn!("Durable storage check task failed: {}", e);
                false
            }
        };

    let capabilities = Capabilities {
        multi_consumer_worker_supported,
        durable_fast_storage_supported,
    };
    info!(
        "Detected capabilities: multi-consumer={}, durable storage={}",
        capabilities.multi_consumer_worker_supported,
        capabilities.durable_fast_storage_supported
    );
    capabilities
}
