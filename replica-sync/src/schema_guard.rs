//! Schema fingerprint reconciliation.
//!
//! Before the store is opened the server's schema fingerprint is compared
//! with the persisted one. Any difference, including having none persisted,
//! means the local replica was built for another schema: every store
//! artifact is wiped and consumers are told with `SCHEMA_RESET`. The new
//! fingerprint is only persisted once a fresh store has been opened, so a
//! crash in between repeats the reset on the next start.

use crate::broadcast::Broadcaster;
use crate::error::SyncResult;
use crate::protocol::{Broadcast, ResetReason};
use crate::remote::RemoteSource;
use crate::task::run_blocking;
use replica_db::{FingerprintSlot, LocalStore, StoreError, StoreLocation};
use replica_types::{SchemaVersion, StorageMode};
use std::sync::Arc;
use tracing::{info, warn};

/// Result of one reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// Whether the store was wiped.
    pub reset: bool,
    /// The fingerprint persisted before the check.
    pub old_version: Option<SchemaVersion>,
    /// The server's fingerprint, when it could be fetched.
    pub new_version: Option<SchemaVersion>,
}

/// Compares, wipes and commits schema fingerprints.
#[derive(Clone)]
pub struct SchemaGuard {
    remote: Arc<dyn RemoteSource>,
    slot: Arc<dyn FingerprintSlot>,
    location: StoreLocation,
    mode: StorageMode,
}

impl SchemaGuard {
    pub fn new(
        remote: Arc<dyn RemoteSource>,
        slot: Arc<dyn FingerprintSlot>,
        location: StoreLocation,
        mode: StorageMode,
    ) -> Self {
        Self {
            remote,
            slot,
            location,
            mode,
        }
    }

    /// The server's fingerprint, or `None` when it cannot be fetched.
    pub async fn server_version(&self) -> Option<SchemaVersion> {
        match self.remote.schema_version().await {
            Ok(manifest) => Some(manifest.version),
            Err(e) => {
                warn!("Could not fetch server schema version: {}", e);
                None
            }
        }
    }

    /// The persisted fingerprint.
    pub async fn persisted_version(&self) -> SyncResult<Option<SchemaVersion>> {
        let slot = Arc::clone(&self.slot);
        run_blocking(move || slot.load()).await
    }

    /// Checks the server fingerprint against the persisted one and wipes
    /// the store on mismatch.
    ///
    /// An open `store` is taken and closed before wiping. When the server
    /// is unreachable the existing local state is kept and no reset happens.
    pub async fn check_and_reconcile(
        &self,
        store: &mut Option<LocalStore>,
        broadcaster: &mut Broadcaster,
    ) -> SyncResult<Reconciliation> {
        let old_version = self.persisted_version().await?;

        let Some(new_version) = self.server_version().await else {
            return Ok(Reconciliation {
                reset: false,
                old_version,
                new_version: None,
            });
        };

        if old_version.as_ref() == Some(&new_version) {
            return Ok(Reconciliation {
                reset: false,
                old_version,
                new_version: Some(new_version),
            });
        }

        info!(
            "Schema version changed ({} -> {}), resetting local store",
            old_version.as_ref().map_or("none", SchemaVersion::as_str),
            new_version
        );
        self.wipe(store.take()).await?;
        broadcaster.broadcast(Broadcast::SchemaReset {
            reason: ResetReason::VersionMismatch,
            old_version: old_version.clone(),
            new_version: Some(new_version.clone()),
        });

        Ok(Reconciliation {
            reset: true,
            old_version,
            new_version: Some(new_version),
        })
    }

    /// Wipes unconditionally and announces a manual reset.
    pub async fn manual_reset(
        &self,
        store: &mut Option<LocalStore>,
        broadcaster: &mut Broadcaster,
    ) -> SyncResult<()> {
        let old_version = self.persisted_version().await?;
        self.wipe(store.take()).await?;
        info!("Local store reset on request");
        broadcaster.broadcast(Broadcast::SchemaReset {
            reason: ResetReason::ManualReset,
            old_version,
            new_version: None,
        });
        Ok(())
    }

    /// Persists `version` once the fresh store is open.
    pub async fn commit(&self, version: &SchemaVersion) -> SyncResult<()> {
        let slot = Arc::clone(&self.slot);
        let version = version.clone();
        run_blocking(move || slot.save(&version)).await
    }

    async fn wipe(&self, store: Option<LocalStore>) -> SyncResult<()> {
        let slot = Arc::clone(&self.slot);
        let location = self.location.clone();
        let on_disk = self.mode != StorageMode::Memory;
        run_blocking(move || {
            if let Some(store) = store {
                store.close()?;
            }
            if on_disk {
                location.wipe()?;
            }
            slot.clear()?;
            Ok::<_, StoreError>(())
        })
        .await
    }
}
