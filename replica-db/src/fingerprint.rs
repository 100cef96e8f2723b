//! Durable slot for the schema fingerprint.
//!
//! The fingerprint is read before the store is opened and must outlive a
//! store wipe, so it is kept outside the relational store in a small JSON
//! file next to the store directory.

use crate::error::{StoreError, StoreResult};
use chrono::{DateTime, Utc};
use replica_types::SchemaVersion;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// File name of the fingerprint slot inside the data directory.
pub const FINGERPRINT_FILE: &str = "schema_version.json";

/// A key/value slot holding the persisted schema fingerprint.
pub trait FingerprintSlot: Send + Sync {
    /// Reads the persisted fingerprint, if any.
    fn load(&self) -> StoreResult<Option<SchemaVersion>>;

    /// Persists `version`, replacing any previous value.
    fn save(&self, version: &SchemaVersion) -> StoreResult<()>;

    /// Forgets the persisted fingerprint.
    fn clear(&self) -> StoreResult<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct FingerprintRecord {
    version: SchemaVersion,
    updated_at: DateTime<Utc>,
}

/// Fingerprint slot backed by a JSON file.
#[derive(Debug, Clone)]
pub struct FileFingerprintSlot {
    path: PathBuf,
}

impl FileFingerprintSlot {
    /// Slot at `<data_dir>/schema_version.json`.
    pub fn in_dir(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(FINGERPRINT_FILE),
        }
    }

    /// Slot at an explicit path.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The slot's file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FingerprintSlot for FileFingerprintSlot {
    fn load(&self) -> StoreResult<Option<SchemaVersion>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str::<FingerprintRecord>(&raw) {
            Ok(record) => Ok(Some(record.version)),
            Err(e) => {
                // An unreadable slot is treated as missing, which forces a reset.
                warn!("Ignoring corrupt fingerprint slot {}: {}", self.path.display(), e);
                Ok(None)
            }
        }
    }

    fn save(&self, version: &SchemaVersion) -> StoreResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let record = FingerprintRecord {
            version: version.clone(),
            updated_at: Utc::now(),
        };
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&record)?)?;
        fs::rename(&tmp, &self.path)?;
        debug!("Persisted schema fingerprint {}", version);
        Ok(())
    }

    fn clear(&self) -> StoreResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory fingerprint slot (for testing).
#[derive(Debug, Default)]
pub struct MemoryFingerprintSlot {
    value: Mutex<Option<SchemaVersion>>,
}

impl MemoryFingerprintSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// A slot that already holds `version`.
    pub fn with_version(version: impl Into<SchemaVersion>) -> Self {
        Self {
            value: Mutex::new(Some(version.into())),
        }
    }
}

impl FingerprintSlot for MemoryFingerprintSlot {
    fn load(&self) -> StoreResult<Option<SchemaVersion>> {
        Ok(self.value.lock().map_err(|_| StoreError::Poisoned)?.clone())
    }

    fn save(&self, version: &SchemaVersion) -> StoreResult<()> {
        *self.value.lock().map_err(|_| StoreError::Poisoned)? = Some(version.clone());
        Ok(())
    }

    fn clear(&self) -> StoreResult<()> {
        *self.value.lock().map_err(|_| StoreError::Poisoned)? = None;
        Ok(())
    }
}
