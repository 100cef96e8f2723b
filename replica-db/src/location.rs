//! Deterministic naming of store artifacts and the exhaustive wipe.

use crate::error::StoreResult;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Default base name of the relational store.
pub const DEFAULT_STORE_NAME: &str = "replica";

/// Base names earlier releases used for the store file, directly inside the
/// data directory. A wipe removes these too.
pub const LEGACY_STORE_PREFIXES: &[&str] = &["replica", "replica-store", "local-replica"];

/// SQLite side files that accompany a database file.
const SIDE_SUFFIXES: &[&str] = &["-wal", "-shm", "-journal"];

/// Extensions that mark a file as a store artifact.
const STORE_EXTENSIONS: &[&str] = &["sqlite3", "sqlite", "db"];

/// Where the relational store lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLocation {
    data_dir: PathBuf,
    name: String,
}

/// What a wipe removed.
#[derive(Debug, Clone, Default)]
pub struct WipeReport {
    /// Every file or directory that was deleted.
    pub removed: Vec<PathBuf>,
}

impl StoreLocation {
    /// A store named `name` under `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            data_dir: data_dir.into(),
            name: name.into(),
        }
    }

    /// The data directory. Also holds the fingerprint slot.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// The store's base name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory that holds the store and its side files.
    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join("store")
    }

    /// Path of the main database file.
    pub fn db_path(&self) -> PathBuf {
        self.store_dir().join(format!("{}.sqlite3", self.name))
    }

    /// Creates the store directory if needed.
    pub fn ensure_dirs(&self) -> StoreResult<()> {
        fs::create_dir_all(self.store_dir())?;
        Ok(())
    }

    /// Removes every store artifact.
    ///
    /// The whole store directory goes, then the data directory is scanned
    /// for stray database files under the current or any legacy base name.
    /// The fingerprint slot and unrelated files are left alone. The store
    /// must be closed before calling this.
    pub fn wipe(&self) -> StoreResult<WipeReport> {
        let mut report = WipeReport::default();

        let store_dir = self.store_dir();
        match fs::remove_dir_all(&store_dir) {
            Ok(()) => report.removed.push(store_dir),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let entries = match fs::read_dir(&self.data_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Data directory {} does not exist, nothing else to wipe", self.data_dir.display());
                return Ok(report);
            }
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !self.is_store_artifact(file_name) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!("Removed stray store artifact {}", path.display());
                    report.removed.push(path);
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("Failed to remove store artifact {}: {}", path.display(), e);
                    return Err(e.into());
                }
            }
        }

        info!(
            "Wiped local store '{}' ({} artifacts removed)",
            self.name,
            report.removed.len()
        );
        Ok(report)
    }

    fn is_store_artifact(&self, file_name: &str) -> bool {
        let mut stem = file_name;
        for suffix in SIDE_SUFFIXES {
            if let Some(s) = stem.strip_suffix(suffix) {
                stem = s;
                break;
            }
        }

        let Some((base, ext)) = stem.rsplit_once('.') else {
            return false;
        };
        if !STORE_EXTENSIONS.contains(&ext) {
            return false;
        }

        base == self.name || LEGACY_STORE_PREFIXES.iter().any(|prefix| base.starts_with(prefix))
    }
}
