//! Storage capability check.

use crate::error::StoreResult;
use rusqlite::Connection;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use tracing::debug;

const SCRATCH_NAME: &str = ".replica-scratch.sqlite3";

/// Checks whether a write-ahead-logged SQLite database can be created in
/// `dir`.
///
/// The scratch database and its side files are removed before returning,
/// whatever the outcome. Errors creating the directory are returned;
/// anything SQLite rejects counts as "not supported".
pub fn check_durable_storage(dir: &Path) -> StoreResult<bool> {
    fs::create_dir_all(dir)?;
    let path = dir.join(SCRATCH_NAME);
    let supported = try_wal_database(&path);
    remove_scratch_files(&path);
    debug!("Durable storage check in {}: {}", dir.display(), supported);
    Ok(supported)
}

fn try_wal_database(path: &Path) -> bool {
    let Ok(conn) = Connection::open(path) else {
        return false;
    };
    let mode = conn
        .query_row("PRAGMA journal_mode=WAL", [], |row| row.get::<_, String>(0))
        .unwrap_or_default();
    if !mode.eq_ignore_ascii_case("wal") {
        return false;
    }
    let wrote = conn
        .execute_batch("CREATE TABLE scratch (x INTEGER); INSERT INTO scratch VALUES (1);")
        .is_ok();
    let closed = conn.close().is_ok();
    wrote && closed
}

fn remove_scratch_files(path: &Path) {
    let base = path.to_string_lossy().into_owned();
    for candidate in [base.clone(), format!("{base}-wal"), format!("{base}-shm")] {
        match fs::remove_file(&candidate) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => debug!("Could not remove scratch file {}: {}", candidate, e),
        }
    }
}
