//! The local store adapter.
//!
//! A thin wrapper around one SQLite connection. The sync host is the only
//! writer; it calls into the store from `spawn_blocking` tasks, so the
//! connection sits behind a mutex.

use crate::error::{StoreError, StoreResult};
use crate::location::StoreLocation;
use crate::value::{json_to_sql, sql_to_json};
use replica_types::{ChangeSet, KeySpec, Row, StorageMode};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Internal table caching resolved DDL per replicated table. It lives in the
/// store so a wipe destroys it together with the tables it describes.
const DDL_CACHE_TABLE: &str = "_replica_ddl_cache";

/// Handle to the local relational store.
#[derive(Clone)]
pub struct LocalStore {
    conn: Arc<Mutex<Connection>>,
    mode: StorageMode,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("mode", &self.mode)
            .field("path", &self.path)
            .finish()
    }
}

impl LocalStore {
    /// Opens (or creates) the store at `location` with the given storage mode.
    ///
    /// `StorageMode::Memory` ignores the location.
    pub fn open(location: &StoreLocation, mode: StorageMode) -> StoreResult<Self> {
        if mode == StorageMode::Memory {
            return Self::open_in_memory();
        }

        location.ensure_dirs()?;
        let path = location.db_path();
        let conn = Connection::open(&path)?;
        conn.busy_timeout(Duration::from_secs(5))?;

        let journal = match mode {
            StorageMode::Durable => "WAL",
            _ => "DELETE",
        };
        let applied: String =
            conn.query_row(&format!("PRAGMA journal_mode={journal}"), [], |row| row.get(0))?;
        if !applied.eq_ignore_ascii_case(journal) {
            warn!(
                "Requested journal mode {} for {}, SQLite applied {}",
                journal,
                path.display(),
                applied
            );
        }

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            mode,
            path: Some(path),
        };
        store.init_schema()?;
        info!("Opened local store at {} ({} mode)", location.db_path().display(), mode);
        Ok(store)
    }

    /// Opens an in-memory store (for testing and ephemeral hosts).
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            mode: StorageMode::Memory,
            path: None,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {DDL_CACHE_TABLE} (
                table_name TEXT PRIMARY KEY,
                ddl TEXT NOT NULL,
                cached_at TEXT NOT NULL
            );"
        ))?;
        Ok(())
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// The storage mode the store was opened with.
    pub fn mode(&self) -> StorageMode {
        self.mode
    }

    /// The database file, if file-backed.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    // ── Pass-through SQL ─────────────────────────────────────────

    /// Runs a read query with positional parameters and returns the rows.
    pub fn query(&self, sql: &str, params: &[Value]) -> StoreResult<Vec<Row>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

        let mut rows = stmt.query(params_from_iter(params.iter().map(json_to_sql)))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut record = Row::new();
            for (idx, column) in columns.iter().enumerate() {
                record.insert(column.clone(), sql_to_json(row.get_ref(idx)?));
            }
            out.push(record);
        }
        Ok(out)
    }

    /// Executes one or more statements. Returns the number of rows changed
    /// by the last statement.
    pub fn exec(&self, sql: &str) -> StoreResult<u64> {
        let conn = self.lock()?;
        conn.execute_batch(sql)?;
        Ok(conn.changes())
    }

    // ── Replication writes ───────────────────────────────────────

    /// Replaces the whole content of `table` with `rows` in one transaction.
    pub fn replace_rows(&self, table: &str, rows: &[Row]) -> StoreResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(&format!("DELETE FROM {}", quote_ident(table)), [])?;
        for row in rows {
            insert_row(&tx, table, row)?;
        }
        tx.commit()?;
        debug!("Replaced {} with {} rows", table, rows.len());
        Ok(())
    }

    /// Applies a change set to `table` in one transaction.
    ///
    /// Rows are matched by `key`. Inserts and updates are written as
    /// delete-then-insert so the table needs no unique constraint on the key.
    pub fn apply_changes(&self, table: &str, key: &KeySpec, changes: &ChangeSet) -> StoreResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for row in &changes.deleted {
            delete_by_key(&tx, table, key, row)?;
        }
        for update in &changes.updated {
            delete_by_key(&tx, table, key, &update.old)?;
            insert_row(&tx, table, &update.new)?;
        }
        for row in &changes.inserted {
            delete_by_key(&tx, table, key, row)?;
            insert_row(&tx, table, row)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Number of rows in `table`.
    pub fn count_rows(&self, table: &str) -> StoreResult<u64> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote_ident(table)),
            [],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// Whether `table` exists.
    pub fn table_exists(&self, table: &str) -> StoreResult<bool> {
        let conn = self.lock()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    // ── DDL cache ────────────────────────────────────────────────

    /// DDL previously cached for `table`.
    pub fn cached_ddl(&self, table: &str) -> StoreResult<Option<String>> {
        let conn = self.lock()?;
        let ddl = conn
            .query_row(
                &format!("SELECT ddl FROM {DDL_CACHE_TABLE} WHERE table_name = ?1"),
                params![table],
                |row| row.get(0),
            )
            .optional()?;
        Ok(ddl)
    }

    /// Caches the DDL for `table`.
    pub fn cache_ddl(&self, table: &str, ddl: &str) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {DDL_CACHE_TABLE} (table_name, ddl, cached_at) VALUES (?1, ?2, ?3)"
            ),
            params![table, ddl, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Closes the store. Other clones of the handle keep the connection
    /// alive until they are dropped.
    pub fn close(self) -> StoreResult<()> {
        match Arc::try_unwrap(self.conn) {
            Ok(mutex) => {
                let conn = mutex.into_inner().map_err(|_| StoreError::Poisoned)?;
                conn.close().map_err(|(_, e)| StoreError::Database(e))?;
                debug!("Closed local store");
            }
            Err(_) => {
                warn!("Local store closed while other handles are still alive");
            }
        }
        Ok(())
    }
}

fn insert_row(tx: &Transaction<'_>, table: &str, row: &Row) -> StoreResult<()> {
    if row.is_empty() {
        tx.execute(&format!("INSERT INTO {} DEFAULT VALUES", quote_ident(table)), [])?;
        return Ok(());
    }

    let columns: Vec<String> = row.keys().map(|c| quote_ident(c)).collect();
    let placeholders: Vec<String> = (1..=row.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(table),
        columns.join(", "),
        placeholders.join(", ")
    );
    let values: Vec<SqlValue> = row.values().map(json_to_sql).collect();
    tx.prepare_cached(&sql)?.execute(params_from_iter(values))?;
    Ok(())
}

fn delete_by_key(tx: &Transaction<'_>, table: &str, key: &KeySpec, row: &Row) -> StoreResult<()> {
    let mut clauses = Vec::with_capacity(key.columns().len());
    let mut values = Vec::with_capacity(key.columns().len());
    for (idx, column) in key.columns().iter().enumerate() {
        let value = row.get(column).filter(|v| !v.is_null()).ok_or_else(|| {
            StoreError::InvalidData(format!("row in {table} has no value for key column {column}"))
        })?;
        clauses.push(format!("{} = ?{}", quote_ident(column), idx + 1));
        values.push(json_to_sql(value));
    }
    let sql = format!(
        "DELETE FROM {} WHERE {}",
        quote_ident(table),
        clauses.join(" AND ")
    );
    tx.prepare_cached(&sql)?.execute(params_from_iter(values))?;
    Ok(())
}

/// Quotes an SQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Rewrites `CREATE TABLE` / `CREATE [UNIQUE] INDEX` statements so they are
/// safe to run again on a store that already has them.
pub fn create_if_not_exists(ddl: &str) -> String {
    if ddl.trim().trim_matches(';').trim().is_empty() {
        return String::new();
    }
    ddl.split(';')
        .map(str::trim)
        .filter(|stmt| !stmt.is_empty())
        .map(|stmt| {
            let upper = stmt.to_ascii_uppercase();
            let prefix = ["CREATE TABLE", "CREATE UNIQUE INDEX", "CREATE INDEX"]
                .into_iter()
                .find(|p| upper.starts_with(p));
            match prefix {
                Some(p) if !upper[p.len()..].trim_start().starts_with("IF NOT EXISTS") => {
                    format!("{p} IF NOT EXISTS{}", &stmt[p.len()..])
                }
                _ => stmt.to_string(),
            }
        })
        .collect::<Vec<_>>()
        .join(";\n")
        + ";"
}
