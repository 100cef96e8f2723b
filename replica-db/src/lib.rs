//! SQLite local store for Replica.
//!
//! The local store is an embedded SQLite database used as an opaque
//! relational engine: the sync host executes SQL against it and writes the
//! rows pulled from the remote source into it. Consumers never touch it
//! directly.
//!
//! # Layout
//!
//! Everything lives under one data directory:
//!
//! - `store/<name>.sqlite3` (+ `-wal`, `-shm`, `-journal`): the relational store
//! - `schema_version.json`: the schema fingerprint slot, which must survive a
//!   wipe of the store
//!
//! [`StoreLocation::wipe`] removes every store artifact, including files left
//! behind by older naming schemes.

mod durable;
mod error;
mod fingerprint;
mod location;
mod store;
mod value;

pub use durable::check_durable_storage;
pub use error::{StoreError, StoreResult};
pub use fingerprint::{FileFingerprintSlot, FingerprintSlot, MemoryFingerprintSlot, FINGERPRINT_FILE};
pub use location::{StoreLocation, WipeReport, DEFAULT_STORE_NAME, LEGACY_STORE_PREFIXES};
pub use store::{create_if_not_exists, quote_ident, LocalStore};
pub use value::{json_to_sql, sql_to_json};
