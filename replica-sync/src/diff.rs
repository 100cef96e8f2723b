//! Snapshot diffing.
//!
//! A shape keeps the last rows it saw, keyed by primary key. Every refresh
//! compares the fresh result set against that snapshot:
//!
//! - a key that was not there before is an insert
//! - a key whose row differs in any column is an update
//! - a key that disappeared is a delete
//!
//! Rows without a resolvable primary key cannot be matched across
//! refreshes and are left out entirely. Nothing here touches the store or
//! the network.

use replica_types::{ChangeSet, KeySpec, PrimaryKey, Row, RowUpdate};
use std::collections::{HashMap, HashSet};

/// The last observed rows of a shape, by primary key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    rows: HashMap<PrimaryKey, Row>,
}

impl Snapshot {
    /// An empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a snapshot from a result set. Key-less rows are skipped; on
    /// duplicate keys the first row wins.
    pub fn from_rows(rows: &[Row], key: &KeySpec) -> Self {
        let mut snapshot = Self::new();
        for row in rows {
            if let Some(pk) = key.resolve(row) {
                snapshot.rows.entry(pk).or_insert_with(|| row.clone());
            }
        }
        snapshot
    }

    /// Brings the snapshot up to date with a change set produced against it.
    pub fn apply(&mut self, changes: &ChangeSet, key: &KeySpec) {
        for row in &changes.deleted {
            if let Some(pk) = key.resolve(row) {
                self.rows.remove(&pk);
            }
        }
        for update in &changes.updated {
            if let Some(pk) = key.resolve(&update.new) {
                self.rows.insert(pk, update.new.clone());
            }
        }
        for row in &changes.inserted {
            if let Some(pk) = key.resolve(row) {
                self.rows.insert(pk, row.clone());
            }
        }
    }

    pub fn get(&self, key: &PrimaryKey) -> Option<&Row> {
        self.rows.get(key)
    }

    pub fn contains(&self, key: &PrimaryKey) -> bool {
        self.rows.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The rows, ordered by primary key.
    pub fn rows(&self) -> Vec<Row> {
        let mut keyed: Vec<(&PrimaryKey, &Row)> = self.rows.iter().collect();
        keyed.sort_by(|a, b| a.0.cmp(b.0));
        keyed.into_iter().map(|(_, row)| row.clone()).collect()
    }
}

/// Classifies `current` against `previous`.
///
/// Inserts and updates follow the order of `current`; deletes are ordered
/// by primary key. Repeated keys in `current` count once (first row wins).
pub fn diff(previous: &Snapshot, current: &[Row], key: &KeySpec) -> ChangeSet {
    let mut changes = ChangeSet::new();
    let mut seen: HashSet<PrimaryKey> = HashSet::with_capacity(current.len());

    for row in current {
        let Some(pk) = key.resolve(row) else {
            continue;
        };
        if seen.contains(&pk) {
            continue;
        }
        match previous.get(&pk) {
            None => changes.inserted.push(row.clone()),
            Some(old) if old != row => changes.updated.push(RowUpdate {
                old: old.clone(),
                new: row.clone(),
            }),
            Some(_) => {}
        }
        seen.insert(pk);
    }

    let mut gone: Vec<(&PrimaryKey, &Row)> = previous
        .rows
        .iter()
        .filter(|(pk, _)| !seen.contains(*pk))
        .collect();
    gone.sort_by(|a, b| a.0.cmp(b.0));
    changes.deleted = gone.into_iter().map(|(_, row)| row.clone()).collect();

    changes
}

/// Drops key-less rows and repeated keys, keeping the order of `rows`.
///
/// Returns the tracked rows and how many were dropped.
pub fn tracked_rows(rows: Vec<Row>, key: &KeySpec) -> (Vec<Row>, usize) {
    let total = rows.len();
    let mut seen = HashSet::with_capacity(total);
    let tracked: Vec<Row> = rows
        .into_iter()
        .filter(|row| key.resolve(row).is_some_and(|pk| seen.insert(pk)))
        .collect();
    let dropped = total - tracked.len();
    (tracked, dropped)
}
