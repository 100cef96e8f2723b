//! Change sets.
//!
//! A change set is what one refresh cycle of a shape produced: rows that
//! appeared, rows whose content changed, and rows that disappeared. The
//! wire form is `{ inserted, updated: [{old, new}], deleted }`.

use crate::Row;
use serde::{Deserialize, Serialize};

/// A row whose content changed between two refreshes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowUpdate {
    /// The previously observed row.
    pub old: Row,
    /// The freshly fetched row.
    pub new: Row,
}

/// Insert/update/delete classification of one refresh cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    #[serde(default)]
    pub inserted: Vec<Row>,
    #[serde(default)]
    pub updated: Vec<RowUpdate>,
    #[serde(default)]
    pub deleted: Vec<Row>,
}

impl ChangeSet {
    /// Creates an empty change set.
    pub fn new() -> Self {
        Self::default()
    }

    /// A change set that reports every row as inserted.
    ///
    /// Used for the initial sync of a shape, so late observers see the
    /// initial rows as discrete events too.
    pub fn all_inserted(rows: Vec<Row>) -> Self {
        Self {
            inserted: rows,
            ..Self::default()
        }
    }

    /// Whether nothing changed.
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Total number of classified rows.
    pub fn len(&self) -> usize {
        self.inserted.len() + self.updated.len() + self.deleted.len()
    }
}
