//! Rows and primary keys.
//!
//! A row is the JSON object form of one record, exactly as the remote
//! source delivered it or as the local store returned it. Rows are compared
//! structurally over every column; there is no version column.

use crate::Error;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// One record: column name to JSON value.
pub type Row = serde_json::Map<String, Value>;

/// The resolved primary key of a row.
///
/// Each key column is encoded as its JSON text, so the number `1` and the
/// string `"1"` are distinct keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrimaryKey(String);

impl PrimaryKey {
    /// Returns the encoded key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Names the column(s) that identify a row across refreshes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct KeySpec {
    columns: Vec<String>,
}

impl KeySpec {
    /// A single-column key.
    pub fn single(column: impl Into<String>) -> Self {
        Self {
            columns: vec![column.into()],
        }
    }

    /// A composite key. Fails when no column is given.
    pub fn composite<I, S>(columns: I) -> crate::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        if columns.is_empty() {
            return Err(Error::InvalidKeySpec("at least one key column is required".into()));
        }
        if columns.iter().any(|c| c.is_empty()) {
            return Err(Error::InvalidKeySpec("key column names must not be empty".into()));
        }
        Ok(Self { columns })
    }

    /// The key columns, in order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Resolves the key of `row`.
    ///
    /// Returns `None` when any key column is missing or null. Such rows
    /// cannot be tracked across refreshes.
    pub fn resolve(&self, row: &Row) -> Option<PrimaryKey> {
        if let [column] = self.columns.as_slice() {
            return encode_component(row.get(column)?).map(PrimaryKey);
        }

        let mut parts = Vec::with_capacity(self.columns.len());
        for column in &self.columns {
            parts.push(encode_component(row.get(column)?)?);
        }
        Some(PrimaryKey(parts.join("\u{1f}")))
    }
}

impl Default for KeySpec {
    fn default() -> Self {
        Self::single("id")
    }
}

impl TryFrom<Vec<String>> for KeySpec {
    type Error = Error;

    fn try_from(columns: Vec<String>) -> Result<Self, Self::Error> {
        Self::composite(columns)
    }
}

impl From<KeySpec> for Vec<String> {
    fn from(spec: KeySpec) -> Self {
        spec.columns
    }
}

fn encode_component(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Converts a JSON value into a [`Row`]; anything but an object is rejected.
pub fn into_row(value: Value) -> crate::Result<Row> {
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(Error::NotAnObject),
    }
}
