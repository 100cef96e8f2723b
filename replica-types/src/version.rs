use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque fingerprint of the server's logical schema.
///
/// Only equality matters: any difference between the persisted and the
/// server-reported fingerprint means the local replica must be rebuilt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaVersion(String);

impl SchemaVersion {
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SchemaVersion {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SchemaVersion {
    fn from(s: String) -> Self {
        Self(s)
    }
}
