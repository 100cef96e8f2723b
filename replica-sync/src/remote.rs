//! The remote source: schema fingerprint, table DDL and shape rows.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use replica_types::{into_row, Row, SchemaVersion};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// What the server reports about its schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaManifest {
    pub version: SchemaVersion,
    #[serde(default)]
    pub tables: Vec<String>,
}

/// Read-only access to the server side of the replication.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Fetches the current schema fingerprint.
    async fn schema_version(&self) -> SyncResult<SchemaManifest>;

    /// Fetches `CREATE` statements for the given tables. Tables the server
    /// does not know are missing from the result.
    async fn table_ddl(&self, tables: &[String]) -> SyncResult<HashMap<String, String>>;

    /// Fetches the full current result set of a shape.
    async fn fetch_rows(&self, shape_url: &str) -> SyncResult<Vec<Row>>;
}

#[derive(Debug, Deserialize)]
struct DdlResponse {
    #[serde(default)]
    schemas: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RowsBody {
    Bare(Vec<Value>),
    Wrapped { rows: Vec<Value> },
}

/// [`RemoteSource`] over HTTP.
///
/// - `GET {base}/api/schema/version` returns `{version, tables}`
/// - `GET {base}/api/schema/ddl?tables=a,b` returns `{schemas: {table: ddl}}`
/// - `GET {shape_url}` returns a JSON array of rows or `{rows: [...]}`
///
/// Relative shape URLs are resolved against the base URL.
#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: Client,
    base_url: String,
}

impl HttpRemote {
    /// Creates a client for the server at `base_url`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Network(format!("failed to build HTTP client: {e}")))?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { client, base_url })
    }

    /// Creates a client from the host configuration.
    pub fn from_config(config: &SyncConfig) -> SyncResult<Self> {
        Self::new(config.server_url.clone(), config.http_timeout())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URL for a shape endpoint.
    pub fn resolve(&self, shape_url: &str) -> String {
        if shape_url.starts_with("http://") || shape_url.starts_with("https://") {
            shape_url.to_string()
        } else if shape_url.starts_with('/') {
            format!("{}{}", self.base_url, shape_url)
        } else {
            format!("{}/{}", self.base_url, shape_url)
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        what: &str,
    ) -> SyncResult<T> {
        let response = request
            .send()
            .await
            .map_err(|e| SyncError::Network(format!("{what} request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::Network(format!(
                "{what} request failed with {status}: {body}"
            )));
        }

        response
            .json()
            .await
            .map_err(|e| SyncError::Network(format!("failed to parse {what} response: {e}")))
    }
}

#[async_trait]
impl RemoteSource for HttpRemote {
    async fn schema_version(&self) -> SyncResult<SchemaManifest> {
        let url = format!("{}/api/schema/version", self.base_url);
        self.get_json(self.client.get(url), "schema version").await
    }

    async fn table_ddl(&self, tables: &[String]) -> SyncResult<HashMap<String, String>> {
        let url = format!("{}/api/schema/ddl", self.base_url);
        let joined = tables.join(",");
        let response: DdlResponse = self
            .get_json(self.client.get(url).query(&[("tables", joined.as_str())]), "DDL")
            .await?;
        debug!("Fetched DDL for {} of {} tables", response.schemas.len(), tables.len());
        Ok(response.schemas)
    }

    async fn fetch_rows(&self, shape_url: &str) -> SyncResult<Vec<Row>> {
        let url = self.resolve(shape_url);
        let body: RowsBody = self.get_json(self.client.get(&url), "shape").await?;
        let values = match body {
            RowsBody::Bare(rows) | RowsBody::Wrapped { rows } => rows,
        };
        values
            .into_iter()
            .map(|value| {
                into_row(value)
                    .map_err(|e| SyncError::Protocol(format!("bad row from {url}: {e}")))
            })
            .collect()
    }
}

/// In-memory remote source for tests.
#[cfg(any(test, feature = "test-support"))]
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex, MutexGuard, PoisonError};

    fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A scripted remote source.
    ///
    /// Rows, DDL and the schema version can be changed at any time; the
    /// next fetch sees the new values. Fetches are counted.
    #[derive(Debug, Default)]
    pub struct MockRemote {
        manifest: Mutex<Option<SchemaManifest>>,
        ddl: Mutex<HashMap<String, String>>,
        shapes: Mutex<HashMap<String, Result<Vec<Row>, String>>>,
        delay: Mutex<Option<Duration>>,
        version_fetches: AtomicUsize,
        ddl_fetches: AtomicUsize,
        row_fetches: Mutex<HashMap<String, usize>>,
    }

    impl MockRemote {
        /// A remote that reports no schema version (every version fetch
        /// fails) and serves no shapes.
        pub fn new() -> Self {
            Self::default()
        }

        /// A remote reporting schema `version`.
        pub fn with_version(version: impl Into<SchemaVersion>) -> Self {
            let remote = Self::new();
            remote.set_version(version);
            remote
        }

        pub fn set_version(&self, version: impl Into<SchemaVersion>) {
            *lock(&self.manifest) = Some(SchemaManifest {
                version: version.into(),
                tables: Vec::new(),
            });
        }

        /// Makes version fetches fail, as if the server were unreachable.
        pub fn fail_version(&self) {
            *lock(&self.manifest) = None;
        }

        pub fn set_ddl(&self, table: &str, ddl: &str) {
            lock(&self.ddl).insert(table.to_string(), ddl.to_string());
        }

        pub fn set_rows(&self, shape_url: &str, rows: Vec<Row>) {
            lock(&self.shapes).insert(shape_url.to_string(), Ok(rows));
        }

        /// Makes fetches of `shape_url` fail.
        pub fn fail_rows(&self, shape_url: &str) {
            lock(&self.shapes).insert(shape_url.to_string(), Err("shape unavailable".into()));
        }

        /// Delays every call by `delay`.
        pub fn set_delay(&self, delay: Duration) {
            *lock(&self.delay) = Some(delay);
        }

        pub fn version_fetches(&self) -> usize {
            self.version_fetches.load(Ordering::SeqCst)
        }

        pub fn ddl_fetches(&self) -> usize {
            self.ddl_fetches.load(Ordering::SeqCst)
        }

        pub fn row_fetches(&self, shape_url: &str) -> usize {
            lock(&self.row_fetches).get(shape_url).copied().unwrap_or(0)
        }

        async fn pause(&self) {
            let delay = *lock(&self.delay);
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
        }
    }

    #[async_trait]
    impl RemoteSource for MockRemote {
        async fn schema_version(&self) -> SyncResult<SchemaManifest> {
            self.pause().await;
            self.version_fetches.fetch_add(1, Ordering::SeqCst);
            lock(&self.manifest)
                .clone()
                .ok_or_else(|| SyncError::Network("schema version unavailable".into()))
        }

        async fn table_ddl(&self, tables: &[String]) -> SyncResult<HashMap<String, String>> {
            self.pause().await;
            self.ddl_fetches.fetch_add(1, Ordering::SeqCst);
            let ddl = lock(&self.ddl);
            Ok(tables
                .iter()
                .filter_map(|t| ddl.get(t).map(|d| (t.clone(), d.clone())))
                .collect())
        }

        async fn fetch_rows(&self, shape_url: &str) -> SyncResult<Vec<Row>> {
            self.pause().await;
            *lock(&self.row_fetches).entry(shape_url.to_string()).or_default() += 1;
            match lock(&self.shapes).get(shape_url) {
                Some(Ok(rows)) => Ok(rows.clone()),
                Some(Err(e)) => Err(SyncError::Network(e.clone())),
                None => Err(SyncError::Network(format!("no shape at {shape_url}"))),
            }
        }
    }
}
