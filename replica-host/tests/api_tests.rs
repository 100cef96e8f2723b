use replica_host::{build_router, AppState, ShapeSpec};
use replica_sync::{
    HostStatus, HttpRemote, PerConsumerHost, Reply, SharedHost, StorageChoice, SyncConfig,
    SyncHost,
};
use replica_types::{Capabilities, Topology};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct TestServer {
    base: String,
    remote: MockServer,
    _dir: TempDir,
}

/// A remote source serving one `todo` table.
async fn mock_remote() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/schema/version"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"version": "v1"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/schema/ddl"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "schemas": {"todo": "CREATE TABLE todo (id INTEGER, title TEXT)"}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/shapes/todos"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": 1, "title": "write tests"},
            {"id": 2, "title": "ship"}
        ])))
        .mount(&server)
        .await;
    server
}

/// Spin up the HTTP server on an OS-assigned port.
async fn spawn_test_server() -> TestServer {
    spawn_server_with(Topology::Shared).await
}

async fn spawn_server_with(topology: Topology) -> TestServer {
    let remote = mock_remote().await;
    let dir = TempDir::new().unwrap();
    let config = SyncConfig {
        data_dir: dir.path().to_path_buf(),
        server_url: remote.uri(),
        storage: StorageChoice::Compat,
        refresh_interval_ms: 200,
        ..Default::default()
    };
    let source = Arc::new(HttpRemote::from_config(&config).unwrap());
    let host: Arc<dyn SyncHost> = match topology {
        Topology::Shared => Arc::new(SharedHost::spawn(config, source, Capabilities::full()).unwrap()),
        Topology::PerConsumer => {
            Arc::new(PerConsumerHost::new(config, source, Capabilities::none()).unwrap())
        }
    };
    let state = AppState::new(host).await.unwrap();

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    TestServer {
        base: format!("http://127.0.0.1:{}", port),
        remote,
        _dir: dir,
    }
}

async fn rpc(base: &str, body: Value) -> (u16, Value) {
    let resp = reqwest::Client::new()
        .post(format!("{}/api/v1/rpc", base))
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap())
}

// ── Status ──────────────────────────────────────────────────────

#[tokio::test]
async fn status_endpoint_reports_host_state() {
    let server = spawn_test_server().await;
    let resp = reqwest::get(format!("{}/api/v1/status", server.base))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let status: HostStatus = resp.json().await.unwrap();
    assert!(!status.ready);
    assert_eq!(status.topology, Topology::Shared);
    assert!(status.consumers >= 1);
}

#[tokio::test]
async fn unknown_route_returns_404() {
    let server = spawn_test_server().await;
    let resp = reqwest::get(format!("{}/api/v1/nonexistent", server.base))
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

// ── RPC ─────────────────────────────────────────────────────────

#[tokio::test]
async fn rpc_echoes_client_id() {
    let server = spawn_test_server().await;
    let (status, body) = rpc(&server.base, json!({"type": "PING", "id": 41})).await;
    assert_eq!(status, 200);
    assert_eq!(body["type"], "PING_RESULT");
    assert_eq!(body["id"], 41);
}

#[tokio::test]
async fn rpc_rejects_unknown_type_with_id() {
    let server = spawn_test_server().await;
    let (status, body) = rpc(&server.base, json!({"type": "DROP_ALL", "id": 8})).await;
    assert_eq!(status, 400);
    let reply: Reply = serde_json::from_value(body).unwrap();
    assert!(matches!(reply, Reply::Error { id: Some(8), .. }));
}

#[tokio::test]
async fn rpc_rejects_malformed_body() {
    let server = spawn_test_server().await;
    let resp = reqwest::Client::new()
        .post(format!("{}/api/v1/rpc", server.base))
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["type"], "ERROR");
    assert_eq!(body["id"], Value::Null);
}

#[tokio::test]
async fn rpc_replicates_shape_end_to_end() {
    let server = spawn_test_server().await;

    let (_, init) = rpc(&server.base, json!({"type": "INIT", "id": 1})).await;
    assert_eq!(init["type"], "INIT_RESULT");
    assert_eq!(init["result"]["schemaVersion"], "v1");

    let (_, started) = rpc(
        &server.base,
        json!({
            "type": "SYNC_SHAPE",
            "id": 2,
            "shapeName": "todos",
            "tableName": "todo",
            "shapeUrl": "/shapes/todos"
        }),
    )
    .await;
    assert_eq!(started["type"], "SYNC_SHAPE_RESULT");
    assert_eq!(started["result"]["recordCount"], 2);

    let (_, rows) = rpc(
        &server.base,
        json!({"type": "QUERY", "id": 3, "sql": "SELECT title FROM todo WHERE id = ?1", "params": [2]}),
    )
    .await;
    assert_eq!(rows["result"], json!([{"title": "ship"}]));

    let (_, bad) = rpc(&server.base, json!({"type": "EXEC", "id": 4, "sql": "BOGUS"})).await;
    assert_eq!(bad["type"], "ERROR");
    assert_eq!(bad["id"], 4);

    assert!(!server.remote.received_requests().await.unwrap().is_empty());
}

// ── Events ──────────────────────────────────────────────────────

/// Reads the event stream until `needle` shows up.
async fn read_until(stream: &mut reqwest::Response, needle: &str) -> String {
    let mut received = String::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !received.contains(needle) {
        let chunk = tokio::time::timeout_at(deadline, stream.chunk())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {needle}"))
            .unwrap()
            .expect("event stream ended");
        received.push_str(&String::from_utf8_lossy(&chunk));
    }
    received
}

#[tokio::test]
async fn event_stream_follows_rpc_host_per_consumer() {
    let server = spawn_server_with(Topology::PerConsumer).await;
    let mut stream = reqwest::get(format!("{}/api/v1/events", server.base))
        .await
        .unwrap();
    assert_eq!(stream.status(), 200);

    let (_, status) = rpc(&server.base, json!({"type": "GET_STATUS", "id": 1})).await;
    assert_eq!(status["result"]["topology"], "per_consumer");

    rpc(&server.base, json!({"type": "INIT", "id": 2})).await;
    let received = read_until(&mut stream, "DB_READY").await;
    assert!(received.contains("SCHEMA_RESET"));

    rpc(
        &server.base,
        json!({
            "type": "SYNC_SHAPE",
            "id": 3,
            "shapeName": "todos",
            "tableName": "todo",
            "shapeUrl": "/shapes/todos"
        }),
    )
    .await;
    let received = read_until(&mut stream, "SHAPE_SYNCED").await;
    assert!(received.contains("DATA_CHANGE"));
}

#[tokio::test]
async fn event_stream_delivers_broadcasts() {
    let server = spawn_test_server().await;
    let mut stream = reqwest::get(format!("{}/api/v1/events", server.base))
        .await
        .unwrap();
    assert_eq!(stream.status(), 200);

    rpc(&server.base, json!({"type": "INIT", "id": 1})).await;

    let received = read_until(&mut stream, "DB_READY").await;
    assert!(received.contains("SCHEMA_RESET"));
}

// ── Shape arguments ─────────────────────────────────────────────

#[test]
fn shape_spec_parses_name_table_url() {
    let spec: ShapeSpec = "todos=todo=/shapes/todos?where=a=b".parse().unwrap();
    assert_eq!(spec.name, "todos");
    assert_eq!(spec.table, "todo");
    assert_eq!(spec.url, "/shapes/todos?where=a=b");
}

#[test]
fn shape_spec_rejects_missing_parts() {
    assert!("todos=todo".parse::<ShapeSpec>().is_err());
    assert!("=todo=/x".parse::<ShapeSpec>().is_err());
}
