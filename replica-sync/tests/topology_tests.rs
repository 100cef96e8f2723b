use replica_sync::remote::mock::MockRemote;
use replica_sync::{
    select_host, start_host, PerConsumerHost, StorageChoice, SyncConfig, SyncHost, TopologyChoice,
};
use replica_types::{Capabilities, StorageMode, Topology};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn config(dir: &TempDir) -> SyncConfig {
    SyncConfig {
        data_dir: dir.path().to_path_buf(),
        storage: StorageChoice::Compat,
        refresh_interval_ms: 1_000,
        ..Default::default()
    }
}

fn remote() -> Arc<MockRemote> {
    let remote = Arc::new(MockRemote::with_version("v1"));
    remote.set_ddl("todo", "CREATE TABLE todo (id INTEGER)");
    remote.set_rows("/shapes/todos", vec![replica_types::into_row(json!({"id": 1})).unwrap()]);
    remote
}

// ── Selection ───────────────────────────────────────────────────

#[tokio::test]
async fn full_capabilities_select_shared_host() {
    let dir = TempDir::new().unwrap();
    let host = select_host(config(&dir), remote(), Capabilities::full()).unwrap();
    assert_eq!(host.topology(), Topology::Shared);
}

#[tokio::test]
async fn missing_worker_support_selects_per_consumer_host() {
    let dir = TempDir::new().unwrap();
    let caps = Capabilities {
        multi_consumer_worker_supported: false,
        durable_fast_storage_supported: true,
    };
    let host = select_host(config(&dir), remote(), caps).unwrap();
    assert_eq!(host.topology(), Topology::PerConsumer);
}

#[tokio::test]
async fn configured_topology_overrides_capabilities() {
    let dir = TempDir::new().unwrap();
    let config = SyncConfig {
        topology: TopologyChoice::PerConsumer,
        ..config(&dir)
    };
    let host = select_host(config, remote(), Capabilities::full()).unwrap();
    assert_eq!(host.topology(), Topology::PerConsumer);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_host_detects_capabilities() {
    let dir = TempDir::new().unwrap();
    let config = SyncConfig {
        storage: StorageChoice::Auto,
        ..config(&dir)
    };
    let host = start_host(config, remote()).await.unwrap();
    assert_eq!(host.topology(), Topology::Shared);
    assert!(host.capabilities().multi_consumer_worker_supported);

    let consumer = host.connect().await.unwrap();
    let status = consumer.status().await.unwrap();
    assert_eq!(status.storage_mode, StorageMode::Durable);
    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn current_thread_runtime_has_no_worker_support() {
    let dir = TempDir::new().unwrap();
    let caps = replica_sync::capabilities::detect(dir.path().to_path_buf()).await;
    assert!(!caps.multi_consumer_worker_supported);
    assert_eq!(caps.topology(), Topology::PerConsumer);
}

// ── Per-consumer hosts ──────────────────────────────────────────

#[tokio::test]
async fn per_consumer_hosts_are_independent() {
    let dir = TempDir::new().unwrap();
    let remote = remote();
    let host = PerConsumerHost::new(config(&dir), remote.clone(), Capabilities::none()).unwrap();

    let a = host.connect().await.unwrap();
    let b = host.connect().await.unwrap();
    assert_eq!(host.host_count(), 2);

    a.init().await.unwrap();
    a.start_shape("todos", "todo", "/shapes/todos", None).await.unwrap();

    let status_a = a.status().await.unwrap();
    let status_b = b.status().await.unwrap();
    assert_eq!(status_a.topology, Topology::PerConsumer);
    assert_eq!(status_a.active_shapes, vec!["todos".to_string()]);
    assert!(!status_b.ready);
    assert!(status_b.active_shapes.is_empty());
    assert_eq!(status_b.consumers, 1);

    b.start_shape("todos", "todo", "/shapes/todos", None).await.unwrap();
    // No fetch sharing between per-consumer hosts.
    assert_eq!(remote.row_fetches("/shapes/todos"), 2);

    assert!(dir.path().join("consumers/0/store/replica.sqlite3").exists());
    assert!(dir.path().join("consumers/1/store/replica.sqlite3").exists());

    host.shutdown().await.unwrap();
    assert_eq!(host.host_count(), 0);
}

#[tokio::test]
async fn private_host_stops_with_its_consumer() {
    let dir = TempDir::new().unwrap();
    let remote = remote();
    let config = SyncConfig {
        refresh_interval_ms: 20,
        ..config(&dir)
    };
    let host = PerConsumerHost::new(config, remote.clone(), Capabilities::none()).unwrap();

    let consumer = host.connect().await.unwrap();
    consumer.init().await.unwrap();
    consumer
        .start_shape("todos", "todo", "/shapes/todos", None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(remote.row_fetches("/shapes/todos") > 1);
    assert_eq!(host.host_count(), 1);

    drop(consumer);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let after_drop = remote.row_fetches("/shapes/todos");
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(remote.row_fetches("/shapes/todos"), after_drop);
    assert_eq!(host.host_count(), 0);
}
