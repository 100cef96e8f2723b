use pretty_assertions::assert_eq;
use replica_types::{into_row, Capabilities, ChangeSet, RowUpdate, SchemaVersion, StorageMode, Topology};
use serde_json::json;

// ── ChangeSet ────────────────────────────────────────────────────

#[test]
fn empty_change_set() {
    let changes = ChangeSet::new();
    assert!(changes.is_empty());
    assert_eq!(changes.len(), 0);
}

#[test]
fn all_inserted_reports_every_row() {
    let rows = vec![
        into_row(json!({"id": 1})).unwrap(),
        into_row(json!({"id": 2})).unwrap(),
    ];
    let changes = ChangeSet::all_inserted(rows.clone());
    assert_eq!(changes.inserted, rows);
    assert!(changes.updated.is_empty());
    assert!(changes.deleted.is_empty());
    assert_eq!(changes.len(), 2);
}

#[test]
fn change_set_wire_shape() {
    let changes = ChangeSet {
        inserted: vec![into_row(json!({"id": 2, "name": "c"})).unwrap()],
        updated: vec![RowUpdate {
            old: into_row(json!({"id": 1, "name": "a"})).unwrap(),
            new: into_row(json!({"id": 1, "name": "b"})).unwrap(),
        }],
        deleted: vec![],
    };
    let value = serde_json::to_value(&changes).unwrap();
    assert_eq!(
        value,
        json!({
            "inserted": [{"id": 2, "name": "c"}],
            "updated": [{"old": {"id": 1, "name": "a"}, "new": {"id": 1, "name": "b"}}],
            "deleted": []
        })
    );
}

#[test]
fn change_set_missing_fields_default_to_empty() {
    let changes: ChangeSet = serde_json::from_str(r#"{"deleted":[{"id":3}]}"#).unwrap();
    assert!(changes.inserted.is_empty());
    assert_eq!(changes.deleted.len(), 1);
}

// ── Capabilities ─────────────────────────────────────────────────

#[test]
fn capabilities_drive_topology_and_storage() {
    assert_eq!(Capabilities::full().topology(), Topology::Shared);
    assert_eq!(Capabilities::full().storage_mode(), StorageMode::Durable);
    assert_eq!(Capabilities::none().topology(), Topology::PerConsumer);
    assert_eq!(Capabilities::none().storage_mode(), StorageMode::Compat);
}

#[test]
fn capabilities_serialize_camel_case() {
    let value = serde_json::to_value(Capabilities::full()).unwrap();
    assert_eq!(
        value,
        json!({"multiConsumerWorkerSupported": true, "durableFastStorageSupported": true})
    );
}

#[test]
fn topology_display_matches_serde() {
    assert_eq!(Topology::PerConsumer.to_string(), "per_consumer");
    assert_eq!(
        serde_json::to_string(&Topology::PerConsumer).unwrap(),
        "\"per_consumer\""
    );
}

// ── SchemaVersion ────────────────────────────────────────────────

#[test]
fn schema_version_is_transparent() {
    let v = SchemaVersion::from("v2");
    assert_eq!(v.as_str(), "v2");
    assert_eq!(serde_json::to_string(&v).unwrap(), "\"v2\"");
    assert_eq!(SchemaVersion::new("v2"), v);
}
