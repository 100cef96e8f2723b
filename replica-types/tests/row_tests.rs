use replica_types::{into_row, KeySpec, Row};
use serde_json::json;

fn row(value: serde_json::Value) -> Row {
    into_row(value).unwrap()
}

// ── KeySpec ──────────────────────────────────────────────────────

#[test]
fn default_key_is_id() {
    assert_eq!(KeySpec::default().columns(), ["id".to_string()]);
}

#[test]
fn resolves_numeric_and_string_keys() {
    let key = KeySpec::default();
    let numeric = key.resolve(&row(json!({"id": 1, "name": "a"}))).unwrap();
    let text = key.resolve(&row(json!({"id": "1", "name": "a"}))).unwrap();
    assert_eq!(numeric.as_str(), "1");
    assert_eq!(text.as_str(), "\"1\"");
    assert_ne!(numeric, text);
}

#[test]
fn missing_or_null_key_is_unresolvable() {
    let key = KeySpec::default();
    assert!(key.resolve(&row(json!({"name": "a"}))).is_none());
    assert!(key.resolve(&row(json!({"id": null, "name": "a"}))).is_none());
}

#[test]
fn composite_key_needs_every_column() {
    let key = KeySpec::composite(["org", "id"]).unwrap();
    let full = key.resolve(&row(json!({"org": "acme", "id": 7}))).unwrap();
    let other = key.resolve(&row(json!({"org": "acme", "id": 8}))).unwrap();
    assert_ne!(full, other);
    assert!(key.resolve(&row(json!({"org": "acme"}))).is_none());
}

#[test]
fn composite_key_rejects_empty_lists() {
    assert!(KeySpec::composite(Vec::<String>::new()).is_err());
    assert!(KeySpec::composite([""]).is_err());
}

#[test]
fn key_spec_serde_roundtrip() {
    let key = KeySpec::composite(["tenant", "id"]).unwrap();
    let json = serde_json::to_string(&key).unwrap();
    assert_eq!(json, r#"["tenant","id"]"#);
    let parsed: KeySpec = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, key);
    assert!(serde_json::from_str::<KeySpec>("[]").is_err());
}

// ── Rows ─────────────────────────────────────────────────────────

#[test]
fn into_row_rejects_non_objects() {
    assert!(into_row(json!([1, 2])).is_err());
    assert!(into_row(json!("text")).is_err());
    assert_eq!(into_row(json!({"id": 1})).unwrap().len(), 1);
}

#[test]
fn row_equality_ignores_key_order() {
    let a: Row = serde_json::from_str(r#"{"id":1,"name":"a"}"#).unwrap();
    let b: Row = serde_json::from_str(r#"{"name":"a","id":1}"#).unwrap();
    assert_eq!(a, b);
}

// ── Properties ──────────────────────────────────────────────────

mod properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn composite_keys_are_injective(
            a1 in ".{0,6}", b1 in ".{0,6}",
            a2 in ".{0,6}", b2 in ".{0,6}",
        ) {
            let key = KeySpec::composite(["a", "b"]).unwrap();
            let k1 = key.resolve(&row(json!({"a": a1, "b": b1}))).unwrap();
            let k2 = key.resolve(&row(json!({"a": a2, "b": b2}))).unwrap();
            prop_assert_eq!(k1 == k2, a1 == a2 && b1 == b2);
        }

        #[test]
        fn key_ignores_non_key_columns(id in any::<i64>(), x in any::<i32>(), y in any::<i32>()) {
            let key = KeySpec::default();
            prop_assert_eq!(
                key.resolve(&row(json!({"id": id, "x": x}))),
                key.resolve(&row(json!({"id": id, "x": y, "z": true})))
            );
        }
    }
}
