//! JSON <-> SQLite value mapping.
//!
//! | JSON            | SQLite                  |
//! |-----------------|-------------------------|
//! | null            | NULL                    |
//! | bool            | INTEGER 0/1             |
//! | integer         | INTEGER                 |
//! | float           | REAL                    |
//! | string          | TEXT                    |
//! | array / object  | TEXT (JSON encoded)     |
//!
//! BLOBs read back as arrays of byte values.

use rusqlite::types::{Value as SqlValue, ValueRef};
use serde_json::{Number, Value};

/// Maps a JSON value to an owned SQLite value.
pub fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else {
                // u64 above i64::MAX and all floats
                SqlValue::Real(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => SqlValue::Text(s.clone()),
        nested @ (Value::Array(_) | Value::Object(_)) => SqlValue::Text(nested.to_string()),
    }
}

/// Maps a borrowed SQLite value to JSON.
pub fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Number(i.into()),
        ValueRef::Real(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
    }
}
