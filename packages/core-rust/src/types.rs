use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Generic runtime value carried by correlated units and health results.
///
/// Supports all JSON-compatible types plus binary data. Used for unit
/// headers, properties and bodies, for health-check details, and for the
/// per-check options map handed to [`HealthCheck::call`](crate::HealthCheck::call).
///
/// Serializes to `MsgPack` via `rmp-serde` inside unit snapshots. Maps use
/// `BTreeMap` so that two equal values always encode to identical bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// JSON null.
    Null,
    /// JSON boolean.
    Bool(bool),
    /// JSON integer (signed 64-bit).
    Int(i64),
    /// JSON floating-point (64-bit IEEE 754).
    Float(f64),
    /// JSON string (UTF-8).
    String(String),
    /// Binary data (not directly representable in JSON).
    Bytes(#[serde(with = "serde_bytes")] Vec<u8>),
    /// JSON array (ordered sequence of values).
    Array(Vec<Value>),
    /// JSON object (ordered map of string keys to values).
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Returns the string slice if this is a `Value::String`.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer if this is a `Value::Int`.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the boolean if this is a `Value::Bool`.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Converts into a `serde_json::Value` for human-facing reports.
    ///
    /// Binary data has no JSON form and is rendered as an array of bytes.
    /// Non-finite floats become JSON null.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Bytes(b) => serde_json::Value::from(b.clone()),
            Self::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Self::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map_or_else(|| Self::Float(n.as_f64().unwrap_or(f64::NAN)), Self::Int),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Self::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<u64> for Value {
    /// Saturates at `i64::MAX`.
    fn from(i: u64) -> Self {
        Self::Int(i64::try_from(i).unwrap_or(i64::MAX))
    }
}

impl From<usize> for Value {
    fn from(i: usize) -> Self {
        Self::Int(i64::try_from(i).unwrap_or(i64::MAX))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_conversion_keeps_structure() {
        let json = serde_json::json!({
            "name": "order-42",
            "qty": 3,
            "price": 9.5,
            "tags": ["a", "b"],
            "gift": false,
            "note": null
        });

        let value = Value::from(json.clone());
        let Value::Map(map) = &value else {
            panic!("expected map, got {value:?}");
        };
        assert_eq!(map["name"], Value::String("order-42".to_string()));
        assert_eq!(map["qty"], Value::Int(3));
        assert_eq!(map["price"], Value::Float(9.5));
        assert_eq!(map["note"], Value::Null);

        assert_eq!(value.to_json(), json);
    }

    #[test]
    fn bytes_render_as_json_array() {
        let value = Value::Bytes(vec![1, 2, 3]);
        assert_eq!(value.to_json(), serde_json::json!([1, 2, 3]));
    }

    #[test]
    fn non_finite_float_renders_null() {
        assert_eq!(Value::Float(f64::INFINITY).to_json(), serde_json::Value::Null);
    }

    #[test]
    fn accessors_match_variants() {
        assert_eq!(Value::from("x").as_str(), Some("x"));
        assert_eq!(Value::from(7_i64).as_int(), Some(7));
        assert_eq!(Value::from(true).as_bool(), Some(true));
        assert_eq!(Value::Null.as_str(), None);
    }
}
