//! Correlated units and their snapshot codec.
//!
//! A [`CorrelatedUnit`] is the in-flight message envelope held by an
//! aggregation store while related messages are being combined. Stores never
//! keep the struct itself: they keep a [`UnitSnapshot`], the opaque
//! `MsgPack` encoding produced by [`CorrelatedUnit::to_snapshot`].

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::types::Value;

/// Header set on a unit resubmitted by the recovery worker.
pub const REDELIVERED_HEADER: &str = "CamberRedelivered";
/// Header carrying the current recovery attempt (1-based).
pub const REDELIVERY_COUNTER_HEADER: &str = "CamberRedeliveryCounter";
/// Header carrying the configured maximum number of recovery attempts.
pub const REDELIVERY_MAX_COUNTER_HEADER: &str = "CamberRedeliveryMaxCounter";

/// Errors raised while encoding or decoding a unit snapshot.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("failed to encode unit snapshot: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("failed to decode unit snapshot: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Wall-clock time in milliseconds since the Unix epoch.
///
/// Millisecond timestamps fit comfortably in i64 until the year 292 million.
#[allow(clippy::cast_possible_truncation)]
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// The exchange equivalent: an envelope grouped with others by correlation key.
///
/// `unit_id` is generated once at construction and survives every snapshot
/// round-trip, which is what lets the recovery namespace key units by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelatedUnit {
    /// Unique, internally generated identifier (UUID v4).
    pub unit_id: String,
    /// Application-level key grouping related units.
    pub correlation_key: String,
    /// Message headers.
    pub headers: BTreeMap<String, Value>,
    /// Exchange-scoped properties.
    pub properties: BTreeMap<String, Value>,
    /// Message body.
    pub body: Value,
    /// Wall-clock time (millis since epoch) when the unit was created.
    pub created_millis: i64,
}

impl CorrelatedUnit {
    /// Starts building a unit for the given correlation key.
    #[must_use]
    pub fn builder(correlation_key: impl Into<String>) -> CorrelatedUnitBuilder {
        CorrelatedUnitBuilder {
            unit_id: None,
            correlation_key: correlation_key.into(),
            headers: BTreeMap::new(),
            properties: BTreeMap::new(),
            body: Value::Null,
            created_millis: None,
        }
    }

    /// Returns a header value by name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&Value> {
        self.headers.get(name)
    }

    /// Sets a header, returning the previous value.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.headers.insert(name.into(), value.into())
    }

    /// Encodes this unit into its stored form.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Encode`] if serialization fails.
    pub fn to_snapshot(&self) -> Result<UnitSnapshot, SnapshotError> {
        Ok(UnitSnapshot(rmp_serde::to_vec_named(self)?))
    }

    /// Decodes a unit from its stored form.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Decode`] if the bytes are not a valid snapshot.
    pub fn from_snapshot(snapshot: &UnitSnapshot) -> Result<Self, SnapshotError> {
        Ok(rmp_serde::from_slice(&snapshot.0)?)
    }

    /// Drops header values that carry raw binary payloads.
    ///
    /// Used by stores configured to refuse serialized (opaque binary) headers.
    pub fn strip_binary_headers(&mut self) {
        self.headers.retain(|_, v| !matches!(v, Value::Bytes(_)));
    }
}

/// Builder for [`CorrelatedUnit`].
#[derive(Debug)]
pub struct CorrelatedUnitBuilder {
    unit_id: Option<String>,
    correlation_key: String,
    headers: BTreeMap<String, Value>,
    properties: BTreeMap<String, Value>,
    body: Value,
    created_millis: Option<i64>,
}

impl CorrelatedUnitBuilder {
    /// Uses a fixed unit id instead of generating one.
    #[must_use]
    pub fn unit_id(mut self, unit_id: impl Into<String>) -> Self {
        self.unit_id = Some(unit_id.into());
        self
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<Value>) -> Self {
        self.body = body.into();
        self
    }

    #[must_use]
    pub fn created_millis(mut self, millis: i64) -> Self {
        self.created_millis = Some(millis);
        self
    }

    #[must_use]
    pub fn build(self) -> CorrelatedUnit {
        CorrelatedUnit {
            unit_id: self
                .unit_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            correlation_key: self.correlation_key,
            headers: self.headers,
            properties: self.properties,
            body: self.body,
            created_millis: self.created_millis.unwrap_or_else(now_millis),
        }
    }
}

/// Opaque stored form of a [`CorrelatedUnit`].
///
/// Encoding is deterministic, so two snapshots compare equal exactly when
/// the units they encode are equal. Compare-and-swap in the storage layer
/// relies on this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitSnapshot(pub Vec<u8>);

impl UnitSnapshot {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for UnitSnapshot {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn sample() -> CorrelatedUnit {
        CorrelatedUnit::builder("order-42")
            .header("source", "web")
            .header("attempt", 1_i64)
            .header("blob", vec![0xde_u8, 0xad])
            .property("tenant", "acme")
            .body(serde_json::json!({"lines": [1, 2, 3], "total": 12.5}))
            .build()
    }

    #[test]
    fn builder_generates_unique_ids() {
        let a = CorrelatedUnit::builder("k").build();
        let b = CorrelatedUnit::builder("k").build();
        assert_ne!(a.unit_id, b.unit_id);
        assert_eq!(a.correlation_key, "k");
        assert!(a.created_millis > 0);
    }

    #[test]
    fn snapshot_preserves_headers_and_body() {
        let unit = sample();
        let snapshot = unit.to_snapshot().unwrap();
        let decoded = CorrelatedUnit::from_snapshot(&snapshot).unwrap();
        assert_eq!(decoded, unit);
        assert_eq!(decoded.header("blob"), Some(&Value::Bytes(vec![0xde, 0xad])));
    }

    #[test]
    fn equal_units_encode_identically() {
        let unit = sample();
        let copy = unit.clone();
        assert_eq!(unit.to_snapshot().unwrap(), copy.to_snapshot().unwrap());
    }

    #[test]
    fn changed_header_changes_snapshot() {
        let unit = sample();
        let mut changed = unit.clone();
        changed.set_header("attempt", 2_i64);
        assert_ne!(unit.to_snapshot().unwrap(), changed.to_snapshot().unwrap());
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        let result = CorrelatedUnit::from_snapshot(&UnitSnapshot(vec![0xc1, 0x00]));
        assert!(matches!(result, Err(SnapshotError::Decode(_))));
    }

    #[test]
    fn strip_binary_headers_keeps_text() {
        let mut unit = sample();
        unit.strip_binary_headers();
        assert!(unit.header("blob").is_none());
        assert_eq!(unit.header("source"), Some(&Value::from("web")));
    }

    proptest! {
        #[test]
        fn snapshot_is_stable_for_arbitrary_headers(
            key in "[a-z0-9-]{1,16}",
            headers in proptest::collection::btree_map("[A-Za-z]{1,8}", any::<i64>(), 0..8),
            body in ".{0,64}",
        ) {
            let mut builder = CorrelatedUnit::builder(key).body(body);
            for (name, value) in headers {
                builder = builder.header(name, value);
            }
            let unit = builder.build();
            let decoded = CorrelatedUnit::from_snapshot(&unit.to_snapshot().unwrap()).unwrap();
            prop_assert_eq!(decoded, unit);
        }
    }
}
