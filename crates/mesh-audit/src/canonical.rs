//! Canonical serialization (`mesh-canon/v1`) for hashed and signed bytes.
//!
//! Rules:
//!
//! 1. The value is converted to a `serde_json::Value`.
//! 2. Object keys are sorted lexicographically at every depth.
//! 3. Output is compact (no whitespace).
//! 4. Money is integer cents and latency integer milliseconds, so the only
//!    floats are scores, written in serde_json's shortest round-trip form.
//! 5. Timestamps are RFC 3339 UTC truncated to milliseconds (see [`now`]).
//!
//! [`CanonicalBytes`] has a private field; hashing code takes
//! `&CanonicalBytes`, so bytes that skipped these rules cannot be hashed.

use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

/// Identifier of the canonicalization rules above.
pub const CANON_VERSION: &str = "mesh-canon/v1";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalBytes(Vec<u8>);

impl CanonicalBytes {
    pub fn new(obj: &impl Serialize) -> Result<Self, serde_json::Error> {
        Self::from_value(serde_json::to_value(obj)?)
    }

    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let sorted = sort_keys(value);
        Ok(Self(serde_json::to_vec(&sorted)?))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (k, v) in entries {
                sorted.insert(k, sort_keys(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

/// Current time at the precision canonical timestamps carry.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_matter() {
        let a = CanonicalBytes::new(&json!({"b": 1, "a": {"y": [1, {"d": 2, "c": 3}], "x": null}}))
            .unwrap();
        let b = CanonicalBytes::new(&json!({"a": {"x": null, "y": [1, {"c": 3, "d": 2}]}, "b": 1}))
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(
            std::str::from_utf8(a.as_bytes()).unwrap(),
            r#"{"a":{"x":null,"y":[1,{"c":3,"d":2}]},"b":1}"#
        );
    }

    #[test]
    fn timestamps_round_trip_at_millisecond_precision() {
        let t = now();
        let json = serde_json::to_string(&t).unwrap();
        let back: DateTime<Utc> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, t);
        assert_eq!(
            CanonicalBytes::new(&t).unwrap(),
            CanonicalBytes::new(&back).unwrap()
        );
    }
}
