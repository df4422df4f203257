//! Stable fingerprints over request payloads.
//!
//! A confirm request is named by its caller-chosen idempotency key; the
//! fingerprint detects reuse of that key with a different body. Two payloads
//! that differ only in object key order or whitespace must fingerprint
//! identically, so the body is canonicalized before hashing: parsed into a
//! `serde_json::Value` (whose objects are BTreeMaps, sorted at every level)
//! and re-serialized compactly. Payloads carry no floating point values;
//! prices are integer minor units.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Canonical serialization: sorted object keys, no insignificant whitespace.
pub fn canonicalize(value: &Value) -> String {
    serde_json::to_string(value).expect("JSON value serialization cannot fail")
}

/// SHA-256 over the canonical form, hex-encoded.
pub fn fingerprint(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonicalize(value).as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_change_the_fingerprint() {
        let a: Value = serde_json::from_str(r#"{"b":1,"a":{"y":2,"x":3}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a":{"x":3,"y":2},"b":1}"#).unwrap();
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn whitespace_does_not_change_the_fingerprint() {
        let a: Value = serde_json::from_str(r#"{ "reservationId" : "r-1" }"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"reservationId":"r-1"}"#).unwrap();
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn different_payloads_fingerprint_differently() {
        let a = json!({"reservationId": "r-1"});
        let b = json!({"reservationId": "r-2"});
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn fingerprint_is_hex_encoded_sha256() {
        let fp = fingerprint(&json!({}));
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    fn arb_json(depth: u32) -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            "[a-z0-9]{0,12}".prop_map(Value::from),
        ];
        leaf.prop_recursive(depth, 64, 8, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(Value::from),
                prop::collection::btree_map("[a-z]{1,8}", inner, 0..6)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn round_trip_through_text_is_stable(value in arb_json(3)) {
            let reparsed: Value = serde_json::from_str(&canonicalize(&value)).unwrap();
            prop_assert_eq!(fingerprint(&value), fingerprint(&reparsed));
        }

        #[test]
        fn canonical_form_is_deterministic(value in arb_json(3)) {
            prop_assert_eq!(canonicalize(&value), canonicalize(&value));
        }
    }
}
