//! Canonical serialization for snapshot content ids.
//!
//! ## Determinism Guarantees
//!
//! - Struct fields serialize in declaration order, vectors in index order
//! - Maps in hashed data are BTreeMaps or normalized JSON objects
//! - Scores are quantized to i64 before hashing; integral floats inside
//!   attribute values are written as integers

use serde::Serialize;
use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Quantization factor for float normalization.
/// Floats are multiplied by this value and rounded to i64.
pub const FLOAT_QUANTIZATION_FACTOR: f64 = 1_000_000.0;

/// Quantize a float to an i64 for deterministic hashing and comparison.
pub fn quantize(value: f64) -> i64 {
    (value * FLOAT_QUANTIZATION_FACTOR).round() as i64
}

/// Serialize a value to canonical JSON bytes for hashing.
///
/// # Panics
///
/// Panics if `T`'s `Serialize` implementation fails, which cannot happen for
/// the string-keyed types hashed in this crate.
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).expect("Canonical serialization failed")
}

/// SHA-256 of raw bytes as a 64-character lowercase hex string.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Normalize a JSON value so that semantically equal values serialize identically.
///
/// Object keys are sorted and floats with no fractional part are rewritten
/// as integers, so `1.0` and `1` canonicalize the same way.
pub fn normalize_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, normalize_value(v))).collect();
            let normalized: Map<String, Value> =
                sorted.into_iter().map(|(k, v)| (k.clone(), v)).collect();
            Value::Object(normalized)
        }
        Value::Array(items) => Value::Array(items.iter().map(normalize_value).collect()),
        Value::Number(n) => Value::Number(normalize_number(n)),
        other => other.clone(),
    }
}

fn normalize_number(n: &Number) -> Number {
    if n.is_f64() {
        if let Some(f) = n.as_f64() {
            if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                return Number::from(f as i64);
            }
        }
    }
    n.clone()
}
