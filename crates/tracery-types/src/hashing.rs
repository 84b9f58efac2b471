//! Canonical content hashing.
//!
//! Payloads are hashed with BLAKE3 over their canonical JSON encoding. Object
//! keys are emitted in sorted order (serde_json's default map is ordered), so two
//! structurally identical payloads always hash the same regardless of the order
//! their fields were inserted in.

use serde::Serialize;

use crate::Result;

/// Hex-encoded BLAKE3 hash of raw bytes.
pub fn hash_bytes(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Canonical JSON bytes of any serializable value.
pub fn stable_hash_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    // Round-trip through `Value` so struct field order cannot leak into the encoding.
    let canonical = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&canonical)?)
}

/// Hex-encoded BLAKE3 hash of the canonical JSON encoding of `value`.
pub fn stable_hash<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(hash_bytes(&stable_hash_bytes(value)?))
}
