//! Content hashing over canonical JSON.
//!
//! Canonical form is the standard serializer's output: struct fields in
//! declaration order, map keys in `serde_json::Map` order (sorted), dates as
//! ISO-8601 strings via chrono's serde impl. SHA-256, hex lowercase.

use serde::Serialize;
use sha2::{Digest, Sha256};

pub fn checksum_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub fn checksum_value(value: &serde_json::Value) -> String {
    // Serializing a Value cannot fail.
    let bytes = serde_json::to_vec(value).expect("JSON value serializes");
    checksum_bytes(&bytes)
}

pub fn checksum_of<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(value)?;
    Ok(checksum_bytes(&bytes))
}
