//! Byte encodings shared by the challenge, message and recovery code paths.
//!
//! Canonical JSON here means: compact output, object keys sorted at every
//! nesting level. Digests computed over it must match what the server computes
//! byte for byte, so every hash input in this crate goes through
//! [`canonical_json`].

use crate::error::{AuthError, Result};
use base64ct::{Base64Url, Base64UrlUnpadded, Encoding};
use blake2::{Blake2s256, Digest};
use serde::Serialize;
use serde_json::{Map, Value};

/// Decodes base64url, accepting both padded and unpadded input.
pub fn decode_base64url(input: &str) -> Result<Vec<u8>> {
    Base64UrlUnpadded::decode_vec(input)
        .or_else(|_| Base64Url::decode_vec(input))
        .map_err(|err| AuthError::Encoding(format!("invalid base64url: {err}")))
}

#[must_use]
pub fn encode_base64url(bytes: &[u8]) -> String {
    Base64UrlUnpadded::encode_string(bytes)
}

/// Serializes `value` with stable key ordering and no whitespace.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let value = sort_keys(serde_json::to_value(value)?);
    Ok(serde_json::to_vec(&value)?)
}

/// Same as [`canonical_json`] but returns a `String`.
pub fn canonical_json_string<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let value = sort_keys(serde_json::to_value(value)?);
    Ok(serde_json::to_string(&value)?)
}

// Rebuilds maps in sorted order so the output is stable even when serde_json
// is compiled with insertion-order maps.
fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            let mut sorted = Map::new();
            for (key, inner) in entries {
                sorted.insert(key, sort_keys(inner));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

#[must_use]
pub fn blake2s_256(bytes: &[u8]) -> [u8; 32] {
    let digest = Blake2s256::digest(bytes);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}
