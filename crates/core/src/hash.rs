//! Content hashing and Kubernetes name helpers.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Kubernetes label-safe name limit.
pub const MAX_NAME_LEN: usize = 63;

/// Fixed-width content hash of any serializable value: truncated SHA-256
/// over its JSON encoding, as 16 lowercase hex chars. Stable across
/// toolchains, so safe to persist in annotations.
pub fn content_hash<T: Serialize + ?Sized>(value: &T) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(value)?;
    let digest = Sha256::digest(&bytes);
    Ok(digest[..8].iter().fold(String::with_capacity(16), |mut s, b| {
        use std::fmt::Write;
        let _ = write!(s, "{:02x}", b);
        s
    }))
}

/// `prefix + name`, cut down to `limit` chars by dropping the middle so both
/// the prefix and the distinguishing tail of `name` survive.
pub fn name_with_length_limit(prefix: &str, name: &str, limit: usize) -> String {
    let full: Vec<char> = prefix.chars().chain(name.chars()).collect();
    if full.len() <= limit {
        return full.into_iter().collect();
    }
    let head = limit / 2;
    let tail = limit - head;
    full[..head].iter().chain(full[full.len() - tail..].iter()).collect()
}
