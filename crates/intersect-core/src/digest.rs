//! Deterministic BLAKE3 digests used for action hashes, attempt keys, bundle
//! hashes and the audit hash chain.

use serde::Serialize;

use crate::error::StorageError;

/// Digest of a sequence of string parts.
///
/// Each part is length-prefixed so `("ab", "c")` and `("a", "bc")` never collide.
pub fn digest_parts(parts: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

/// Digest of the canonical JSON encoding of `value`.
///
/// Maps inside the crate are `BTreeMap`s, so the encoding is key-ordered.
pub fn digest_json<T: Serialize>(value: &T) -> Result<String, StorageError> {
    let bytes =
        serde_json::to_vec(value).map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

/// Shortened digest for human-facing identifiers.
pub fn short(digest: &str) -> &str {
    &digest[..digest.len().min(16)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_prefix_separates_parts() {
        assert_ne!(digest_parts(&["ab", "c"]), digest_parts(&["a", "bc"]));
        assert_eq!(digest_parts(&["a", "b"]), digest_parts(&["a", "b"]));
    }
}
