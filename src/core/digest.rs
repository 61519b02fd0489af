//! Hash fallback encoding for strings that cannot be stored as index keys.

use sha2::{Digest, Sha256};

/// Length of a digest string (hex encoded SHA-256).
pub const DIGEST_LEN: usize = 64;

/// Deterministic SHA-256 digest of the UTF-8 bytes of `value`, lowercase hex.
pub fn digest(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}
