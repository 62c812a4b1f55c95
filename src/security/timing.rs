//! Timing attack protection utilities
//!
//! Shared-key comparisons must not leak how many leading bytes matched or
//! how long the expected key is.

use sha2::{Digest, Sha256};

/// Constant-time byte array comparison
pub fn constant_time_eq_bytes(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (byte_a, byte_b) in a.iter().zip(b.iter()) {
        result |= byte_a ^ byte_b;
    }

    result == 0
}

/// Compare two secrets through their SHA-256 digests so that differing
/// lengths take the same path as differing contents
pub fn secrets_match(provided: &str, expected: &str) -> bool {
    let provided = Sha256::digest(provided.as_bytes());
    let expected = Sha256::digest(expected.as_bytes());
    constant_time_eq_bytes(provided.as_slice(), expected.as_slice())
}
