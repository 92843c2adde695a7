// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared hashing helpers.

use sha2::{Digest, Sha256};

/// Computes the lowercase hexadecimal SHA-256 digest of `bytes`.
///
/// This is the only hash used to correlate pushed bundles with agent
/// acknowledgments, so both sides must go through it.
pub fn compute_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_sha256_matches_expected_digest() {
        assert_eq!(
            compute_sha256(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn compute_sha256_is_stable_for_equal_input() {
        assert_eq!(compute_sha256(b"a: 1\n"), compute_sha256(b"a: 1\n"));
        assert_ne!(compute_sha256(b"a: 1\n"), compute_sha256(b"a: 2\n"));
    }
}
