//! SHA-256 fingerprints for payloads and cache keys

use crate::error::{PmdaError, Result};
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of an in-memory buffer
pub fn sha256_hex(data: impl AsRef<[u8]>) -> String {
    hex::encode(Sha256::digest(data.as_ref()))
}

/// Fail with [`PmdaError::ChecksumMismatch`] unless `data` hashes to `expected`
pub fn verify_sha256(data: impl AsRef<[u8]>, expected: &str) -> Result<()> {
    let actual = sha256_hex(data);
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(PmdaError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const HELLO_WORLD: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_sha256_hex() {
        assert_eq!(sha256_hex(b"hello world"), HELLO_WORLD);
        assert_eq!(sha256_hex("hello world"), HELLO_WORLD);
    }

    #[test]
    fn test_verify_sha256() {
        assert!(verify_sha256(b"hello world", &HELLO_WORLD.to_uppercase()).is_ok());
        assert!(matches!(
            verify_sha256(b"hello world!", HELLO_WORLD),
            Err(PmdaError::ChecksumMismatch { .. })
        ));
    }
}
