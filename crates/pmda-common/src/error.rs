//! Error types for the shared helpers

use thiserror::Error;

/// Result type alias for common helpers
pub type Result<T> = std::result::Result<T, PmdaError>;

#[derive(Error, Debug)]
pub enum PmdaError {
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
}
