//! PMDA Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared utilities used across the PMDA loader workspace.
//!
//! - **Logging**: subscriber configuration shared by the CLI and tests
//! - **Checksums**: content fingerprints for cached payloads and loaded rows
//! - **Errors**: the error type returned by the helpers in this crate

pub mod checksum;
pub mod error;
pub mod logging;

pub use error::{PmdaError, Result};
