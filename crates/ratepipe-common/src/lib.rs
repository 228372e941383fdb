//! Ratepipe Common Library
//!
//! Shared utilities and error handling for the ratepipe workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`CommonError`] and the [`Result`] alias
//! - **Checksums**: canonical JSON serialization and SHA-256 content hashes
//! - **Logging**: `tracing` subscriber setup shared by every binary
//!
//! # Example
//!
//! ```no_run
//! use ratepipe_common::checksum::CanonicalJson;
//!
//! fn hash_payload(raw: &str) -> ratepipe_common::Result<String> {
//!     let value: serde_json::Value = serde_json::from_str(raw)?;
//!     Ok(CanonicalJson::from_value(&value)?.hash().to_string())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checksum;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{CommonError, Result};
