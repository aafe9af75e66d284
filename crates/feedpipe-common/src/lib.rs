//! Feedpipe Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared utilities and error handling for the feedpipe workspace.
//!
//! # Overview
//!
//! - **Error Handling**: Common error and result types
//! - **Checksums**: Payload hashing and item fingerprints
//! - **Logging**: Centralised `tracing` subscriber setup
//!
//! # Example
//!
//! ```no_run
//! use feedpipe_common::checksum::fingerprint;
//! use serde_json::json;
//!
//! fn main() -> feedpipe_common::Result<()> {
//!     let hash = fingerprint(&json!({ "title": ["Hello"] }))?;
//!     println!("fingerprint: {}", hash);
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{CommonError, Result};
