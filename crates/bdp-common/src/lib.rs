//! BDP Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared plumbing for the BDP loader workspace.
//!
//! - **Error Handling**: [`BdpError`] and the crate-wide [`Result`] alias
//! - **Environment**: typed readers for `KEY=value` settings ([`env`])
//! - **Checksums**: SHA-256 digests used to pin staged files for replay
//! - **Logging**: `tracing` subscriber setup shared by every binary
//!
//! # Example
//!
//! ```no_run
//! use bdp_common::{env, Result};
//!
//! fn workers() -> Result<usize> {
//!     env::parse_or("LOADER_WORKERS", 4)
//! }
//! ```

pub mod checksum;
pub mod env;
pub mod error;
pub mod logging;

pub use error::{BdpError, Result};
