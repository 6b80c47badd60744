//! Error types shared across the workspace

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, BdpError>;

/// Shared error for configuration, filesystem and serialization plumbing
#[derive(Error, Debug)]
pub enum BdpError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid value for {var}: '{value}' ({reason})")]
    InvalidSetting {
        var: String,
        value: String,
        reason: String,
    },

    #[error("Checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
}

impl BdpError {
    pub fn invalid_setting(
        var: impl Into<String>,
        value: impl Into<String>,
        reason: impl std::fmt::Display,
    ) -> Self {
        BdpError::InvalidSetting {
            var: var.into(),
            value: value.into(),
            reason: reason.to_string(),
        }
    }
}
