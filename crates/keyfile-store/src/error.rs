//! Error types for the key/file store.

use std::path::PathBuf;

/// Result type for key/file store operations.
pub type Result<T> = std::result::Result<T, KeyFileError>;

/// Errors that can occur during key/file store operations.
#[derive(Debug, thiserror::Error)]
pub enum KeyFileError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Key validation failed
    #[error("Invalid key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    /// Root directory could not be prepared
    #[error("Failed to prepare root directory {path:?}: {source}")]
    RootDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A stored file name could not be decoded back into a key
    #[error("Undecodable file name {name:?}: {reason}")]
    UndecodableName { name: String, reason: String },
}

impl KeyFileError {
    pub fn invalid_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            key: key.into(),
            reason: reason.into(),
        }
    }
}
