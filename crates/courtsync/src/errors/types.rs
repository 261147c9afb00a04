//! Error type definitions for the synchronization subsystem.
//!
//! A hierarchical error system: one top-level [`SyncError`] with nested
//! per-layer enums, so callers can match on the layer that failed without
//! string inspection.

use thiserror::Error;

use crate::models::TargetId;

/// Top-level synchronization error type.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Push channel errors
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Remote data provider errors
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Persistent storage errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Context builder wiring problems
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Rejected configuration values or inputs
    #[error("Validation error: {message}")]
    Validation { message: String },
}

/// Push channel specific errors.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Opening the channel failed outright
    #[error("Failed to open channel {channel}: {message}")]
    OpenFailed { channel: String, message: String },

    /// The channel closed while a subscription was active
    #[error("Channel {channel} closed unexpectedly")]
    Closed { channel: String },
}

/// Remote data provider specific errors.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// The fetch itself failed
    #[error("Fetch failed for target {target}: {message}")]
    FetchFailed { target: TargetId, message: String },

    /// The provider returned a payload that cannot be used
    #[error("Invalid payload from provider: {message}")]
    InvalidPayload { message: String },
}

/// Persistent storage specific errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Underlying store rejected or failed the operation
    #[error("Storage backend error: {message}")]
    Backend { message: String },

    /// A persisted envelope could not be decoded
    #[error("Corrupt persisted entry under key {key}: {message}")]
    CorruptEntry { key: String, message: String },

    /// JSON encoding of an envelope failed
    #[error("Envelope encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl SyncError {
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

impl ChannelError {
    pub fn open_failed<C: Into<String>, M: Into<String>>(channel: C, message: M) -> Self {
        Self::OpenFailed {
            channel: channel.into(),
            message: message.into(),
        }
    }
}

impl ProviderError {
    pub fn fetch_failed<M: Into<String>>(target: &TargetId, message: M) -> Self {
        Self::FetchFailed {
            target: target.clone(),
            message: message.into(),
        }
    }
}

impl StorageError {
    pub fn backend<M: Into<String>>(message: M) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    pub fn corrupt_entry<K: Into<String>, M: Into<String>>(key: K, message: M) -> Self {
        Self::CorruptEntry {
            key: key.into(),
            message: message.into(),
        }
    }
}

impl From<keyfile_store::KeyFileError> for StorageError {
    fn from(e: keyfile_store::KeyFileError) -> Self {
        Self::Backend {
            message: e.to_string(),
        }
    }
}
