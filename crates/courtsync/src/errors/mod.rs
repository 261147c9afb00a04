//! Centralized error handling for the synchronization subsystem.
//!
//! # Error Categories
//!
//! - **Channel Errors**: push channel open/acknowledgement/close failures
//! - **Provider Errors**: remote data fetch failures
//! - **Storage Errors**: persistent cache tier failures
//! - **Validation/Configuration Errors**: bad input or bad settings
//!
//! Transient failures stay inside the subsystem (retries, fallback); what
//! reaches the caller through these types is either a real terminal failure
//! or a misuse.

pub mod types;

pub use types::*;

/// Convenience type alias for Results using SyncError
pub type SyncResult<T> = Result<T, SyncError>;

/// Convenience type alias for channel-layer Results
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Convenience type alias for provider-layer Results
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Convenience type alias for storage-layer Results
pub type StorageResult<T> = Result<T, StorageError>;
