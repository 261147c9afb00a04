//! Real-time synchronization and resilient caching for tournament
//! officiating clients.
//!
//! The crate keeps locally displayed tournament, match and assignment data
//! consistent with a remote push channel, falls back to periodic polling
//! when that channel is unavailable, and serves reads from a tiered cache
//! (in-memory LRU plus an optional persistent tier). All remote interfaces
//! are trait seams, so the crate carries no backend-specific wire code.
//!
//! Entry point is [`context::SyncContext`], built from a
//! [`config::SyncConfig`] and the provider implementations.

pub mod breaker;
pub mod cache;
pub mod config;
pub mod connection;
pub mod context;
pub mod errors;
pub mod models;
pub mod monitor;
pub mod poller;
pub mod sources;
pub mod storage;

pub use context::{SyncContext, SyncContextBuilder};
pub use errors::SyncError;
