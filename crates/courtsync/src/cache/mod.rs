//! Tiered caching layer.
//!
//! A bounded in-memory LRU tier backed by an optional persistent tier.
//! Freshness is governed by per-data-class TTLs from the configuration;
//! eviction is lazy on read plus an explicit [`TieredCache::sweep`] pass
//! run by the maintenance task.

pub mod entry;
pub mod store;

pub use entry::{CacheEntry, PersistedEntry};
pub use store::{CacheStats, SweepReport, TieredCache};
