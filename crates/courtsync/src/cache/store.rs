//! Tiered cache: in-memory LRU tier over an optional persistent tier.

use lru::LruCache;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::{
    cache::entry::{CacheEntry, PersistedEntry},
    config::CacheConfig,
    models::CacheKey,
    storage::PersistentStore,
};

/// Counter snapshot for diagnostics.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub promotions: u64,
    pub stale_evictions: u64,
    pub storage_failures: u64,
    pub memory_entries: usize,
}

/// Result of one sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub memory_removed: usize,
    pub persistent_removed: usize,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    promotions: AtomicU64,
    stale_evictions: AtomicU64,
    storage_failures: AtomicU64,
}

/// Two-tier cache keyed by [`CacheKey`].
///
/// Reads hit the bounded in-memory LRU tier first and fall through to the
/// persistent tier; fresh persistent hits are promoted into memory. Every
/// TTL comes from the per-class table in [`CacheConfig`]. Storage failures
/// are logged and surface as misses, so the cache never propagates I/O
/// errors to readers.
#[derive(Clone)]
pub struct TieredCache {
    memory: Arc<RwLock<LruCache<String, CacheEntry>>>,
    persistent: Option<Arc<dyn PersistentStore>>,
    config: CacheConfig,
    counters: Arc<Counters>,
    /// Bumped under the memory lock by every invalidation; [`Self::get`]
    /// re-checks it before promoting a persistent hit into memory.
    generation: Arc<AtomicU64>,
}

impl TieredCache {
    pub fn new(config: CacheConfig, persistent: Option<Arc<dyn PersistentStore>>) -> Self {
        let capacity =
            NonZeroUsize::new(config.memory_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            memory: Arc::new(RwLock::new(LruCache::new(capacity))),
            persistent,
            config,
            counters: Arc::new(Counters::default()),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Looks up `key`, consulting memory first, then the persistent tier.
    ///
    /// Stale entries found on the way are removed lazily. A fresh
    /// persistent hit is promoted into memory with its remaining TTL;
    /// the promotion is skipped when an invalidation or a newer write
    /// raced the read.
    pub async fn get(&self, key: &CacheKey) -> Option<serde_json::Value> {
        let encoded = key.encode();

        {
            let mut memory = self.memory.write().await;
            match memory.get(&encoded) {
                Some(entry) if entry.is_fresh() => {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.payload.clone());
                }
                Some(_) => {
                    memory.pop(&encoded);
                    self.counters.stale_evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => {}
            }
        }

        let Some(store) = &self.persistent else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let generation = self.generation.load(Ordering::Relaxed);
        let bytes = match store.get(&encoded).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Err(e) => {
                warn!(key = %encoded, error = %e, "persistent tier read failed, treating as miss");
                self.counters.storage_failures.fetch_add(1, Ordering::Relaxed);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let entry = match PersistedEntry::from_bytes(&encoded, &bytes) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key = %encoded, error = %e, "removing corrupt persisted entry");
                if let Err(e) = store.remove(&encoded).await {
                    warn!(key = %encoded, error = %e, "failed to remove corrupt entry");
                }
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let ttl = self.config.ttl_for(entry.class);
        if !entry.is_fresh(ttl) {
            if let Err(e) = store.remove(&encoded).await {
                warn!(key = %encoded, error = %e, "failed to remove stale entry");
            }
            self.counters.stale_evictions.fetch_add(1, Ordering::Relaxed);
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let remaining = entry.remaining_ttl(ttl);
        {
            let mut memory = self.memory.write().await;
            // A racing invalidation or a fresher write wins over this
            // promotion; the reader still gets the value it read.
            let invalidated = self.generation.load(Ordering::Relaxed) != generation;
            let replaced = memory.peek(&encoded).is_some_and(CacheEntry::is_fresh);
            if !invalidated && !replaced {
                memory.put(encoded, CacheEntry::new(entry.payload.clone(), remaining));
                self.counters.promotions.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.payload)
    }

    /// Writes `payload` under `key` into both tiers. The TTL comes from the
    /// key's data class.
    pub async fn set(&self, key: &CacheKey, payload: serde_json::Value) {
        let encoded = key.encode();
        let ttl = self.config.ttl_for(key.class);

        self.memory
            .write()
            .await
            .put(encoded.clone(), CacheEntry::new(payload.clone(), ttl));

        let Some(store) = &self.persistent else {
            return;
        };
        let envelope = PersistedEntry::new(key.class, payload);
        let bytes = match envelope.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key = %encoded, error = %e, "failed to encode persistent envelope");
                self.counters.storage_failures.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        if let Err(e) = store.set(&encoded, &bytes).await {
            warn!(key = %encoded, error = %e, "persistent tier write failed");
            self.counters.storage_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Removes one key from both tiers. Absence is not an error.
    ///
    /// The persistent copy goes first, then the memory entry together with
    /// a generation bump, so an overlapping read cannot promote the removed
    /// entry back into memory.
    pub async fn invalidate_key(&self, key: &CacheKey) {
        let encoded = key.encode();

        if let Some(store) = &self.persistent
            && let Err(e) = store.remove(&encoded).await
        {
            warn!(key = %encoded, error = %e, "persistent tier invalidation failed");
            self.counters.storage_failures.fetch_add(1, Ordering::Relaxed);
        }

        let mut memory = self.memory.write().await;
        memory.pop(&encoded);
        self.generation.fetch_add(1, Ordering::Relaxed);
    }

    /// Removes every entry whose encoded key starts with `prefix`, in both
    /// tiers. Returns the number of entries removed.
    ///
    /// Same ordering as [`Self::invalidate_key`]: persistent removals
    /// first, then the memory entries and the generation bump.
    pub async fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut removed = 0usize;

        if let Some(store) = &self.persistent {
            match store.list(prefix).await {
                Ok(keys) => {
                    for key in keys {
                        match store.remove(&key).await {
                            Ok(()) => removed += 1,
                            Err(e) => {
                                warn!(key = %key, error = %e, "persistent tier invalidation failed");
                                self.counters.storage_failures.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(prefix = %prefix, error = %e, "persistent tier listing failed");
                    self.counters.storage_failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        {
            let mut memory = self.memory.write().await;
            let matching: Vec<String> = memory
                .iter()
                .filter(|(k, _)| k.starts_with(prefix))
                .map(|(k, _)| k.clone())
                .collect();
            for key in matching {
                memory.pop(&key);
                removed += 1;
            }
            self.generation.fetch_add(1, Ordering::Relaxed);
        }

        debug!(prefix = %prefix, removed, "prefix invalidation");
        removed
    }

    /// Removes stale entries from both tiers independently of the read
    /// path. Corrupt persisted entries are removed as well.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        {
            let mut memory = self.memory.write().await;
            let stale: Vec<String> = memory
                .iter()
                .filter(|(_, entry)| !entry.is_fresh())
                .map(|(k, _)| k.clone())
                .collect();
            for key in stale {
                memory.pop(&key);
                report.memory_removed += 1;
            }
        }
        self.counters
            .stale_evictions
            .fetch_add(report.memory_removed as u64, Ordering::Relaxed);

        let Some(store) = &self.persistent else {
            return report;
        };

        let keys = match store.list("").await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "sweep could not list persistent tier");
                self.counters.storage_failures.fetch_add(1, Ordering::Relaxed);
                return report;
            }
        };

        for key in keys {
            let bytes = match store.get(&key).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => continue,
                Err(e) => {
                    warn!(key = %key, error = %e, "sweep read failed");
                    self.counters.storage_failures.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };

            let keep = match PersistedEntry::from_bytes(&key, &bytes) {
                Ok(entry) => entry.is_fresh(self.config.ttl_for(entry.class)),
                Err(e) => {
                    warn!(key = %key, error = %e, "sweep found corrupt entry");
                    false
                }
            };

            if !keep {
                match store.remove(&key).await {
                    Ok(()) => report.persistent_removed += 1,
                    Err(e) => {
                        warn!(key = %key, error = %e, "sweep removal failed");
                        self.counters.storage_failures.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }

        if report.memory_removed > 0 || report.persistent_removed > 0 {
            debug!(
                memory_removed = report.memory_removed,
                persistent_removed = report.persistent_removed,
                "cache sweep"
            );
        }
        report
    }

    /// Counter snapshot plus current memory tier occupancy.
    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            promotions: self.counters.promotions.load(Ordering::Relaxed),
            stale_evictions: self.counters.stale_evictions.load(Ordering::Relaxed),
            storage_failures: self.counters.storage_failures.load(Ordering::Relaxed),
            memory_entries: self.memory.read().await.len(),
        }
    }
}
