//! Context object wiring the sync components together.
//!
//! [`SyncContext`] is the single entry point an application holds: it owns
//! the tiered cache, the connection manager, the fallback poller, the
//! circuit breaker registry and the performance monitor, and exposes the
//! operations UI code needs. Construction goes through
//! [`SyncContextBuilder`], which injects the push channel and remote data
//! providers and optionally a persistent store.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    breaker::{BreakerRegistry, BreakerSnapshot},
    cache::{CacheStats, SweepReport, TieredCache},
    config::SyncConfig,
    connection::{ConnectionManager, ListenerGuard, TargetStatus},
    errors::{SyncError, SyncResult},
    models::{
        CacheKey, ConnectionState, ConnectivityIndicator, SubscriptionFilter, TargetId,
    },
    monitor::{PerformanceMetrics, PerformanceMonitor},
    poller::FallbackPoller,
    sources::{PushChannelProvider, RemoteDataProvider},
    storage::{FileStoreBackend, PersistentStore},
};

/// Builder for [`SyncContext`].
///
/// A push channel provider and a remote data provider are mandatory. The
/// persistent cache tier comes either from an injected store or from the
/// configured cache directory; with neither, the cache runs memory-only.
pub struct SyncContextBuilder {
    config: SyncConfig,
    push_provider: Option<Arc<dyn PushChannelProvider>>,
    data_provider: Option<Arc<dyn RemoteDataProvider>>,
    persistent: Option<Arc<dyn PersistentStore>>,
}

impl SyncContextBuilder {
    fn new() -> Self {
        Self {
            config: SyncConfig::default(),
            push_provider: None,
            data_provider: None,
            persistent: None,
        }
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn push_provider(mut self, provider: Arc<dyn PushChannelProvider>) -> Self {
        self.push_provider = Some(provider);
        self
    }

    pub fn data_provider(mut self, provider: Arc<dyn RemoteDataProvider>) -> Self {
        self.data_provider = Some(provider);
        self
    }

    /// Injects a persistent store, overriding the configured cache
    /// directory.
    pub fn persistent_store(mut self, store: Arc<dyn PersistentStore>) -> Self {
        self.persistent = Some(store);
        self
    }

    /// Validates the configuration, wires the components and starts the
    /// cache sweep task.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Configuration`] when a provider is missing or
    /// the configuration is invalid, and [`SyncError::Storage`] when the
    /// configured cache directory cannot be opened.
    pub async fn build(self) -> SyncResult<SyncContext> {
        self.config.validate()?;
        let config = self.config;

        let push_provider = self
            .push_provider
            .ok_or_else(|| SyncError::configuration("a push channel provider is required"))?;
        let data_provider = self
            .data_provider
            .ok_or_else(|| SyncError::configuration("a remote data provider is required"))?;

        let persistent: Option<Arc<dyn PersistentStore>> = match self.persistent {
            Some(store) => Some(store),
            None => match &config.cache.persistent_dir {
                Some(dir) => {
                    info!(dir = %dir.display(), "opening persistent cache store");
                    Some(Arc::new(FileStoreBackend::open(dir.clone()).await?))
                }
                None => None,
            },
        };

        let cache = TieredCache::new(config.cache.clone(), persistent);
        let monitor = Arc::new(PerformanceMonitor::new(config.monitor.clone()));
        let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));
        let poller = Arc::new(FallbackPoller::new(
            config.fallback.clone(),
            cache.clone(),
            data_provider.clone(),
            monitor.clone(),
        ));
        let connection = ConnectionManager::new(
            config.connection.clone(),
            push_provider,
            cache.clone(),
            breakers.clone(),
            poller.clone(),
            monitor.clone(),
        );

        let sweep_token = CancellationToken::new();
        if config.cache.sweep_enabled {
            spawn_sweep_task(
                cache.clone(),
                config.cache.sweep_interval,
                sweep_token.clone(),
            );
        }

        Ok(SyncContext {
            config,
            cache,
            connection,
            poller,
            breakers,
            monitor,
            data_provider,
            sweep_token,
        })
    }
}

/// Periodically sweeps expired entries out of both cache tiers.
fn spawn_sweep_task(cache: TieredCache, interval: std::time::Duration, token: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately; a sweep of a fresh cache is
        // pointless, so consume it.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("cache sweep task stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let report = cache.sweep().await;
                    if report.memory_removed > 0 || report.persistent_removed > 0 {
                        debug!(
                            memory = report.memory_removed,
                            persistent = report.persistent_removed,
                            "cache sweep removed stale entries"
                        );
                    }
                }
            }
        }
    });
}

/// Entry point of the sync subsystem. Cheap to clone; all clones share
/// state.
#[derive(Clone)]
pub struct SyncContext {
    config: SyncConfig,
    cache: TieredCache,
    connection: ConnectionManager,
    poller: Arc<FallbackPoller>,
    breakers: Arc<BreakerRegistry>,
    monitor: Arc<PerformanceMonitor>,
    data_provider: Arc<dyn RemoteDataProvider>,
    sweep_token: CancellationToken,
}

impl SyncContext {
    pub fn builder() -> SyncContextBuilder {
        SyncContextBuilder::new()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Subscribes to push updates for a target. See
    /// [`ConnectionManager::subscribe`].
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Validation`] for an empty target id.
    pub async fn subscribe(
        &self,
        target: impl Into<TargetId>,
        filter: SubscriptionFilter,
    ) -> SyncResult<()> {
        self.connection.subscribe(target.into(), filter).await
    }

    /// Tears down one subscription. Returns `false` when the target was not
    /// subscribed.
    pub async fn unsubscribe(&self, target: impl Into<TargetId>) -> bool {
        self.connection.unsubscribe(&target.into()).await
    }

    /// Read-through lookup: serves from the cache, falling back to the
    /// remote data provider on a miss. Fetched records are cached before
    /// the requested key is read again, so one fetch warms every entry of
    /// the target.
    ///
    /// `Ok(None)` means the backend itself has no such item.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Provider`] when the entry is not cached and the
    /// remote fetch fails.
    pub async fn get(&self, key: &CacheKey) -> SyncResult<Option<serde_json::Value>> {
        if let Some(value) = self.cache.get(key).await {
            return Ok(Some(value));
        }

        debug!(key = %key, "cache miss, fetching from remote");
        let records = self
            .data_provider
            .fetch(&key.scope, SubscriptionFilter::All)
            .await?;
        for record in &records {
            self.cache
                .set(&record.cache_key(&key.scope), record.payload.clone())
                .await;
        }
        Ok(self.cache.get(key).await)
    }

    /// Current process-wide connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        self.connection.connection_state().await
    }

    /// Registers a connection state listener; the registration lives until
    /// the returned guard is dropped or [`SyncContext::cleanup`] runs.
    pub fn add_connection_state_listener(
        &self,
        callback: impl Fn(ConnectionState) + Send + Sync + 'static,
    ) -> ListenerGuard {
        self.connection.add_state_listener(Box::new(callback))
    }

    /// Coarse indicator for the UI, folding connection state and fallback
    /// activity together.
    pub async fn connectivity(&self) -> ConnectivityIndicator {
        let state = self.connection.connection_state().await;
        let fallback_active = self.poller.any_active().await;
        ConnectivityIndicator::derive(state, fallback_active)
    }

    /// Lifecycle stage per subscribed target, for diagnostics.
    pub async fn target_statuses(&self) -> HashMap<TargetId, TargetStatus> {
        self.connection.target_statuses().await
    }

    /// Performance counters and derived gauges.
    pub async fn metrics(&self) -> PerformanceMetrics {
        self.monitor.metrics().await
    }

    /// Cache hit and miss counters plus current occupancy.
    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    /// Circuit breaker snapshots for every target seen so far.
    pub async fn breaker_snapshots(&self) -> HashMap<TargetId, BreakerSnapshot> {
        self.breakers.snapshot_all().await
    }

    /// Runs one cache sweep immediately, returning what was removed.
    pub async fn sweep_now(&self) -> SweepReport {
        self.cache.sweep().await
    }

    /// Suspends push activity for a backgrounded app. See
    /// [`ConnectionManager::on_background`].
    pub async fn on_background(&self) {
        self.connection.on_background().await;
    }

    /// Restores push activity for a foregrounded app. See
    /// [`ConnectionManager::on_foreground`].
    pub async fn on_foreground(&self) {
        self.connection.on_foreground().await;
    }

    /// Releases channels, background tasks, listeners and counters. Safe to
    /// call more than once. Cached data stays on disk so the next start
    /// works offline.
    pub async fn cleanup(&self) {
        self.sweep_token.cancel();
        self.connection.cleanup().await;
    }
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext").finish_non_exhaustive()
    }
}
