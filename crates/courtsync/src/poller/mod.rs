//! Pull-based fallback polling.
//!
//! When push delivery for a target is unavailable, the connection manager
//! hands the target to the poller, which periodically fetches the target's
//! data through the [`RemoteDataProvider`] and writes it through the cache.
//! Sessions are cancellation-token scoped; a failed poll logs and the loop
//! keeps going.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cache::TieredCache,
    config::FallbackConfig,
    models::{Record, SubscriptionFilter, TargetId},
    monitor::PerformanceMonitor,
    sources::RemoteDataProvider,
};

/// Invoked after every successful poll with the fetched records.
pub type UpdateCallback = Arc<dyn Fn(&TargetId, &[Record]) + Send + Sync>;

struct FallbackSession {
    token: CancellationToken,
    high_priority: bool,
    started_at: Instant,
    last_success: Arc<RwLock<Option<Instant>>>,
}

/// Status of one fallback session, for diagnostics.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub target: TargetId,
    pub high_priority: bool,
    pub running_for: Duration,
    pub since_last_success: Option<Duration>,
}

/// Periodic pull-based refresher, one session per target.
pub struct FallbackPoller {
    config: FallbackConfig,
    cache: TieredCache,
    provider: Arc<dyn RemoteDataProvider>,
    monitor: Arc<PerformanceMonitor>,
    sessions: Arc<RwLock<HashMap<TargetId, FallbackSession>>>,
}

impl FallbackPoller {
    pub fn new(
        config: FallbackConfig,
        cache: TieredCache,
        provider: Arc<dyn RemoteDataProvider>,
        monitor: Arc<PerformanceMonitor>,
    ) -> Self {
        Self {
            config,
            cache,
            provider,
            monitor,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Starts polling `target`. Returns `false` when a session already
    /// exists, leaving the running session untouched.
    ///
    /// The first poll happens immediately; afterwards the session sleeps
    /// the configured interval between polls, stretched while battery
    /// optimization is active.
    pub async fn start(
        &self,
        target: TargetId,
        filter: SubscriptionFilter,
        high_priority: bool,
        on_update: UpdateCallback,
    ) -> bool {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&target) {
            debug!(target = %target, "fallback session already running");
            return false;
        }

        let token = CancellationToken::new();
        let last_success = Arc::new(RwLock::new(None));
        sessions.insert(
            target.clone(),
            FallbackSession {
                token: token.clone(),
                high_priority,
                started_at: Instant::now(),
                last_success: last_success.clone(),
            },
        );
        drop(sessions);

        let base_interval = if high_priority {
            self.config.high_priority_poll_interval
        } else {
            self.config.poll_interval
        };
        let stretch_factor = self.config.battery_stretch_factor;
        let cache = self.cache.clone();
        let provider = self.provider.clone();
        let monitor = self.monitor.clone();
        let loop_target = target.clone();

        info!(target = %target, high_priority, interval = ?base_interval, "starting fallback polling");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    () = Self::poll_once(
                        &loop_target,
                        filter,
                        &cache,
                        &provider,
                        &monitor,
                        &on_update,
                        &last_success,
                    ) => {}
                }

                let mut delay = base_interval;
                if monitor.should_optimize_for_battery() {
                    delay *= stretch_factor;
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            debug!(target = %loop_target, "fallback polling stopped");
        });

        true
    }

    async fn poll_once(
        target: &TargetId,
        filter: SubscriptionFilter,
        cache: &TieredCache,
        provider: &Arc<dyn RemoteDataProvider>,
        monitor: &Arc<PerformanceMonitor>,
        on_update: &UpdateCallback,
        last_success: &Arc<RwLock<Option<Instant>>>,
    ) {
        match provider.fetch(target, filter).await {
            Ok(records) => {
                for record in &records {
                    cache
                        .set(&record.cache_key(target), record.payload.clone())
                        .await;
                }
                monitor.record_fallback_poll();
                *last_success.write().await = Some(Instant::now());
                on_update(target, &records);
                debug!(target = %target, records = records.len(), "fallback poll succeeded");
            }
            Err(e) => {
                warn!(target = %target, error = %e, "fallback poll failed, will retry next cycle");
            }
        }
    }

    /// Stops the session for `target`. Returns whether one was running.
    pub async fn stop(&self, target: &TargetId) -> bool {
        let session = self.sessions.write().await.remove(target);
        match session {
            Some(session) => {
                session.token.cancel();
                info!(target = %target, "stopped fallback polling");
                true
            }
            None => false,
        }
    }

    /// Stops every session.
    pub async fn stop_all(&self) {
        let mut sessions = self.sessions.write().await;
        for (target, session) in sessions.drain() {
            session.token.cancel();
            debug!(target = %target, "stopped fallback polling");
        }
    }

    pub async fn is_active(&self, target: &TargetId) -> bool {
        self.sessions.read().await.contains_key(target)
    }

    pub async fn any_active(&self) -> bool {
        !self.sessions.read().await.is_empty()
    }

    /// Diagnostic view of all running sessions.
    pub async fn session_statuses(&self) -> Vec<SessionStatus> {
        let sessions = self.sessions.read().await;
        let mut statuses = Vec::with_capacity(sessions.len());
        for (target, session) in sessions.iter() {
            let since_last_success = session
                .last_success
                .read()
                .await
                .map(|instant| instant.elapsed());
            statuses.push(SessionStatus {
                target: target.clone(),
                high_priority: session.high_priority,
                running_for: session.started_at.elapsed(),
                since_last_success,
            });
        }
        statuses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, MonitorConfig};
    use crate::errors::{ProviderError, ProviderResult};
    use crate::models::{CacheKey, DataClass};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Provider that fails its first `fail_first` calls, then serves one
    /// live match record per poll.
    struct ScriptedProvider {
        calls: AtomicU64,
        fail_first: u64,
    }

    impl ScriptedProvider {
        fn new(fail_first: u64) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU64::new(0),
                fail_first,
            })
        }

        fn calls(&self) -> u64 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RemoteDataProvider for ScriptedProvider {
        async fn fetch(
            &self,
            target: &TargetId,
            _filter: SubscriptionFilter,
        ) -> ProviderResult<Vec<Record>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(ProviderError::fetch_failed(target, "scripted failure"));
            }
            Ok(vec![Record::new(
                DataClass::LiveMatch,
                "m1",
                serde_json::json!({ "seq": n }),
            )])
        }
    }

    fn build(
        provider: Arc<ScriptedProvider>,
    ) -> (FallbackPoller, TieredCache, Arc<PerformanceMonitor>) {
        let cache = TieredCache::new(CacheConfig::default(), None);
        let monitor = Arc::new(PerformanceMonitor::new(MonitorConfig::default()));
        let poller = FallbackPoller::new(
            FallbackConfig::default(),
            cache.clone(),
            provider,
            monitor.clone(),
        );
        (poller, cache, monitor)
    }

    fn noop_update() -> UpdateCallback {
        Arc::new(|_, _| {})
    }

    async fn wait_ms(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn first_poll_happens_immediately() {
        let provider = ScriptedProvider::new(0);
        let (poller, cache, _) = build(provider.clone());

        assert!(
            poller
                .start(TargetId::new("t1"), SubscriptionFilter::All, false, noop_update())
                .await
        );
        wait_ms(1).await;

        assert_eq!(provider.calls(), 1);
        assert!(
            cache
                .get(&CacheKey::live_match("t1", "m1"))
                .await
                .is_some(),
            "poll result must land in the cache"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn high_priority_uses_the_short_interval() {
        let provider = ScriptedProvider::new(0);
        let (poller, _, _) = build(provider.clone());

        poller
            .start(TargetId::new("t1"), SubscriptionFilter::LiveOnly, true, noop_update())
            .await;
        wait_ms(1).await;
        assert_eq!(provider.calls(), 1);

        wait_ms(13_000).await;
        assert_eq!(provider.calls(), 1, "14s in, the 15s interval has not elapsed");

        wait_ms(3_000).await;
        assert_eq!(provider.calls(), 2, "17s in, the second poll ran");
    }

    #[tokio::test(start_paused = true)]
    async fn normal_priority_waits_the_long_interval() {
        let provider = ScriptedProvider::new(0);
        let (poller, _, _) = build(provider.clone());

        poller
            .start(TargetId::new("t1"), SubscriptionFilter::All, false, noop_update())
            .await;
        wait_ms(59_000).await;
        assert_eq!(provider.calls(), 1);

        wait_ms(2_000).await;
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_polls_keep_the_loop_alive() {
        let provider = ScriptedProvider::new(1);
        let (poller, cache, monitor) = build(provider.clone());

        poller
            .start(TargetId::new("t1"), SubscriptionFilter::LiveOnly, true, noop_update())
            .await;
        wait_ms(1).await;
        assert_eq!(provider.calls(), 1, "first poll failed");
        assert!(cache.get(&CacheKey::live_match("t1", "m1")).await.is_none());

        wait_ms(16_000).await;
        assert_eq!(provider.calls(), 2, "loop survived the failure");
        assert!(cache.get(&CacheKey::live_match("t1", "m1")).await.is_some());
        // Only successful polls count.
        assert_eq!(monitor.metrics().await.fallback_polls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent_per_target() {
        let provider = ScriptedProvider::new(0);
        let (poller, _, _) = build(provider.clone());

        let target = TargetId::new("t1");
        assert!(
            poller
                .start(target.clone(), SubscriptionFilter::All, false, noop_update())
                .await
        );
        assert!(
            !poller
                .start(target.clone(), SubscriptionFilter::All, false, noop_update())
                .await,
            "second start must not spawn a second session"
        );
        wait_ms(1).await;
        assert_eq!(provider.calls(), 1);
        assert!(poller.is_active(&target).await);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_the_session() {
        let provider = ScriptedProvider::new(0);
        let (poller, _, _) = build(provider.clone());

        let target = TargetId::new("t1");
        poller
            .start(target.clone(), SubscriptionFilter::LiveOnly, true, noop_update())
            .await;
        wait_ms(1).await;
        assert_eq!(provider.calls(), 1);

        assert!(poller.stop(&target).await);
        assert!(!poller.stop(&target).await, "second stop finds nothing");
        assert!(!poller.is_active(&target).await);

        wait_ms(60_000).await;
        assert_eq!(provider.calls(), 1, "no polls after stop");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_all_cancels_every_session() {
        let provider = ScriptedProvider::new(0);
        let (poller, _, _) = build(provider.clone());

        poller
            .start(TargetId::new("t1"), SubscriptionFilter::All, true, noop_update())
            .await;
        poller
            .start(TargetId::new("t2"), SubscriptionFilter::All, true, noop_update())
            .await;
        wait_ms(1).await;
        assert_eq!(provider.calls(), 2);
        assert!(poller.any_active().await);

        poller.stop_all().await;
        assert!(!poller.any_active().await);

        wait_ms(60_000).await;
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn battery_optimization_stretches_the_interval() {
        let provider = ScriptedProvider::new(0);
        let (poller, _, monitor) = build(provider.clone());

        // Trip the battery heuristic before the session starts.
        monitor.record_background_disconnect();
        monitor.record_background_disconnect();
        monitor.record_background_disconnect();
        assert!(monitor.should_optimize_for_battery());

        poller
            .start(TargetId::new("t1"), SubscriptionFilter::LiveOnly, true, noop_update())
            .await;
        wait_ms(1).await;
        assert_eq!(provider.calls(), 1);

        // The 15s high-priority interval is stretched to 30s.
        wait_ms(16_000).await;
        assert_eq!(provider.calls(), 1);
        wait_ms(15_000).await;
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn session_status_reports_priority_and_recency() {
        let provider = ScriptedProvider::new(0);
        let (poller, _, _) = build(provider.clone());

        poller
            .start(TargetId::new("t1"), SubscriptionFilter::LiveOnly, true, noop_update())
            .await;
        wait_ms(5).await;

        let statuses = poller.session_statuses().await;
        assert_eq!(statuses.len(), 1);
        assert!(statuses[0].high_priority);
        assert!(statuses[0].since_last_success.is_some());
    }
}
