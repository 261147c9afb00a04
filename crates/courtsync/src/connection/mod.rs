//! Push channel lifecycle management.
//!
//! The [`ConnectionManager`] owns every push subscription: it opens channels
//! through the configured [`PushChannelProvider`], confirms them against the
//! acknowledgement timeout, pumps incoming messages into cache invalidation,
//! and reconnects with jittered exponential backoff when a channel fails.
//! Attempts are gated per target by a circuit breaker; once the breaker
//! blocks a target the manager hands it to the [`FallbackPoller`] and probes
//! for recovery on the breaker's schedule.
//!
//! Application lifecycle hooks ([`ConnectionManager::on_background`] and
//! [`ConnectionManager::on_foreground`]) suspend and restore the whole
//! subscription set without losing its configuration.

pub mod backoff;
pub mod listeners;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    breaker::{BreakerRegistry, TargetBreaker},
    cache::TieredCache,
    config::ConnectionConfig,
    errors::{SyncError, SyncResult},
    models::{
        CacheKey, ConnectionState, DataClass, PushMessage, PushMessageKind, SubscriptionFilter,
        TargetId,
    },
    monitor::PerformanceMonitor,
    poller::{FallbackPoller, UpdateCallback},
    sources::{ChannelEvent, ChannelHandle, ChannelStatus, PushChannelProvider},
};

pub use backoff::ReconnectBackoff;
pub use listeners::{ConnectionStateCallback, ListenerGuard, ListenerRegistry};

/// Buffered events per channel between the provider and the pump task.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle stage of one subscribed target.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    /// A connection attempt is running.
    Connecting,
    /// The push channel is open and confirmed.
    Active,
    /// A retry timer is armed.
    PendingRetry,
    /// The circuit breaker blocks the channel; polling covers the target.
    Fallback,
    /// The app is backgrounded; the subscription is parked.
    Suspended,
    /// The retry budget is spent. Only a new `subscribe` call resumes.
    Failed,
}

impl std::fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Active => write!(f, "active"),
            Self::PendingRetry => write!(f, "pending_retry"),
            Self::Fallback => write!(f, "fallback"),
            Self::Suspended => write!(f, "suspended"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

struct TargetEntry {
    filter: SubscriptionFilter,
    status: TargetStatus,
    backoff: ReconnectBackoff,
    handle: Option<ChannelHandle>,
    /// Cancels the pending retry timer or the fallback recovery probe.
    retry_token: Option<CancellationToken>,
    /// Cancels the event pump of the active channel.
    pump_token: Option<CancellationToken>,
    attempt_in_flight: bool,
}

impl TargetEntry {
    fn new(filter: SubscriptionFilter, status: TargetStatus, config: &ConnectionConfig) -> Self {
        Self {
            filter,
            status,
            backoff: ReconnectBackoff::new(config),
            handle: None,
            retry_token: None,
            pump_token: None,
            attempt_in_flight: false,
        }
    }

    fn cancel_tasks(&mut self) {
        if let Some(token) = self.retry_token.take() {
            token.cancel();
        }
        if let Some(token) = self.pump_token.take() {
            token.cancel();
        }
    }
}

/// Manages push channel subscriptions for all targets.
///
/// Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct ConnectionManager {
    config: ConnectionConfig,
    channel_provider: Arc<dyn PushChannelProvider>,
    cache: TieredCache,
    breakers: Arc<BreakerRegistry>,
    poller: Arc<FallbackPoller>,
    monitor: Arc<PerformanceMonitor>,
    listeners: ListenerRegistry,
    state: Arc<RwLock<ConnectionState>>,
    targets: Arc<RwLock<HashMap<TargetId, TargetEntry>>>,
    suspended: Arc<AtomicBool>,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        channel_provider: Arc<dyn PushChannelProvider>,
        cache: TieredCache,
        breakers: Arc<BreakerRegistry>,
        poller: Arc<FallbackPoller>,
        monitor: Arc<PerformanceMonitor>,
    ) -> Self {
        Self {
            config,
            channel_provider,
            cache,
            breakers,
            poller,
            monitor,
            listeners: ListenerRegistry::new(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            targets: Arc::new(RwLock::new(HashMap::new())),
            suspended: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Subscribes to push updates for `target`.
    ///
    /// Subscribing an already subscribed target updates its filter and is
    /// otherwise a no-op, except for a target whose retry budget is spent:
    /// there the call resets the budget and reconnects. While the app is
    /// backgrounded the subscription is recorded and connected on the next
    /// foreground transition.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Validation`] for an empty target id. Connection
    /// failures are not errors of this call; they surface through the
    /// connection state and the retry machinery.
    pub async fn subscribe(&self, target: TargetId, filter: SubscriptionFilter) -> SyncResult<()> {
        if target.as_str().is_empty() {
            return Err(SyncError::validation("target id must not be empty"));
        }

        let suspended = self.suspended.load(Ordering::SeqCst);
        let connect = {
            let mut targets = self.targets.write().await;
            match targets.get_mut(&target) {
                Some(entry) if entry.status == TargetStatus::Failed => {
                    info!(target = %target, "re-subscribing a failed target, retry budget restored");
                    entry.filter = filter;
                    entry.backoff.reset();
                    entry.status = if suspended {
                        TargetStatus::Suspended
                    } else {
                        TargetStatus::Connecting
                    };
                    !suspended
                }
                Some(entry) => {
                    debug!(target = %target, "already subscribed");
                    entry.filter = filter;
                    false
                }
                None => {
                    let status = if suspended {
                        TargetStatus::Suspended
                    } else {
                        TargetStatus::Connecting
                    };
                    info!(target = %target, ?filter, "subscribing");
                    targets.insert(target.clone(), TargetEntry::new(filter, status, &self.config));
                    !suspended
                }
            }
        };

        if connect {
            self.attempt_connect(&target, false).await;
        }
        Ok(())
    }

    /// Tears down the subscription for `target`. Returns `false` when the
    /// target was not subscribed. Safe to call at any lifecycle stage.
    pub async fn unsubscribe(&self, target: &TargetId) -> bool {
        let removed = {
            let mut targets = self.targets.write().await;
            targets.remove(target)
        };
        let Some(mut entry) = removed else {
            return false;
        };

        info!(target = %target, "unsubscribing");
        entry.cancel_tasks();
        if let Some(handle) = entry.handle.take() {
            if let Err(error) = self.channel_provider.close_channel(handle).await {
                warn!(target = %target, %error, "closing channel during unsubscribe failed");
            }
        }
        self.poller.stop(target).await;
        self.recompute_state().await;
        true
    }

    /// Current process-wide connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Registers a connection state listener. The listener stays active
    /// until the returned guard is dropped or [`ConnectionManager::cleanup`]
    /// runs.
    pub fn add_state_listener(&self, callback: ConnectionStateCallback) -> ListenerGuard {
        self.listeners.add(callback)
    }

    /// Whether any target is currently served by fallback polling.
    pub async fn fallback_active(&self) -> bool {
        self.poller.any_active().await
    }

    /// Lifecycle stage per subscribed target, for diagnostics.
    pub async fn target_statuses(&self) -> HashMap<TargetId, TargetStatus> {
        self.targets
            .read()
            .await
            .iter()
            .map(|(target, entry)| (target.clone(), entry.status))
            .collect()
    }

    /// Suspends all push activity when the app moves to the background.
    ///
    /// Channels are closed, retry timers and fallback sessions stop, and
    /// every subscription is parked with its filter intact. Calling this
    /// while already backgrounded is a no-op.
    pub async fn on_background(&self) {
        if self.suspended.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("app backgrounded, suspending push channels");

        let parked: Vec<(TargetId, Option<ChannelHandle>, bool)> = {
            let mut targets = self.targets.write().await;
            targets
                .iter_mut()
                .map(|(target, entry)| {
                    entry.cancel_tasks();
                    let was_active = entry.status == TargetStatus::Active;
                    let handle = entry.handle.take();
                    entry.status = TargetStatus::Suspended;
                    (target.clone(), handle, was_active)
                })
                .collect()
        };

        self.poller.stop_all().await;
        for (target, handle, was_active) in parked {
            if let Some(handle) = handle {
                if let Err(error) = self.channel_provider.close_channel(handle).await {
                    warn!(target = %target, %error, "closing channel on background failed");
                }
            }
            if was_active {
                self.monitor.record_background_disconnect();
            }
        }
        self.recompute_state().await;
    }

    /// Restores every parked subscription when the app returns to the
    /// foreground. A no-op unless [`ConnectionManager::on_background`] ran
    /// first.
    pub async fn on_foreground(&self) {
        if !self.suspended.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("app foregrounded, restoring subscriptions");

        let resume: Vec<TargetId> = {
            let mut targets = self.targets.write().await;
            targets
                .iter_mut()
                .filter(|(_, entry)| entry.status == TargetStatus::Suspended)
                .map(|(target, entry)| {
                    entry.backoff.reset();
                    entry.status = TargetStatus::Connecting;
                    target.clone()
                })
                .collect()
        };

        for target in resume {
            self.monitor.record_foreground_reconnect();
            self.attempt_connect(&target, false).await;
        }
    }

    /// Releases everything: channels, retry timers, fallback sessions,
    /// listeners, breaker states and performance counters. Safe to call
    /// more than once; `subscribe` works again afterwards.
    pub async fn cleanup(&self) {
        info!("connection manager cleanup");
        self.suspended.store(false, Ordering::SeqCst);

        let drained: Vec<(TargetId, TargetEntry)> = {
            let mut targets = self.targets.write().await;
            targets.drain().collect()
        };
        for (target, mut entry) in drained {
            entry.cancel_tasks();
            if let Some(handle) = entry.handle.take() {
                if let Err(error) = self.channel_provider.close_channel(handle).await {
                    warn!(target = %target, %error, "closing channel during cleanup failed");
                }
            }
        }

        self.poller.stop_all().await;
        self.breakers.reset().await;
        self.monitor.reset().await;
        self.set_state(ConnectionState::Disconnected).await;
        self.listeners.clear();
    }

    /// Runs one connection attempt for `target`, honoring the circuit
    /// breaker and scheduling the follow-up on failure. `probe` marks
    /// recovery trials launched from fallback mode, which return to
    /// fallback on failure instead of consuming the retry budget.
    ///
    /// Returns a boxed future because the retry and probe tasks recurse
    /// into this function, which an `async fn` cannot express.
    fn attempt_connect<'a>(
        &'a self,
        target: &'a TargetId,
        probe: bool,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            {
                let mut targets = self.targets.write().await;
                let Some(entry) = targets.get_mut(target) else {
                    return;
                };
                if self.suspended.load(Ordering::SeqCst) {
                    entry.status = TargetStatus::Suspended;
                    return;
                }
                if entry.attempt_in_flight {
                    trace!(target = %target, "connection attempt already in flight");
                    return;
                }
                entry.attempt_in_flight = true;
                entry.status = TargetStatus::Connecting;
            }
            self.recompute_state().await;

            let breaker = self.breakers.breaker_for(target).await;
            if !breaker.can_execute().await {
                let recommendation = breaker.recommendation().await;
                debug!(
                    target = %target,
                    state = %recommendation.state,
                    "breaker blocks connection attempt"
                );
                if recommendation.fallback_suggested {
                    self.engage_fallback(target).await;
                } else {
                    self.schedule_retry(target).await;
                }
                return;
            }

            let filter = {
                let targets = self.targets.read().await;
                match targets.get(target) {
                    Some(entry) => entry.filter,
                    None => return,
                }
            };

            self.monitor.record_connection_attempt();
            let channel_name = target.channel_name();
            let (events_tx, mut events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

            let handle = match self
                .channel_provider
                .open_channel(&channel_name, filter, events_tx)
                .await
            {
                Ok(handle) => handle,
                Err(error) => {
                    warn!(target = %target, %error, "opening push channel failed");
                    self.note_attempt_failure(target, &breaker, probe).await;
                    return;
                }
            };

            // Wait for the subscription acknowledgement. Data frames arriving
            // before the ack are dropped.
            let acked = loop {
                match tokio::time::timeout(self.config.ack_timeout, events_rx.recv()).await {
                    Ok(Some(ChannelEvent::Status(ChannelStatus::Subscribed))) => break true,
                    Ok(Some(ChannelEvent::Message(_))) => continue,
                    Ok(Some(ChannelEvent::Status(ChannelStatus::Closed))) | Ok(None) => {
                        warn!(target = %target, "channel closed before acknowledgement");
                        break false;
                    }
                    Err(_) => {
                        warn!(
                            target = %target,
                            waited_ms = self.config.ack_timeout.as_millis() as u64,
                            "subscription acknowledgement timed out"
                        );
                        break false;
                    }
                }
            };
            if !acked {
                if let Err(error) = self.channel_provider.close_channel(handle).await {
                    debug!(target = %target, %error, "closing unacknowledged channel failed");
                }
                self.note_attempt_failure(target, &breaker, probe).await;
                return;
            }

            breaker.on_success().await;

            let pump_token = CancellationToken::new();
            {
                let mut targets = self.targets.write().await;
                let Some(entry) = targets.get_mut(target) else {
                    // Unsubscribed during the handshake.
                    drop(targets);
                    let _ = self.channel_provider.close_channel(handle).await;
                    return;
                };
                if self.suspended.load(Ordering::SeqCst) {
                    entry.attempt_in_flight = false;
                    entry.status = TargetStatus::Suspended;
                    drop(targets);
                    let _ = self.channel_provider.close_channel(handle).await;
                    return;
                }
                entry.cancel_tasks();
                entry.attempt_in_flight = false;
                entry.backoff.reset();
                entry.status = TargetStatus::Active;
                entry.handle = Some(handle);
                entry.pump_token = Some(pump_token.clone());
            }

            self.poller.stop(target).await;
            info!(target = %target, "push channel established");
            self.recompute_state().await;

            let manager = self.clone();
            let pump_target = target.clone();
            tokio::spawn(async move {
                manager
                    .pump_events(&pump_target, &mut events_rx, pump_token)
                    .await;
            });
        })
    }

    /// Records a failed attempt and decides the follow-up: back to fallback
    /// for recovery probes, a budgeted retry otherwise.
    async fn note_attempt_failure(&self, target: &TargetId, breaker: &TargetBreaker, probe: bool) {
        breaker.on_failure().await;
        self.monitor.record_connection_failure();
        if probe {
            self.engage_fallback(target).await;
        } else {
            self.schedule_retry(target).await;
        }
    }

    /// Arms the retry timer for `target`, or marks it failed once the
    /// budget is spent. Delays stretch while battery optimization is
    /// active.
    async fn schedule_retry(&self, target: &TargetId) {
        let armed = {
            let mut targets = self.targets.write().await;
            let Some(entry) = targets.get_mut(target) else {
                return;
            };
            entry.attempt_in_flight = false;
            match entry.backoff.next_delay() {
                None => {
                    error!(
                        target = %target,
                        attempts = entry.backoff.attempts_made(),
                        "retry budget exhausted, giving up until re-subscribed"
                    );
                    entry.status = TargetStatus::Failed;
                    None
                }
                Some(mut delay) => {
                    if self.monitor.should_optimize_for_battery() {
                        delay *= self.config.battery_retry_factor;
                    }
                    if let Some(token) = entry.retry_token.take() {
                        token.cancel();
                    }
                    let token = CancellationToken::new();
                    entry.retry_token = Some(token.clone());
                    entry.status = TargetStatus::PendingRetry;
                    Some((delay, token))
                }
            }
        };
        self.recompute_state().await;

        let Some((delay, token)) = armed else {
            return;
        };
        debug!(target = %target, delay = ?delay, "reconnect scheduled");

        let manager = self.clone();
        let retry_target = target.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    manager.attempt_connect(&retry_target, false).await;
                }
            }
        });
    }

    /// Puts `target` on fallback polling and arms a recovery probe that
    /// fires when the breaker's recovery timeout elapses.
    async fn engage_fallback(&self, target: &TargetId) {
        let probe_token = CancellationToken::new();
        let filter = {
            let mut targets = self.targets.write().await;
            let Some(entry) = targets.get_mut(target) else {
                return;
            };
            entry.attempt_in_flight = false;
            entry.status = TargetStatus::Fallback;
            if let Some(token) = entry.retry_token.take() {
                token.cancel();
            }
            entry.retry_token = Some(probe_token.clone());
            entry.filter
        };

        let on_update: UpdateCallback = Arc::new(|target, records| {
            trace!(target = %target, records = records.len(), "fallback data refreshed");
        });
        if self
            .poller
            .start(
                target.clone(),
                filter,
                filter.is_high_priority(),
                on_update,
            )
            .await
        {
            info!(target = %target, "breaker open, target handed to fallback polling");
        }
        self.recompute_state().await;

        let breaker = self.breakers.breaker_for(target).await;
        let probe_after = breaker.snapshot().await.current_recovery_timeout;
        debug!(target = %target, probe_after = ?probe_after, "recovery probe armed");

        let manager = self.clone();
        let probe_target = target.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = probe_token.cancelled() => {}
                _ = tokio::time::sleep(probe_after) => {
                    manager.attempt_connect(&probe_target, true).await;
                }
            }
        });
    }

    /// Consumes channel events for one active target until the channel
    /// closes or the pump is cancelled.
    async fn pump_events(
        &self,
        target: &TargetId,
        events: &mut mpsc::Receiver<ChannelEvent>,
        token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                event = events.recv() => match event {
                    Some(ChannelEvent::Message(raw)) => self.handle_push(target, raw).await,
                    Some(ChannelEvent::Status(ChannelStatus::Subscribed)) => {}
                    Some(ChannelEvent::Status(ChannelStatus::Closed)) | None => {
                        self.handle_channel_closed(target).await;
                        return;
                    }
                },
            }
        }
    }

    /// Handles one push message: counts it, parses it, and invalidates the
    /// affected cache entries. Malformed payloads are logged and dropped.
    async fn handle_push(&self, target: &TargetId, raw: bytes::Bytes) {
        self.monitor.record_message(target, raw.len()).await;

        let message = match PushMessage::parse(&raw) {
            Ok(message) => message,
            Err(error) => {
                warn!(target = %target, %error, bytes = raw.len(), "dropping malformed push message");
                return;
            }
        };
        trace!(target = %target, kind = ?message.kind, "push message received");
        self.apply_push_invalidation(&message).await;
    }

    /// Maps a push message to cache invalidation.
    ///
    /// Schedule changes compare the start-time shift against the configured
    /// significance threshold: at or above it the tournament's schedule and
    /// assignment data is dropped wholesale, below it only the affected
    /// match. A schedule change without timestamps is treated as
    /// significant.
    async fn apply_push_invalidation(&self, message: &PushMessage) {
        let scope = TargetId::new(message.tournament.as_str());
        match message.kind {
            PushMessageKind::MatchUpdate => match &message.match_id {
                Some(match_id) => {
                    self.cache
                        .invalidate_key(&CacheKey::live_match(scope.clone(), match_id.as_str()))
                        .await;
                }
                None => {
                    self.cache
                        .invalidate_prefix(&CacheKey::class_prefix(DataClass::LiveMatch, &scope))
                        .await;
                }
            },
            PushMessageKind::ScheduleChange => {
                let delta = message.schedule_delta();
                let significant =
                    delta.is_none_or(|delta| delta >= self.config.significant_schedule_change);
                if significant {
                    let mut invalidated = self
                        .cache
                        .invalidate_prefix(&CacheKey::class_prefix(
                            DataClass::ScheduledMatch,
                            &scope,
                        ))
                        .await;
                    invalidated += self
                        .cache
                        .invalidate_prefix(&CacheKey::class_prefix(DataClass::Assignment, &scope))
                        .await;
                    info!(
                        tournament = %scope,
                        shift = ?delta,
                        invalidated,
                        "significant schedule change, dropped schedule and assignment data"
                    );
                } else if let Some(match_id) = &message.match_id {
                    self.cache
                        .invalidate_key(&CacheKey::scheduled_match(
                            scope.clone(),
                            match_id.as_str(),
                        ))
                        .await;
                } else {
                    self.cache
                        .invalidate_prefix(&CacheKey::class_prefix(
                            DataClass::ScheduledMatch,
                            &scope,
                        ))
                        .await;
                }
            }
            PushMessageKind::AssignmentChange => match &message.official_id {
                Some(official) => {
                    self.cache
                        .invalidate_key(&CacheKey::assignments(scope.clone(), official.as_str()))
                        .await;
                }
                None => {
                    self.cache
                        .invalidate_prefix(&CacheKey::class_prefix(DataClass::Assignment, &scope))
                        .await;
                }
            },
            PushMessageKind::TournamentUpdate => {
                self.cache
                    .invalidate_prefix(&CacheKey::class_prefix(DataClass::Tournament, &scope))
                    .await;
            }
        }
    }

    /// Reacts to a channel dying mid-stream: records the failure and starts
    /// the retry machinery, unless the target was unsubscribed or suspended
    /// in the meantime.
    async fn handle_channel_closed(&self, target: &TargetId) {
        {
            let mut targets = self.targets.write().await;
            let Some(entry) = targets.get_mut(target) else {
                return;
            };
            if entry.status != TargetStatus::Active {
                return;
            }
            entry.handle = None;
            entry.pump_token = None;
        }
        warn!(target = %target, "push channel closed, reconnecting");

        let breaker = self.breakers.breaker_for(target).await;
        breaker.on_failure().await;
        self.schedule_retry(target).await;
    }

    /// Folds the per-target stages into the single process-wide state.
    async fn recompute_state(&self) {
        let new_state = {
            let targets = self.targets.read().await;
            let entries = || targets.values();
            if entries().any(|e| e.status == TargetStatus::Active) {
                ConnectionState::Connected
            } else if entries().any(|e| {
                e.status == TargetStatus::Connecting && e.backoff.attempts_made() == 0
            }) {
                ConnectionState::Connecting
            } else if entries().any(|e| {
                matches!(
                    e.status,
                    TargetStatus::Connecting | TargetStatus::PendingRetry
                )
            }) {
                ConnectionState::Reconnecting
            } else if entries().any(|e| e.status == TargetStatus::Failed) {
                ConnectionState::Error
            } else {
                // No targets, all suspended, or fallback only.
                ConnectionState::Disconnected
            }
        };
        self.set_state(new_state).await;
    }

    async fn set_state(&self, new_state: ConnectionState) {
        {
            let mut state = self.state.write().await;
            if *state == new_state {
                return;
            }
            debug!(from = %*state, to = %new_state, "connection state changed");
            *state = new_state;
        }
        self.listeners.notify(new_state);
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("suspended", &self.suspended.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use serde_json::json;

    use super::*;
    use crate::{
        breaker::BreakerState,
        config::{BreakerProfile, SyncConfig},
        errors::{ChannelError, ChannelResult, ProviderResult},
        models::Record,
        sources::RemoteDataProvider,
    };

    /// Scripted push channel provider. Opens acknowledge immediately unless
    /// failures or silence are scripted; senders stay accessible so tests
    /// can inject messages and closes.
    #[derive(Default)]
    struct FakeChannel {
        next_handle: AtomicU64,
        open_calls: AtomicU64,
        fail_opens: AtomicU64,
        silent_opens: AtomicU64,
        senders: Mutex<HashMap<u64, mpsc::Sender<ChannelEvent>>>,
        closed: Mutex<Vec<u64>>,
    }

    impl FakeChannel {
        fn fail_next_opens(&self, n: u64) {
            self.fail_opens.store(n, Ordering::SeqCst);
        }

        fn silence_next_opens(&self, n: u64) {
            self.silent_opens.store(n, Ordering::SeqCst);
        }

        fn opens(&self) -> u64 {
            self.open_calls.load(Ordering::SeqCst)
        }

        fn closed_count(&self) -> usize {
            self.closed.lock().unwrap().len()
        }

        fn live_senders(&self) -> Vec<mpsc::Sender<ChannelEvent>> {
            self.senders.lock().unwrap().values().cloned().collect()
        }

        async fn push_json(&self, payload: serde_json::Value) {
            let raw = Bytes::from(serde_json::to_vec(&payload).unwrap());
            for sender in self.live_senders() {
                let _ = sender.send(ChannelEvent::Message(raw.clone())).await;
            }
        }

        async fn push_raw(&self, raw: &'static [u8]) {
            for sender in self.live_senders() {
                let _ = sender
                    .send(ChannelEvent::Message(Bytes::from_static(raw)))
                    .await;
            }
        }

        async fn close_all_channels(&self) {
            let senders: Vec<mpsc::Sender<ChannelEvent>> =
                self.senders.lock().unwrap().drain().map(|(_, s)| s).collect();
            for sender in senders {
                let _ = sender
                    .send(ChannelEvent::Status(ChannelStatus::Closed))
                    .await;
            }
        }
    }

    #[async_trait]
    impl PushChannelProvider for FakeChannel {
        async fn open_channel(
            &self,
            channel_name: &str,
            _filter: SubscriptionFilter,
            events: mpsc::Sender<ChannelEvent>,
        ) -> ChannelResult<ChannelHandle> {
            self.open_calls.fetch_add(1, Ordering::SeqCst);
            if self
                .fail_opens
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ChannelError::open_failed(channel_name, "scripted failure"));
            }

            let id = self.next_handle.fetch_add(1, Ordering::SeqCst) + 1;
            let silent = self
                .silent_opens
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if !silent {
                let _ = events
                    .send(ChannelEvent::Status(ChannelStatus::Subscribed))
                    .await;
            }
            self.senders.lock().unwrap().insert(id, events);
            Ok(ChannelHandle(id))
        }

        async fn close_channel(&self, handle: ChannelHandle) -> ChannelResult<()> {
            self.senders.lock().unwrap().remove(&handle.0);
            self.closed.lock().unwrap().push(handle.0);
            Ok(())
        }
    }

    #[derive(Default)]
    struct ScriptedData {
        calls: AtomicU64,
    }

    #[async_trait]
    impl RemoteDataProvider for ScriptedData {
        async fn fetch(
            &self,
            _target: &TargetId,
            _filter: SubscriptionFilter,
        ) -> ProviderResult<Vec<Record>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![Record::new(
                DataClass::LiveMatch,
                "m1",
                json!({"score": "1-0"}),
            )])
        }
    }

    struct Harness {
        manager: ConnectionManager,
        channel: Arc<FakeChannel>,
        data: Arc<ScriptedData>,
        cache: TieredCache,
        monitor: Arc<PerformanceMonitor>,
    }

    fn harness_with(tweak: impl FnOnce(&mut SyncConfig)) -> Harness {
        let mut config = SyncConfig::default();
        config.connection.retry_initial_delay = Duration::from_secs(1);
        config.connection.retry_max_delay = Duration::from_secs(8);
        config.connection.retry_jitter_percent = 0;
        tweak(&mut config);

        let cache = TieredCache::new(config.cache.clone(), None);
        let monitor = Arc::new(PerformanceMonitor::new(config.monitor.clone()));
        let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));
        let channel = Arc::new(FakeChannel::default());
        let data = Arc::new(ScriptedData::default());
        let poller = Arc::new(FallbackPoller::new(
            config.fallback.clone(),
            cache.clone(),
            data.clone(),
            monitor.clone(),
        ));
        let manager = ConnectionManager::new(
            config.connection.clone(),
            channel.clone(),
            cache.clone(),
            breakers,
            poller,
            monitor.clone(),
        );
        Harness {
            manager,
            channel,
            data,
            cache,
            monitor,
        }
    }

    fn harness() -> Harness {
        harness_with(|_| {})
    }

    fn t(id: &str) -> TargetId {
        TargetId::new(id)
    }

    async fn wait_ms(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_opens_one_channel_and_connects() {
        let h = harness();
        h.manager
            .subscribe(t("t1"), SubscriptionFilter::All)
            .await
            .unwrap();

        assert_eq!(h.channel.opens(), 1);
        assert_eq!(h.manager.connection_state().await, ConnectionState::Connected);
        assert_eq!(
            h.manager.target_statuses().await.get(&t("t1")),
            Some(&TargetStatus::Active)
        );
        assert_eq!(h.monitor.metrics().await.connection_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribing_is_a_noop() {
        let h = harness();
        h.manager
            .subscribe(t("t1"), SubscriptionFilter::All)
            .await
            .unwrap();
        h.manager
            .subscribe(t("t1"), SubscriptionFilter::All)
            .await
            .unwrap();

        assert_eq!(h.channel.opens(), 1);
        assert_eq!(h.manager.connection_state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn empty_target_id_is_rejected() {
        let h = harness();
        let result = h.manager.subscribe(t(""), SubscriptionFilter::All).await;
        assert!(matches!(result, Err(SyncError::Validation { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_open_retries_after_backoff() {
        let h = harness();
        h.channel.fail_next_opens(1);
        h.manager
            .subscribe(t("t1"), SubscriptionFilter::All)
            .await
            .unwrap();

        assert_eq!(h.channel.opens(), 1);
        assert_eq!(
            h.manager.connection_state().await,
            ConnectionState::Reconnecting
        );

        // First retry is due after the 1s initial delay.
        wait_ms(1_100).await;
        assert_eq!(h.channel.opens(), 2);
        assert_eq!(h.manager.connection_state().await, ConnectionState::Connected);
        assert_eq!(h.monitor.metrics().await.connection_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_channel_times_out_and_retries() {
        let h = harness();
        h.channel.silence_next_opens(1);
        h.manager
            .subscribe(t("t1"), SubscriptionFilter::All)
            .await
            .unwrap();

        // The unacknowledged channel was closed and an attempt failure
        // recorded.
        assert_eq!(h.channel.closed_count(), 1);
        assert_eq!(
            h.manager.connection_state().await,
            ConnectionState::Reconnecting
        );

        wait_ms(1_100).await;
        assert_eq!(h.channel.opens(), 2);
        assert_eq!(h.manager.connection_state().await, ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn push_invalidates_updated_live_match_only() {
        let h = harness();
        h.manager
            .subscribe(t("t1"), SubscriptionFilter::All)
            .await
            .unwrap();

        h.cache
            .set(&CacheKey::live_match("t1", "m7"), json!({"score": "3-2"}))
            .await;
        h.cache
            .set(&CacheKey::live_match("t1", "m8"), json!({"score": "0-0"}))
            .await;

        h.channel
            .push_json(json!({
                "kind": "match_update",
                "tournament": "t1",
                "match_id": "m7",
            }))
            .await;
        wait_ms(10).await;

        assert!(h.cache.get(&CacheKey::live_match("t1", "m7")).await.is_none());
        assert!(h.cache.get(&CacheKey::live_match("t1", "m8")).await.is_some());
        assert_eq!(h.monitor.metrics().await.messages_received, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn significant_schedule_change_drops_schedule_and_assignments() {
        let h = harness();
        h.manager
            .subscribe(t("t1"), SubscriptionFilter::All)
            .await
            .unwrap();

        h.cache
            .set(&CacheKey::scheduled_match("t1", "m1"), json!({"court": 1}))
            .await;
        h.cache
            .set(&CacheKey::scheduled_match("t1", "m2"), json!({"court": 2}))
            .await;
        h.cache
            .set(&CacheKey::assignments("t1", "o1"), json!(["m1"]))
            .await;
        h.cache
            .set(&CacheKey::tournament_summary("t1"), json!({"name": "Open"}))
            .await;

        // 45 minute shift, above the 30 minute threshold.
        h.channel
            .push_json(json!({
                "kind": "schedule_change",
                "tournament": "t1",
                "match_id": "m1",
                "old_start": "2026-06-01T10:00:00Z",
                "new_start": "2026-06-01T10:45:00Z",
            }))
            .await;
        wait_ms(10).await;

        assert!(h.cache.get(&CacheKey::scheduled_match("t1", "m1")).await.is_none());
        assert!(h.cache.get(&CacheKey::scheduled_match("t1", "m2")).await.is_none());
        assert!(h.cache.get(&CacheKey::assignments("t1", "o1")).await.is_none());
        assert!(h.cache.get(&CacheKey::tournament_summary("t1")).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn minor_schedule_change_drops_only_the_affected_match() {
        let h = harness();
        h.manager
            .subscribe(t("t1"), SubscriptionFilter::All)
            .await
            .unwrap();

        h.cache
            .set(&CacheKey::scheduled_match("t1", "m1"), json!({"court": 1}))
            .await;
        h.cache
            .set(&CacheKey::scheduled_match("t1", "m2"), json!({"court": 2}))
            .await;

        // 10 minute shift, below the 30 minute threshold.
        h.channel
            .push_json(json!({
                "kind": "schedule_change",
                "tournament": "t1",
                "match_id": "m1",
                "old_start": "2026-06-01T10:00:00Z",
                "new_start": "2026-06-01T10:10:00Z",
            }))
            .await;
        wait_ms(10).await;

        assert!(h.cache.get(&CacheKey::scheduled_match("t1", "m1")).await.is_none());
        assert!(h.cache.get(&CacheKey::scheduled_match("t1", "m2")).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_push_is_counted_and_dropped() {
        let h = harness();
        h.manager
            .subscribe(t("t1"), SubscriptionFilter::All)
            .await
            .unwrap();
        h.cache
            .set(&CacheKey::live_match("t1", "m1"), json!({"score": "1-1"}))
            .await;

        h.channel.push_raw(b"not json at all").await;
        wait_ms(10).await;

        assert_eq!(h.manager.connection_state().await, ConnectionState::Connected);
        assert!(h.cache.get(&CacheKey::live_match("t1", "m1")).await.is_some());
        assert_eq!(h.monitor.metrics().await.messages_received, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_channel_reconnects() {
        let h = harness();
        h.manager
            .subscribe(t("t1"), SubscriptionFilter::All)
            .await
            .unwrap();

        h.channel.close_all_channels().await;
        wait_ms(10).await;
        assert_eq!(
            h.manager.connection_state().await,
            ConnectionState::Reconnecting
        );

        wait_ms(1_100).await;
        assert_eq!(h.channel.opens(), 2);
        assert_eq!(h.manager.connection_state().await, ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retry_budget_fails_until_resubscribed() {
        let h = harness_with(|config| {
            config.connection.retry_budget = 2;
            // Keep the breaker out of the way of the budget behavior.
            config.breaker.global.failure_threshold = 10;
        });
        h.channel.fail_next_opens(3);
        h.manager
            .subscribe(t("t1"), SubscriptionFilter::All)
            .await
            .unwrap();

        // Initial attempt fails, then retries at +1s and +3s spend the
        // budget of two.
        wait_ms(3_200).await;
        assert_eq!(h.channel.opens(), 3);
        assert_eq!(h.manager.connection_state().await, ConnectionState::Error);
        assert_eq!(
            h.manager.target_statuses().await.get(&t("t1")),
            Some(&TargetStatus::Failed)
        );

        // No further automatic attempts.
        wait_ms(30_000).await;
        assert_eq!(h.channel.opens(), 3);

        // A fresh subscribe restores the budget and reconnects.
        h.manager
            .subscribe(t("t1"), SubscriptionFilter::All)
            .await
            .unwrap();
        assert_eq!(h.channel.opens(), 4);
        assert_eq!(h.manager.connection_state().await, ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_hands_target_to_fallback_and_recovers() {
        let h = harness_with(|config| {
            config.breaker.global = BreakerProfile {
                failure_threshold: 2,
                success_threshold: 1,
                recovery_timeout: Duration::from_secs(5),
                max_recovery_timeout: Duration::from_secs(60),
            };
            config.connection.retry_budget = 10;
        });
        h.channel.fail_next_opens(2);
        h.manager
            .subscribe(t("t1"), SubscriptionFilter::All)
            .await
            .unwrap();

        // Two failures (t0 and the retry at +1s) open the breaker; the next
        // retry at +3s is blocked and hands the target to polling.
        wait_ms(3_100).await;
        assert_eq!(
            h.manager.target_statuses().await.get(&t("t1")),
            Some(&TargetStatus::Fallback)
        );
        assert!(h.manager.fallback_active().await);
        assert!(h.data.calls.load(Ordering::SeqCst) >= 1);
        assert!(h.cache.get(&CacheKey::live_match("t1", "m1")).await.is_some());

        // The recovery probe fires after the breaker's 5s recovery timeout
        // and succeeds, ending fallback mode.
        wait_ms(5_100).await;
        assert_eq!(h.channel.opens(), 3);
        assert_eq!(h.manager.connection_state().await, ConnectionState::Connected);
        assert!(!h.manager.fallback_active().await);

        let breaker = h.manager.breakers.breaker_for(&t("t1")).await;
        assert_eq!(breaker.state().await, BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn background_parks_and_foreground_restores_subscriptions() {
        let h = harness();
        h.manager
            .subscribe(t("t1"), SubscriptionFilter::All)
            .await
            .unwrap();
        h.manager
            .subscribe(t("t2"), SubscriptionFilter::LiveOnly)
            .await
            .unwrap();
        assert_eq!(h.channel.opens(), 2);

        h.manager.on_background().await;
        assert_eq!(h.channel.closed_count(), 2);
        assert_eq!(
            h.manager.connection_state().await,
            ConnectionState::Disconnected
        );
        let statuses = h.manager.target_statuses().await;
        assert!(statuses.values().all(|s| *s == TargetStatus::Suspended));
        assert_eq!(h.monitor.metrics().await.background_disconnects, 2);

        // Backgrounding again does nothing.
        h.manager.on_background().await;
        assert_eq!(h.channel.closed_count(), 2);

        h.manager.on_foreground().await;
        assert_eq!(h.channel.opens(), 4);
        assert_eq!(h.manager.connection_state().await, ConnectionState::Connected);
        assert_eq!(h.monitor.metrics().await.foreground_reconnects, 2);
        let statuses = h.manager.target_statuses().await;
        assert!(statuses.values().all(|s| *s == TargetStatus::Active));
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_while_backgrounded_connects_on_foreground() {
        let h = harness();
        h.manager.on_background().await;
        h.manager
            .subscribe(t("t1"), SubscriptionFilter::All)
            .await
            .unwrap();
        assert_eq!(h.channel.opens(), 0);

        h.manager.on_foreground().await;
        assert_eq!(h.channel.opens(), 1);
        assert_eq!(h.manager.connection_state().await, ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_closes_the_channel_and_forgets_the_target() {
        let h = harness();
        h.manager
            .subscribe(t("t1"), SubscriptionFilter::All)
            .await
            .unwrap();

        assert!(h.manager.unsubscribe(&t("t1")).await);
        assert_eq!(h.channel.closed_count(), 1);
        assert!(h.manager.target_statuses().await.is_empty());
        assert_eq!(
            h.manager.connection_state().await,
            ConnectionState::Disconnected
        );

        assert!(!h.manager.unsubscribe(&t("t1")).await);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_releases_everything_and_is_idempotent() {
        let h = harness();
        h.manager
            .subscribe(t("t1"), SubscriptionFilter::All)
            .await
            .unwrap();
        h.channel.push_json(json!({"kind": "tournament_update", "tournament": "t1"})).await;
        wait_ms(10).await;

        h.manager.cleanup().await;
        assert_eq!(h.channel.closed_count(), 1);
        assert!(h.manager.target_statuses().await.is_empty());
        assert_eq!(
            h.manager.connection_state().await,
            ConnectionState::Disconnected
        );
        let metrics = h.monitor.metrics().await;
        assert_eq!(metrics.messages_received, 0);
        assert_eq!(metrics.connection_attempts, 0);

        // A second pass must not disturb anything.
        h.manager.cleanup().await;

        // The manager is usable again afterwards.
        h.manager
            .subscribe(t("t1"), SubscriptionFilter::All)
            .await
            .unwrap();
        assert_eq!(h.manager.connection_state().await, ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn listeners_observe_transitions_until_disposed() {
        let h = harness();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let guard = {
            let seen = seen.clone();
            h.manager
                .add_state_listener(Box::new(move |state| seen.lock().unwrap().push(state)))
        };

        h.manager
            .subscribe(t("t1"), SubscriptionFilter::All)
            .await
            .unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );

        guard.dispose();
        h.manager.unsubscribe(&t("t1")).await;
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn battery_optimization_stretches_retry_delays() {
        let h = harness();
        // Three background disconnects against zero foreground reconnects
        // trips the battery heuristic.
        h.monitor.record_background_disconnect();
        h.monitor.record_background_disconnect();
        h.monitor.record_background_disconnect();
        assert!(h.monitor.should_optimize_for_battery());

        h.channel.fail_next_opens(1);
        h.manager
            .subscribe(t("t1"), SubscriptionFilter::All)
            .await
            .unwrap();
        assert_eq!(h.channel.opens(), 1);

        // The 1s delay is doubled by the battery retry factor.
        wait_ms(1_500).await;
        assert_eq!(h.channel.opens(), 1);
        wait_ms(700).await;
        assert_eq!(h.channel.opens(), 2);
    }
}
