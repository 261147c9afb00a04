//! Passive performance monitoring.
//!
//! Counters here only observe; nothing in this module ever changes
//! connection behavior. Consumers read [`PerformanceMonitor::metrics`] for
//! diagnostics and [`PerformanceMonitor::should_optimize_for_battery`] to
//! decide whether to stretch poll and retry intervals.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::config::MonitorConfig;
use crate::models::TargetId;

/// Per-target message traffic breakdown.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct TargetTraffic {
    pub messages: u64,
    pub bytes: u64,
}

/// Snapshot of all counters plus derived gauges.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceMetrics {
    pub messages_received: u64,
    pub bytes_received: u64,
    pub connection_attempts: u64,
    pub connection_failures: u64,
    pub background_disconnects: u64,
    pub foreground_reconnects: u64,
    pub fallback_polls: u64,
    /// Successful attempts over total attempts; 1.0 before any attempt.
    pub connection_success_rate: f64,
    /// Mean push message size in bytes; 0.0 before any message.
    pub average_message_size: f64,
    pub uptime: Duration,
    pub battery_optimization_active: bool,
    pub per_target: HashMap<TargetId, TargetTraffic>,
}

/// Monotonic counters for the synchronization subsystem.
///
/// All record methods are cheap atomic increments. Counters only reset on
/// an explicit [`PerformanceMonitor::reset`], which cleanup invokes.
pub struct PerformanceMonitor {
    config: MonitorConfig,
    messages_received: AtomicU64,
    bytes_received: AtomicU64,
    connection_attempts: AtomicU64,
    connection_failures: AtomicU64,
    background_disconnects: AtomicU64,
    foreground_reconnects: AtomicU64,
    fallback_polls: AtomicU64,
    per_target: RwLock<HashMap<TargetId, TargetTraffic>>,
    started_at: RwLock<Instant>,
}

impl PerformanceMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            messages_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            connection_attempts: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            background_disconnects: AtomicU64::new(0),
            foreground_reconnects: AtomicU64::new(0),
            fallback_polls: AtomicU64::new(0),
            per_target: RwLock::new(HashMap::new()),
            started_at: RwLock::new(Instant::now()),
        }
    }

    /// Records one received push message and its payload size.
    pub async fn record_message(&self, target: &TargetId, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);

        let mut per_target = self.per_target.write().await;
        let traffic = per_target.entry(target.clone()).or_default();
        traffic.messages += 1;
        traffic.bytes += bytes as u64;
    }

    pub fn record_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_failure(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// One channel suspended because the app went to the background.
    pub fn record_background_disconnect(&self) {
        self.background_disconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// One channel re-subscribed because the app returned to the foreground.
    pub fn record_foreground_reconnect(&self) {
        self.foreground_reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback_poll(&self) {
        self.fallback_polls.fetch_add(1, Ordering::Relaxed);
    }

    /// Battery heuristic: enough background disconnects have accumulated
    /// and they outnumber foreground reconnects by the configured ratio.
    /// The app is being backgrounded far more than it is used, so slower
    /// polling and retries cost little.
    pub fn should_optimize_for_battery(&self) -> bool {
        let bg = self.background_disconnects.load(Ordering::Relaxed);
        let fg = self.foreground_reconnects.load(Ordering::Relaxed);
        bg >= self.config.battery_min_background_disconnects
            && bg as f64 > fg as f64 * self.config.battery_background_ratio
    }

    /// Full snapshot with derived gauges.
    pub async fn metrics(&self) -> PerformanceMetrics {
        let messages = self.messages_received.load(Ordering::Relaxed);
        let bytes = self.bytes_received.load(Ordering::Relaxed);
        let attempts = self.connection_attempts.load(Ordering::Relaxed);
        let failures = self.connection_failures.load(Ordering::Relaxed);

        let connection_success_rate = if attempts > 0 {
            (attempts.saturating_sub(failures)) as f64 / attempts as f64
        } else {
            1.0
        };
        let average_message_size = if messages > 0 {
            bytes as f64 / messages as f64
        } else {
            0.0
        };

        PerformanceMetrics {
            messages_received: messages,
            bytes_received: bytes,
            connection_attempts: attempts,
            connection_failures: failures,
            background_disconnects: self.background_disconnects.load(Ordering::Relaxed),
            foreground_reconnects: self.foreground_reconnects.load(Ordering::Relaxed),
            fallback_polls: self.fallback_polls.load(Ordering::Relaxed),
            connection_success_rate,
            average_message_size,
            uptime: self.started_at.read().await.elapsed(),
            battery_optimization_active: self.should_optimize_for_battery(),
            per_target: self.per_target.read().await.clone(),
        }
    }

    /// Zeroes every counter. Only cleanup calls this; ordinary operation
    /// never resets.
    pub async fn reset(&self) {
        self.messages_received.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
        self.connection_attempts.store(0, Ordering::Relaxed);
        self.connection_failures.store(0, Ordering::Relaxed);
        self.background_disconnects.store(0, Ordering::Relaxed);
        self.foreground_reconnects.store(0, Ordering::Relaxed);
        self.fallback_polls.store(0, Ordering::Relaxed);
        self.per_target.write().await.clear();
        *self.started_at.write().await = Instant::now();
    }
}
