use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::PathBuf, time::Duration};

pub mod defaults;
pub mod duration_serde;

use defaults::*;

use crate::models::DataClass;

/// Cache tier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of entries held in the in-memory tier
    #[serde(default = "default_memory_capacity")]
    pub memory_capacity: usize,

    /// Root directory for the persistent tier. When unset and no custom
    /// store is supplied, the cache runs memory-only.
    pub persistent_dir: Option<PathBuf>,

    /// Freshness window for live match data
    #[serde(default = "default_live_match_ttl", with = "duration_serde::duration")]
    pub live_match_ttl: Duration,

    /// Freshness window for scheduled match data
    #[serde(
        default = "default_scheduled_match_ttl",
        with = "duration_serde::duration"
    )]
    pub scheduled_match_ttl: Duration,

    /// Freshness window for finished match data
    #[serde(
        default = "default_finished_match_ttl",
        with = "duration_serde::duration"
    )]
    pub finished_match_ttl: Duration,

    /// Freshness window for tournament metadata
    #[serde(default = "default_tournament_ttl", with = "duration_serde::duration")]
    pub tournament_ttl: Duration,

    /// Freshness window for officiating assignments
    #[serde(default = "default_assignment_ttl", with = "duration_serde::duration")]
    pub assignment_ttl: Duration,

    /// Whether the periodic stale-entry sweep task runs
    #[serde(default = "default_sweep_enabled")]
    pub sweep_enabled: bool,

    /// Interval between sweep runs
    #[serde(default = "default_sweep_interval", with = "duration_serde::duration")]
    pub sweep_interval: Duration,
}

impl CacheConfig {
    /// TTL for one data class.
    #[must_use]
    pub fn ttl_for(&self, class: DataClass) -> Duration {
        match class {
            DataClass::LiveMatch => self.live_match_ttl,
            DataClass::ScheduledMatch => self.scheduled_match_ttl,
            DataClass::FinishedMatch => self.finished_match_ttl,
            DataClass::Tournament => self.tournament_ttl,
            DataClass::Assignment => self.assignment_ttl,
        }
    }
}

/// Push channel connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// How long to wait for a subscription acknowledgement before treating
    /// the attempt as failed
    #[serde(default = "default_ack_timeout", with = "duration_serde::duration")]
    pub ack_timeout: Duration,

    /// First reconnect delay; doubles on every subsequent attempt
    #[serde(
        default = "default_retry_initial_delay",
        with = "duration_serde::duration"
    )]
    pub retry_initial_delay: Duration,

    /// Upper bound for the reconnect delay
    #[serde(default = "default_retry_max_delay", with = "duration_serde::duration")]
    pub retry_max_delay: Duration,

    /// Jitter applied around each reconnect delay, as a percentage of the
    /// delay. Spreads reconnection attempts of many clients after a shared
    /// outage.
    #[serde(default = "default_retry_jitter_percent")]
    pub retry_jitter_percent: u8,

    /// Reconnect attempts per subscription before giving up
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,

    /// Start-time shift at or above which a schedule change invalidates the
    /// whole tournament's schedule and assignment data instead of a single
    /// match
    #[serde(
        default = "default_significant_schedule_change",
        with = "duration_serde::duration"
    )]
    pub significant_schedule_change: Duration,

    /// Multiplier applied to reconnect delays while battery optimization is
    /// active
    #[serde(default = "default_battery_retry_factor")]
    pub battery_retry_factor: u32,
}

/// Circuit breaker profile: thresholds and recovery timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerProfile {
    /// Consecutive failures that trip the breaker open
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Consecutive half-open successes required to close again
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Time the breaker stays open before admitting a trial
    #[serde(
        default = "default_recovery_timeout",
        with = "duration_serde::duration"
    )]
    pub recovery_timeout: Duration,

    /// Cap for the recovery timeout as it doubles on failed trials
    #[serde(
        default = "default_max_recovery_timeout",
        with = "duration_serde::duration"
    )]
    pub max_recovery_timeout: Duration,
}

/// Circuit breaker configuration: one global profile plus optional
/// per-target overrides keyed by target id
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CircuitBreakerConfig {
    #[serde(default)]
    pub global: BreakerProfile,

    #[serde(default)]
    pub profiles: HashMap<String, BreakerProfile>,
}

impl CircuitBreakerConfig {
    /// Profile for one target: exact override when present, else global.
    #[must_use]
    pub fn profile_for(&self, target: &str) -> &BreakerProfile {
        self.profiles.get(target).unwrap_or(&self.global)
    }
}

/// Fallback polling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Poll interval for ordinary subscriptions
    #[serde(default = "default_poll_interval", with = "duration_serde::duration")]
    pub poll_interval: Duration,

    /// Poll interval for high-priority subscriptions (live scoring,
    /// assignment changes)
    #[serde(
        default = "default_high_priority_poll_interval",
        with = "duration_serde::duration"
    )]
    pub high_priority_poll_interval: Duration,

    /// Multiplier applied to poll intervals while battery optimization is
    /// active
    #[serde(default = "default_battery_stretch_factor")]
    pub battery_stretch_factor: u32,
}

/// Performance monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Background disconnects below this never trigger battery optimization
    #[serde(default = "default_battery_min_background_disconnects")]
    pub battery_min_background_disconnects: u64,

    /// Battery optimization triggers once background disconnects exceed
    /// foreground reconnects by this ratio
    #[serde(default = "default_battery_background_ratio")]
    pub battery_background_ratio: f64,
}

/// Top-level configuration for the synchronization subsystem
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SyncConfig {
    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub fallback: FallbackConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,
}

fn default_memory_capacity() -> usize {
    DEFAULT_MEMORY_CAPACITY
}
fn default_live_match_ttl() -> Duration {
    Duration::from_secs(DEFAULT_LIVE_MATCH_TTL_SECS)
}
fn default_scheduled_match_ttl() -> Duration {
    Duration::from_secs(DEFAULT_SCHEDULED_MATCH_TTL_SECS)
}
fn default_finished_match_ttl() -> Duration {
    Duration::from_secs(DEFAULT_FINISHED_MATCH_TTL_SECS)
}
fn default_tournament_ttl() -> Duration {
    Duration::from_secs(DEFAULT_TOURNAMENT_TTL_SECS)
}
fn default_assignment_ttl() -> Duration {
    Duration::from_secs(DEFAULT_ASSIGNMENT_TTL_SECS)
}
fn default_sweep_enabled() -> bool {
    DEFAULT_SWEEP_ENABLED
}
fn default_sweep_interval() -> Duration {
    Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS)
}
fn default_ack_timeout() -> Duration {
    Duration::from_secs(DEFAULT_ACK_TIMEOUT_SECS)
}
fn default_retry_initial_delay() -> Duration {
    Duration::from_millis(DEFAULT_RETRY_INITIAL_DELAY_MS)
}
fn default_retry_max_delay() -> Duration {
    Duration::from_secs(DEFAULT_RETRY_MAX_DELAY_SECS)
}
fn default_retry_jitter_percent() -> u8 {
    DEFAULT_RETRY_JITTER_PERCENT
}
fn default_retry_budget() -> u32 {
    DEFAULT_RETRY_BUDGET
}
fn default_significant_schedule_change() -> Duration {
    Duration::from_secs(DEFAULT_SIGNIFICANT_SCHEDULE_CHANGE_SECS)
}
fn default_battery_retry_factor() -> u32 {
    DEFAULT_BATTERY_RETRY_FACTOR
}
fn default_failure_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}
fn default_success_threshold() -> u32 {
    DEFAULT_SUCCESS_THRESHOLD
}
fn default_recovery_timeout() -> Duration {
    Duration::from_secs(DEFAULT_RECOVERY_TIMEOUT_SECS)
}
fn default_max_recovery_timeout() -> Duration {
    Duration::from_secs(DEFAULT_MAX_RECOVERY_TIMEOUT_SECS)
}
fn default_poll_interval() -> Duration {
    Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS)
}
fn default_high_priority_poll_interval() -> Duration {
    Duration::from_secs(DEFAULT_HIGH_PRIORITY_POLL_INTERVAL_SECS)
}
fn default_battery_stretch_factor() -> u32 {
    DEFAULT_BATTERY_STRETCH_FACTOR
}
fn default_battery_min_background_disconnects() -> u64 {
    DEFAULT_BATTERY_MIN_BACKGROUND_DISCONNECTS
}
fn default_battery_background_ratio() -> f64 {
    DEFAULT_BATTERY_BACKGROUND_RATIO
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_capacity: default_memory_capacity(),
            persistent_dir: None,
            live_match_ttl: default_live_match_ttl(),
            scheduled_match_ttl: default_scheduled_match_ttl(),
            finished_match_ttl: default_finished_match_ttl(),
            tournament_ttl: default_tournament_ttl(),
            assignment_ttl: default_assignment_ttl(),
            sweep_enabled: default_sweep_enabled(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ack_timeout: default_ack_timeout(),
            retry_initial_delay: default_retry_initial_delay(),
            retry_max_delay: default_retry_max_delay(),
            retry_jitter_percent: default_retry_jitter_percent(),
            retry_budget: default_retry_budget(),
            significant_schedule_change: default_significant_schedule_change(),
            battery_retry_factor: default_battery_retry_factor(),
        }
    }
}

impl Default for BreakerProfile {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            recovery_timeout: default_recovery_timeout(),
            max_recovery_timeout: default_max_recovery_timeout(),
        }
    }
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            high_priority_poll_interval: default_high_priority_poll_interval(),
            battery_stretch_factor: default_battery_stretch_factor(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            battery_min_background_disconnects: default_battery_min_background_disconnects(),
            battery_background_ratio: default_battery_background_ratio(),
        }
    }
}

impl SyncConfig {
    /// Loads configuration from the file named by `COURTSYNC_CONFIG`, or
    /// `courtsync.toml` in the working directory. A missing file yields the
    /// defaults.
    pub fn load() -> Result<Self> {
        let config_file =
            std::env::var("COURTSYNC_CONFIG").unwrap_or_else(|_| "courtsync.toml".to_string());
        Self::load_from_file(&config_file)
    }

    /// Loads configuration from a specific file; a missing file yields the
    /// defaults.
    pub fn load_from_file(config_file: &str) -> Result<Self> {
        let config: Self = if std::path::Path::new(&config_file).exists() {
            let contents = std::fs::read_to_string(config_file)?;
            toml::from_str(&contents)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the subsystem cannot run with.
    pub fn validate(&self) -> Result<(), crate::errors::SyncError> {
        use crate::errors::SyncError;

        if self.cache.memory_capacity == 0 {
            return Err(SyncError::validation("cache.memory_capacity must be > 0"));
        }
        if self.connection.retry_jitter_percent > 100 {
            return Err(SyncError::validation(
                "connection.retry_jitter_percent must be <= 100",
            ));
        }
        if self.connection.retry_budget == 0 {
            return Err(SyncError::validation("connection.retry_budget must be > 0"));
        }
        if self.connection.battery_retry_factor == 0 {
            return Err(SyncError::validation(
                "connection.battery_retry_factor must be > 0",
            ));
        }
        for (name, profile) in std::iter::once(("global", &self.breaker.global)).chain(
            self.breaker
                .profiles
                .iter()
                .map(|(k, v)| (k.as_str(), v)),
        ) {
            if profile.failure_threshold == 0 {
                return Err(SyncError::validation(format!(
                    "breaker profile '{name}': failure_threshold must be > 0"
                )));
            }
            if profile.success_threshold == 0 {
                return Err(SyncError::validation(format!(
                    "breaker profile '{name}': success_threshold must be > 0"
                )));
            }
            if profile.max_recovery_timeout < profile.recovery_timeout {
                return Err(SyncError::validation(format!(
                    "breaker profile '{name}': max_recovery_timeout must be >= recovery_timeout"
                )));
            }
        }
        if self.fallback.battery_stretch_factor == 0 {
            return Err(SyncError::validation(
                "fallback.battery_stretch_factor must be > 0",
            ));
        }
        Ok(())
    }
}
