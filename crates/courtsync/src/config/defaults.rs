/// Configuration default values
///
/// This module contains all the default values for configuration options,
/// making them easily changeable in one central location.
// Cache defaults
pub const DEFAULT_MEMORY_CAPACITY: usize = 512;
pub const DEFAULT_LIVE_MATCH_TTL_SECS: u64 = 30;
pub const DEFAULT_SCHEDULED_MATCH_TTL_SECS: u64 = 5 * 60;
pub const DEFAULT_FINISHED_MATCH_TTL_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_TOURNAMENT_TTL_SECS: u64 = 60 * 60;
pub const DEFAULT_ASSIGNMENT_TTL_SECS: u64 = 2 * 60;
pub const DEFAULT_SWEEP_ENABLED: bool = true;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 5 * 60;

// Connection defaults
pub const DEFAULT_ACK_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_RETRY_INITIAL_DELAY_MS: u64 = 1_000;
pub const DEFAULT_RETRY_MAX_DELAY_SECS: u64 = 30;
pub const DEFAULT_RETRY_JITTER_PERCENT: u8 = 25;
pub const DEFAULT_RETRY_BUDGET: u32 = 8;
pub const DEFAULT_SIGNIFICANT_SCHEDULE_CHANGE_SECS: u64 = 30 * 60;
pub const DEFAULT_BATTERY_RETRY_FACTOR: u32 = 2;

// Circuit breaker defaults
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_SUCCESS_THRESHOLD: u32 = 1;
pub const DEFAULT_RECOVERY_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_RECOVERY_TIMEOUT_SECS: u64 = 5 * 60;

// Fallback polling defaults
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_HIGH_PRIORITY_POLL_INTERVAL_SECS: u64 = 15;
pub const DEFAULT_BATTERY_STRETCH_FACTOR: u32 = 2;

// Performance monitor defaults
pub const DEFAULT_BATTERY_MIN_BACKGROUND_DISCONNECTS: u64 = 3;
pub const DEFAULT_BATTERY_BACKGROUND_RATIO: f64 = 2.0;
