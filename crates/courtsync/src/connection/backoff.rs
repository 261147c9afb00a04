//! Reconnect delay schedule with jitter.
//!
//! Delays double per attempt from the configured initial value up to the
//! configured maximum, with pseudo-random jitter subtracted so a fleet of
//! clients recovering from the same outage does not reconnect in lockstep.
//! Jitter uses system time rather than an external random source.

use std::time::Duration;

use crate::config::ConnectionConfig;

/// Pseudo-random value in `0..=max` derived from the system clock.
fn jitter_within(max: u64) -> u64 {
    if max == 0 {
        return 0;
    }
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    (nanos % (max as u128 + 1)) as u64
}

/// Jitter as a percentage of `base_ms`: a value in `0..=base_ms*percent/100`.
fn jitter_percent(base_ms: u64, percent: u8) -> u64 {
    if percent == 0 || base_ms == 0 {
        return 0;
    }
    jitter_within(base_ms.saturating_mul(percent as u64) / 100)
}

/// Retry delay generator for one subscription target.
///
/// Each call to [`ReconnectBackoff::next_delay`] consumes one unit of the
/// retry budget; `None` means the budget is exhausted and automatic
/// reconnection must stop. [`ReconnectBackoff::reset`] restores the full
/// budget after a successful connection or an explicit re-subscribe.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    jitter: u8,
    budget: u32,
    attempts_made: u32,
}

impl ReconnectBackoff {
    pub fn new(config: &ConnectionConfig) -> Self {
        Self {
            initial_delay: config.retry_initial_delay,
            max_delay: config.retry_max_delay,
            jitter: config.retry_jitter_percent,
            budget: config.retry_budget,
            attempts_made: 0,
        }
    }

    /// Next retry delay, or `None` once the budget is spent.
    ///
    /// The delay for attempt `n` is `initial * 2^n` capped at the maximum,
    /// minus up to `jitter` percent of itself.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts_made >= self.budget {
            return None;
        }

        let exponent = self.attempts_made.min(20);
        self.attempts_made += 1;

        let initial_ms = u64::try_from(self.initial_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);
        let base_ms = initial_ms.saturating_mul(1u64 << exponent).min(max_ms);

        let delay_ms = base_ms.saturating_sub(jitter_percent(base_ms, self.jitter));
        Some(Duration::from_millis(delay_ms))
    }

    /// Restores the full retry budget and the initial delay.
    pub fn reset(&mut self) {
        self.attempts_made = 0;
    }

    #[must_use]
    pub fn attempts_made(&self) -> u32 {
        self.attempts_made
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.attempts_made >= self.budget
    }
}
