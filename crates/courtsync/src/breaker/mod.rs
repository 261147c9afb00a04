//! Per-target circuit breakers guarding push channel connection attempts.
//!
//! Each subscription target gets its own breaker so one tournament's broken
//! stream cannot block the others. The breaker never executes anything
//! itself: callers ask [`TargetBreaker::can_execute`] before an attempt and
//! report the outcome through [`TargetBreaker::on_success`] /
//! [`TargetBreaker::on_failure`].

pub mod registry;

pub use registry::BreakerRegistry;

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::BreakerProfile;
use crate::models::TargetId;

/// Breaker state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Attempts flow normally.
    Closed,
    /// Attempts are refused until the recovery timeout elapses.
    Open,
    /// One trial attempt at a time is admitted.
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Side-effect-free advice for the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerRecommendation {
    /// Whether a call to `can_execute` would currently be granted.
    pub allow: bool,
    /// Whether the caller should line up fallback polling: the breaker is
    /// open, or one more failure would open it.
    pub fallback_suggested: bool,
    pub state: BreakerState,
}

/// Diagnostic snapshot of one breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub current_recovery_timeout: Duration,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    /// Consecutive failures; reset by any success.
    failure_count: u32,
    /// Consecutive half-open trial successes.
    success_count: u32,
    /// Set whenever the breaker (re)opens.
    opened_at: Option<Instant>,
    /// Doubles on each failed half-open trial, capped by the profile;
    /// reset to the profile base when the breaker closes.
    current_recovery_timeout: Duration,
    /// A half-open trial has been admitted and not yet resolved.
    trial_in_flight: bool,
    total_calls: u64,
    successful_calls: u64,
    failed_calls: u64,
}

/// Circuit breaker for one subscription target.
#[derive(Debug)]
pub struct TargetBreaker {
    target: TargetId,
    profile: BreakerProfile,
    inner: Arc<RwLock<BreakerInner>>,
}

impl TargetBreaker {
    pub fn new(target: TargetId, profile: BreakerProfile) -> Self {
        let recovery_timeout = profile.recovery_timeout;
        Self {
            target,
            profile,
            inner: Arc::new(RwLock::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
                current_recovery_timeout: recovery_timeout,
                trial_in_flight: false,
                total_calls: 0,
                successful_calls: 0,
                failed_calls: 0,
            })),
        }
    }

    /// Asks whether a connection attempt may proceed now.
    ///
    /// An `Open` breaker whose recovery timeout has elapsed transitions to
    /// `HalfOpen` here and admits the caller as the single trial. While a
    /// trial is unresolved every other caller is refused.
    pub async fn can_execute(&self) -> bool {
        let mut inner = self.inner.write().await;
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed_enough = inner
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= inner.current_recovery_timeout);
                if elapsed_enough {
                    info!(target = %self.target, "circuit breaker admitting trial, Open -> HalfOpen");
                    inner.state = BreakerState::HalfOpen;
                    inner.success_count = 0;
                    inner.trial_in_flight = true;
                    true
                } else {
                    debug!(target = %self.target, "circuit breaker open, refusing attempt");
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    debug!(target = %self.target, "trial already in flight, refusing attempt");
                    false
                } else {
                    inner.trial_in_flight = true;
                    true
                }
            }
        }
    }

    /// Records a successful attempt.
    pub async fn on_success(&self) {
        let mut inner = self.inner.write().await;
        inner.total_calls += 1;
        inner.successful_calls += 1;
        inner.failure_count = 0;

        match inner.state {
            BreakerState::Closed => {}
            BreakerState::HalfOpen => {
                inner.trial_in_flight = false;
                inner.success_count += 1;
                if inner.success_count >= self.profile.success_threshold {
                    info!(target = %self.target, "circuit breaker HalfOpen -> Closed");
                    inner.state = BreakerState::Closed;
                    inner.success_count = 0;
                    inner.opened_at = None;
                    inner.current_recovery_timeout = self.profile.recovery_timeout;
                }
            }
            BreakerState::Open => {
                // A success reported while open means the caller bypassed
                // the gate; take the good news and close.
                warn!(target = %self.target, "success reported while Open, closing breaker");
                inner.state = BreakerState::Closed;
                inner.success_count = 0;
                inner.opened_at = None;
                inner.current_recovery_timeout = self.profile.recovery_timeout;
            }
        }
    }

    /// Records a failed attempt.
    pub async fn on_failure(&self) {
        let mut inner = self.inner.write().await;
        inner.total_calls += 1;
        inner.failed_calls += 1;
        inner.success_count = 0;
        inner.failure_count += 1;

        match inner.state {
            BreakerState::Closed => {
                if inner.failure_count >= self.profile.failure_threshold {
                    warn!(
                        target = %self.target,
                        failures = inner.failure_count,
                        "circuit breaker opening after consecutive failures"
                    );
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            BreakerState::HalfOpen => {
                let doubled = (inner.current_recovery_timeout * 2)
                    .min(self.profile.max_recovery_timeout);
                warn!(
                    target = %self.target,
                    next_recovery = ?doubled,
                    "trial failed, circuit breaker HalfOpen -> Open"
                );
                inner.trial_in_flight = false;
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.current_recovery_timeout = doubled;
            }
            BreakerState::Open => {
                inner.opened_at = Some(Instant::now());
            }
        }
    }

    /// Current state, without side effects.
    pub async fn state(&self) -> BreakerState {
        self.inner.read().await.state
    }

    /// Side-effect-free preview of the gate plus fallback advice.
    pub async fn recommendation(&self) -> BreakerRecommendation {
        let inner = self.inner.read().await;
        let allow = match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => inner
                .opened_at
                .is_some_and(|at| at.elapsed() >= inner.current_recovery_timeout),
            BreakerState::HalfOpen => !inner.trial_in_flight,
        };
        let fallback_suggested = matches!(inner.state, BreakerState::Open)
            || inner.failure_count + 1 >= self.profile.failure_threshold;
        BreakerRecommendation {
            allow,
            fallback_suggested,
            state: inner.state,
        }
    }

    /// Diagnostic snapshot.
    pub async fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.read().await;
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.failure_count,
            total_calls: inner.total_calls,
            successful_calls: inner.successful_calls,
            failed_calls: inner.failed_calls,
            current_recovery_timeout: inner.current_recovery_timeout,
        }
    }
}
