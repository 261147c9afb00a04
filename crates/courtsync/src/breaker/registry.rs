//! Lazy per-target breaker registry.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::breaker::{BreakerSnapshot, TargetBreaker};
use crate::config::CircuitBreakerConfig;
use crate::models::TargetId;

/// Hands out circuit breakers per subscription target, creating them on
/// first use from the configured profile (exact target-id override when
/// present, otherwise the global profile).
pub struct BreakerRegistry {
    config: CircuitBreakerConfig,
    active: Arc<RwLock<HashMap<TargetId, Arc<TargetBreaker>>>>,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            active: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Gets or creates the breaker for `target`.
    pub async fn breaker_for(&self, target: &TargetId) -> Arc<TargetBreaker> {
        {
            let active = self.active.read().await;
            if let Some(breaker) = active.get(target) {
                return breaker.clone();
            }
        }

        let mut active = self.active.write().await;
        // Another caller may have won the race between locks.
        if let Some(breaker) = active.get(target) {
            return breaker.clone();
        }

        let profile = self.config.profile_for(target.as_str()).clone();
        info!(target = %target, ?profile, "creating circuit breaker");
        let breaker = Arc::new(TargetBreaker::new(target.clone(), profile));
        active.insert(target.clone(), breaker.clone());
        breaker
    }

    /// Diagnostic snapshot of every active breaker.
    pub async fn snapshot_all(&self) -> HashMap<TargetId, BreakerSnapshot> {
        let active = self.active.read().await;
        let mut snapshots = HashMap::with_capacity(active.len());
        for (target, breaker) in active.iter() {
            snapshots.insert(target.clone(), breaker.snapshot().await);
        }
        snapshots
    }

    /// Drops every breaker; the next `breaker_for` starts from a clean
    /// Closed state. Used by cleanup.
    pub async fn reset(&self) {
        self.active.write().await.clear();
    }
}
