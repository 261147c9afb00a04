//! Cache entry representations for both tiers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use crate::{
    errors::{StorageError, StorageResult},
    models::DataClass,
};

/// In-memory tier entry. Freshness is judged against the process clock,
/// which the tokio test runtime can pause and advance.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub payload: serde_json::Value,
    pub written_at: Instant,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn new(payload: serde_json::Value, ttl: Duration) -> Self {
        Self {
            payload,
            written_at: Instant::now(),
            ttl,
        }
    }

    #[must_use]
    pub fn is_fresh(&self) -> bool {
        self.written_at.elapsed() < self.ttl
    }
}

/// Persistent tier envelope. Carries the data class and a wall-clock write
/// timestamp so freshness survives process restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedEntry {
    pub class: DataClass,
    pub written_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl PersistedEntry {
    pub fn new(class: DataClass, payload: serde_json::Value) -> Self {
        Self {
            class,
            written_at: Utc::now(),
            payload,
        }
    }

    pub fn to_bytes(&self) -> StorageResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(StorageError::from)
    }

    pub fn from_bytes(key: &str, bytes: &[u8]) -> StorageResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| StorageError::corrupt_entry(key, e.to_string()))
    }

    /// Wall-clock age of this entry. Clock skew into the future reads as
    /// zero age.
    #[must_use]
    pub fn age(&self) -> Duration {
        (Utc::now() - self.written_at).to_std().unwrap_or_default()
    }

    #[must_use]
    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.age() < ttl
    }

    /// TTL left on this entry, used when promoting it into the memory tier
    /// so both tiers expire it at the same moment.
    #[must_use]
    pub fn remaining_ttl(&self, ttl: Duration) -> Duration {
        ttl.saturating_sub(self.age())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn memory_entry_expires_with_process_clock() {
        let entry = CacheEntry::new(serde_json::json!({"s": 1}), Duration::from_secs(30));
        assert!(entry.is_fresh());

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(entry.is_fresh());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!entry.is_fresh());
    }

    #[test]
    fn persisted_entry_round_trips() {
        let entry = PersistedEntry::new(DataClass::Tournament, serde_json::json!({"name": "Open"}));
        let bytes = entry.to_bytes().unwrap();
        let back = PersistedEntry::from_bytes("tournament/t1/summary", &bytes).unwrap();
        assert_eq!(back.payload, entry.payload);
        assert!(back.is_fresh(Duration::from_secs(3600)));
    }

    #[test]
    fn persisted_entry_ages_by_wall_clock() {
        let mut entry = PersistedEntry::new(DataClass::LiveMatch, serde_json::json!(1));
        entry.written_at = Utc::now() - chrono::Duration::seconds(45);
        assert!(!entry.is_fresh(Duration::from_secs(30)));
        assert!(entry.is_fresh(Duration::from_secs(60)));
        assert!(entry.remaining_ttl(Duration::from_secs(60)) <= Duration::from_secs(15));
    }

    #[test]
    fn corrupt_envelope_is_reported_with_its_key() {
        let err = PersistedEntry::from_bytes("live/t1/m1", b"{broken").unwrap_err();
        assert!(err.to_string().contains("live/t1/m1"));
    }
}
