//! Core domain types shared across the synchronization subsystem.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Identifier of one subscription target (one tournament's push stream).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct TargetId(String);

impl TargetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Channel name used when opening the push channel for this target.
    #[must_use]
    pub fn channel_name(&self) -> String {
        format!("tournament:{}", self.0)
    }
}

impl std::fmt::Display for TargetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TargetId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TargetId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// What subset of a target's events a subscription asks for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionFilter {
    #[default]
    All,
    LiveOnly,
    AssignedOnly,
}

impl SubscriptionFilter {
    /// Live and assignment-scoped subscriptions get the short fallback poll
    /// interval when push delivery is down.
    #[must_use]
    pub fn is_high_priority(&self) -> bool {
        matches!(self, Self::LiveOnly | Self::AssignedOnly)
    }
}

impl std::fmt::Display for SubscriptionFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::LiveOnly => write!(f, "live_only"),
            Self::AssignedOnly => write!(f, "assigned_only"),
        }
    }
}

/// Volatility class of a cached datum. The cache derives every TTL from
/// this, callers never pass raw durations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DataClass {
    LiveMatch,
    ScheduledMatch,
    FinishedMatch,
    Tournament,
    Assignment,
}

impl DataClass {
    pub const ALL: [DataClass; 5] = [
        DataClass::LiveMatch,
        DataClass::ScheduledMatch,
        DataClass::FinishedMatch,
        DataClass::Tournament,
        DataClass::Assignment,
    ];

    /// Stable token used as the first segment of encoded cache keys.
    #[must_use]
    pub fn token(&self) -> &'static str {
        match self {
            Self::LiveMatch => "live",
            Self::ScheduledMatch => "schedule",
            Self::FinishedMatch => "finished",
            Self::Tournament => "tournament",
            Self::Assignment => "assignment",
        }
    }
}

impl std::fmt::Display for DataClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.token())
    }
}

/// Cache key: data class, owning target, item id within the target.
///
/// The encoded form is `"{class}/{target}/{item}"`. Invalidation by prefix
/// operates on this encoding, so everything belonging to one target and
/// class shares a common prefix.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub class: DataClass,
    pub scope: TargetId,
    pub item: String,
}

impl CacheKey {
    pub fn new(class: DataClass, scope: impl Into<TargetId>, item: impl Into<String>) -> Self {
        Self {
            class,
            scope: scope.into(),
            item: item.into(),
        }
    }

    pub fn live_match(target: impl Into<TargetId>, match_id: impl Into<String>) -> Self {
        Self::new(DataClass::LiveMatch, target, match_id)
    }

    pub fn scheduled_match(target: impl Into<TargetId>, match_id: impl Into<String>) -> Self {
        Self::new(DataClass::ScheduledMatch, target, match_id)
    }

    pub fn finished_match(target: impl Into<TargetId>, match_id: impl Into<String>) -> Self {
        Self::new(DataClass::FinishedMatch, target, match_id)
    }

    pub fn tournament_summary(target: impl Into<TargetId>) -> Self {
        Self::new(DataClass::Tournament, target, "summary")
    }

    pub fn assignments(target: impl Into<TargetId>, official_id: impl Into<String>) -> Self {
        Self::new(DataClass::Assignment, target, official_id)
    }

    /// Encoded form used by both cache tiers.
    #[must_use]
    pub fn encode(&self) -> String {
        format!("{}/{}/{}", self.class, self.scope, self.item)
    }

    /// Prefix covering one class of one target.
    #[must_use]
    pub fn class_prefix(class: DataClass, target: &TargetId) -> String {
        format!("{class}/{target}/")
    }

    /// Prefixes covering every class of one target.
    #[must_use]
    pub fn target_prefixes(target: &TargetId) -> Vec<String> {
        DataClass::ALL
            .iter()
            .map(|class| Self::class_prefix(*class, target))
            .collect()
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// Process-wide connection state of the push channel layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Coarse indicator shown to the user, derived from connection state and
/// fallback activity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityIndicator {
    Connected,
    Reconnecting,
    /// Push delivery is down but data keeps flowing through fallback polling.
    Degraded,
    Error,
}

impl ConnectivityIndicator {
    /// Maps connection state to an indicator. Fallback activity is judged
    /// first: polling means data still arrives, whatever the channel state.
    #[must_use]
    pub fn derive(state: ConnectionState, fallback_active: bool) -> Self {
        if fallback_active {
            return Self::Degraded;
        }
        match state {
            ConnectionState::Connected => Self::Connected,
            ConnectionState::Connecting | ConnectionState::Reconnecting => Self::Reconnecting,
            ConnectionState::Disconnected | ConnectionState::Error => Self::Error,
        }
    }
}

/// One cache-writable unit returned by the remote data provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub class: DataClass,
    pub item: String,
    pub payload: serde_json::Value,
}

impl Record {
    pub fn new(class: DataClass, item: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            class,
            item: item.into(),
            payload,
        }
    }

    /// Cache key this record lands under when fetched for `target`.
    #[must_use]
    pub fn cache_key(&self, target: &TargetId) -> CacheKey {
        CacheKey::new(self.class, target.clone(), self.item.clone())
    }
}

/// Kind of a push channel message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PushMessageKind {
    MatchUpdate,
    ScheduleChange,
    AssignmentChange,
    TournamentUpdate,
}

/// Decoded push channel message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushMessage {
    pub kind: PushMessageKind,
    pub tournament: String,
    #[serde(default)]
    pub match_id: Option<String>,
    #[serde(default)]
    pub official_id: Option<String>,
    #[serde(default)]
    pub old_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub new_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl PushMessage {
    /// Decodes a raw channel frame. Malformed frames are the caller's
    /// problem to log and drop.
    pub fn parse(raw: &Bytes) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }

    /// Absolute start-time shift carried by a schedule change, if both
    /// timestamps are present.
    #[must_use]
    pub fn schedule_delta(&self) -> Option<Duration> {
        let (old, new) = (self.old_start?, self.new_start?);
        (new - old).abs().to_std().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_encoding_groups_by_class_and_target() {
        let key = CacheKey::live_match("t-1", "m42");
        assert_eq!(key.encode(), "live/t-1/m42");

        let prefix = CacheKey::class_prefix(DataClass::LiveMatch, &TargetId::new("t-1"));
        assert!(key.encode().starts_with(&prefix));

        let other = CacheKey::live_match("t-10", "m42");
        assert!(!other.encode().starts_with(&prefix));
    }

    #[test]
    fn target_prefixes_cover_every_class() {
        let prefixes = CacheKey::target_prefixes(&TargetId::new("t-1"));
        assert_eq!(prefixes.len(), DataClass::ALL.len());
        for class in DataClass::ALL {
            let key = CacheKey::new(class, "t-1", "x");
            assert!(prefixes.iter().any(|p| key.encode().starts_with(p)));
        }
    }

    #[test]
    fn filter_priority() {
        assert!(SubscriptionFilter::LiveOnly.is_high_priority());
        assert!(SubscriptionFilter::AssignedOnly.is_high_priority());
        assert!(!SubscriptionFilter::All.is_high_priority());
    }

    #[test]
    fn push_message_parses_and_computes_delta() {
        let raw = Bytes::from_static(
            br#"{
                "kind": "schedule_change",
                "tournament": "t-1",
                "match_id": "m7",
                "old_start": "2026-08-22T10:00:00Z",
                "new_start": "2026-08-22T10:45:00Z"
            }"#,
        );
        let msg = PushMessage::parse(&raw).unwrap();
        assert_eq!(msg.kind, PushMessageKind::ScheduleChange);
        assert_eq!(msg.schedule_delta(), Some(Duration::from_secs(45 * 60)));
    }

    #[test]
    fn push_message_rejects_malformed_frames() {
        assert!(PushMessage::parse(&Bytes::from_static(b"not json")).is_err());
        assert!(PushMessage::parse(&Bytes::from_static(br#"{"kind":"bogus","tournament":"t"}"#)).is_err());
    }

    #[rstest::rstest]
    #[case(ConnectionState::Connected, false, ConnectivityIndicator::Connected)]
    #[case(ConnectionState::Connecting, false, ConnectivityIndicator::Reconnecting)]
    #[case(ConnectionState::Reconnecting, false, ConnectivityIndicator::Reconnecting)]
    #[case(ConnectionState::Disconnected, false, ConnectivityIndicator::Error)]
    #[case(ConnectionState::Error, false, ConnectivityIndicator::Error)]
    // Active fallback wins over any channel state.
    #[case(ConnectionState::Connected, true, ConnectivityIndicator::Degraded)]
    #[case(ConnectionState::Error, true, ConnectivityIndicator::Degraded)]
    fn connectivity_mapping(
        #[case] state: ConnectionState,
        #[case] fallback_active: bool,
        #[case] expected: ConnectivityIndicator,
    ) {
        assert_eq!(ConnectivityIndicator::derive(state, fallback_active), expected);
    }
}
