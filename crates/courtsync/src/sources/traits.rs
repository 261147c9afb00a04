//! Provider trait definitions.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{
    errors::{ChannelResult, ProviderResult},
    models::{Record, SubscriptionFilter, TargetId},
};

/// Lifecycle status events a channel reports alongside its payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// The backend acknowledged the subscription; events will flow.
    Subscribed,
    /// The backend closed the channel; no further events will arrive.
    Closed,
}

/// One event delivered on an open push channel.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Status(ChannelStatus),
    Message(Bytes),
}

/// Opaque handle identifying one open channel at the provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelHandle(pub u64);

/// Push channel backend.
///
/// `open_channel` starts delivery of [`ChannelEvent`]s into `events`. The
/// provider must send `Status(Subscribed)` once the backend confirms the
/// subscription and `Status(Closed)` if the channel dies. Dropping the
/// sender counts as a close.
#[async_trait]
pub trait PushChannelProvider: Send + Sync {
    /// Open a channel and begin delivering events.
    async fn open_channel(
        &self,
        channel_name: &str,
        filter: SubscriptionFilter,
        events: mpsc::Sender<ChannelEvent>,
    ) -> ChannelResult<ChannelHandle>;

    /// Close a previously opened channel. Closing an unknown handle is a
    /// no-op.
    async fn close_channel(&self, handle: ChannelHandle) -> ChannelResult<()>;
}

/// Pull-based data backend used for cache misses and fallback polling.
#[async_trait]
pub trait RemoteDataProvider: Send + Sync {
    /// Fetch the current data set for one target, honoring its filter.
    async fn fetch(
        &self,
        target: &TargetId,
        filter: SubscriptionFilter,
    ) -> ProviderResult<Vec<Record>>;
}
