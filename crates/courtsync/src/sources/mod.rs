//! Remote interface seams.
//!
//! Everything the subsystem needs from the outside world comes through the
//! traits in this module: a push channel backend, a pull-based data
//! provider, and (in [`crate::storage`]) a persistent store. The concrete
//! wire protocol stays behind these seams, so tests and alternative
//! backends plug in without touching the core.

pub mod traits;

pub use traits::{
    ChannelEvent, ChannelHandle, ChannelStatus, PushChannelProvider, RemoteDataProvider,
};
