//! # Key/File Store
//!
//! An async key/value store that keeps one file per key under a single root
//! directory.
//!
//! Keys are arbitrary strings (length-capped, no null bytes) and are
//! percent-encoded into flat file names, so key contents can never address
//! anything outside the root directory. Writes go through a temporary file
//! followed by a rename, which makes every `set` atomic with respect to
//! concurrent readers. Because the encoding is prefix-stable, keys can be
//! listed by string prefix without decoding the whole directory.
//!
//! ## Usage
//!
//! ```rust
//! use keyfile_store::KeyFileStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = KeyFileStore::open("/var/cache/myapp/kv").await?;
//!
//! store.set("live/t1/m42", br#"{"score":"15-12"}"#).await?;
//! let value = store.get("live/t1/m42").await?;
//! let live_t1 = store.list("live/t1/").await?;
//! store.remove("live/t1/m42").await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod naming;
pub mod store;

pub use error::{KeyFileError, Result};
pub use store::{KeyFileStore, StoreStats};
