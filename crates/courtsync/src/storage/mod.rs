//! Persistent cache tier seam.
//!
//! The cache talks to its slow tier through [`PersistentStore`]. The default
//! implementation is [`FileStoreBackend`] over `keyfile_store`; tests swap
//! in scripted stores to exercise failure handling.

use async_trait::async_trait;

use crate::errors::{StorageError, StorageResult};

/// Persistent key/value tier under the cache.
///
/// Implementations store opaque byte values under encoded cache keys and
/// must support listing keys by string prefix, which the cache relies on
/// for prefix invalidation and sweeping.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: &[u8]) -> StorageResult<()>;

    async fn remove(&self, key: &str) -> StorageResult<()>;

    /// All stored keys starting with `prefix`, in no particular order.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;
}

/// File-per-key backend over [`keyfile_store::KeyFileStore`].
#[derive(Clone)]
pub struct FileStoreBackend {
    store: keyfile_store::KeyFileStore,
}

impl FileStoreBackend {
    /// Opens the backend rooted at `dir`, creating the directory if needed.
    pub async fn open(dir: impl Into<std::path::PathBuf>) -> StorageResult<Self> {
        let store = keyfile_store::KeyFileStore::open(dir)
            .await
            .map_err(StorageError::from)?;
        Ok(Self { store })
    }
}

#[async_trait]
impl PersistentStore for FileStoreBackend {
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        self.store.get(key).await.map_err(StorageError::from)
    }

    async fn set(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        self.store.set(key, value).await.map_err(StorageError::from)
    }

    async fn remove(&self, key: &str) -> StorageResult<()> {
        self.store.remove(key).await.map_err(StorageError::from)?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.store.list(prefix).await.map_err(StorageError::from)
    }
}
