//! Core key/file store implementation.

use crate::{
    error::{KeyFileError, Result},
    naming::{decode_name, encode_key, validate_key},
};

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::fs;
use tracing::{debug, trace};

/// Statistics about the stored entries.
#[derive(Debug, Clone)]
pub struct StoreStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub root: PathBuf,
}

/// Async key/value store backed by one file per key under a single root
/// directory.
///
/// Keys are validated and percent-encoded into flat file names, so the store
/// never creates nested directories and cannot be escaped through key
/// contents. Writes are atomic: data goes to a temporary file which is then
/// renamed over the target, so readers observe either the old value or the
/// new one.
#[derive(Clone, Debug)]
pub struct KeyFileStore {
    root: PathBuf,
    tmp_counter: Arc<AtomicU64>,
}

impl KeyFileStore {
    /// Opens a store rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created or secured.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|source| KeyFileError::RootDirectory {
                path: root.clone(),
                source,
            })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o700);
            fs::set_permissions(&root, perms)
                .await
                .map_err(|source| KeyFileError::RootDirectory {
                    path: root.clone(),
                    source,
                })?;
        }

        debug!(root = %root.display(), "opened key/file store");
        Ok(Self {
            root,
            tmp_counter: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Reads the value stored under `key`, or `None` if absent.
    ///
    /// # Errors
    /// Returns an error if the key is invalid or the read fails for a reason
    /// other than the file being absent.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        let path = self.path_for(key);
        match fs::read(&path).await {
            Ok(bytes) => {
                trace!(key, bytes = bytes.len(), "store hit");
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically writes `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    /// Returns an error if the key is invalid or the write/rename fails.
    pub async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        validate_key(key)?;
        let path = self.path_for(key);
        let tmp = self.tmp_path_for(key);

        fs::write(&tmp, value).await?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            // Leave nothing half-written behind.
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        trace!(key, bytes = value.len(), "store write");
        Ok(())
    }

    /// Removes the value stored under `key`. Returns whether a value existed.
    ///
    /// # Errors
    /// Returns an error if the key is invalid or deletion fails for a reason
    /// other than the file being absent.
    pub async fn remove(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        let path = self.path_for(key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Lists all keys starting with `prefix`, in no particular order.
    ///
    /// An empty prefix lists every key. Encoding is prefix-stable, so the
    /// filter runs on encoded names and only matches are decoded.
    ///
    /// # Errors
    /// Returns an error if the prefix is malformed or the directory cannot
    /// be read.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        if prefix.contains('\0') {
            return Err(KeyFileError::invalid_key(prefix, "prefix contains null bytes"));
        }
        let encoded_prefix = encode_key(prefix);

        let mut keys = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            // Temporary files from in-flight writes are dot-prefixed.
            if name.starts_with('.') {
                continue;
            }
            if name.starts_with(encoded_prefix.as_str()) {
                keys.push(decode_name(name)?);
            }
        }
        Ok(keys)
    }

    /// Returns entry count and total size of all stored values.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be read.
    pub async fn stats(&self) -> Result<StoreStats> {
        let mut entries = 0usize;
        let mut total_bytes = 0u64;

        let mut dir = fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name();
            if name.to_str().is_some_and(|n| n.starts_with('.')) {
                continue;
            }
            entries += 1;
            total_bytes += entry.metadata().await?.len();
        }

        Ok(StoreStats {
            entries,
            total_bytes,
            root: self.root.clone(),
        })
    }

    /// Root directory this store operates in.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(encode_key(key))
    }

    fn tmp_path_for(&self, key: &str) -> PathBuf {
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        self.root.join(format!(".{}.tmp{n}", encode_key(key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    async fn open_temp() -> (tempfile::TempDir, KeyFileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = assert_ok!(KeyFileStore::open(dir.path()).await);
        (dir, store)
    }

    #[tokio::test]
    async fn set_get_remove_round_trip() {
        let (_dir, store) = open_temp().await;

        assert_eq!(store.get("live/t1/m1").await.unwrap(), None);

        store.set("live/t1/m1", b"first").await.unwrap();
        assert_eq!(store.get("live/t1/m1").await.unwrap().as_deref(), Some(&b"first"[..]));

        assert!(store.remove("live/t1/m1").await.unwrap());
        assert!(!store.remove("live/t1/m1").await.unwrap());
        assert_eq!(store.get("live/t1/m1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn overwrite_replaces_value() {
        let (_dir, store) = open_temp().await;

        store.set("tournament/t1/summary", b"v1").await.unwrap();
        store.set("tournament/t1/summary", b"v2").await.unwrap();
        assert_eq!(
            store.get("tournament/t1/summary").await.unwrap().as_deref(),
            Some(&b"v2"[..])
        );

        // The atomic write path must not leave temp files around.
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn list_filters_by_prefix() {
        let (_dir, store) = open_temp().await;

        store.set("live/t1/m1", b"a").await.unwrap();
        store.set("live/t1/m2", b"b").await.unwrap();
        store.set("live/t2/m1", b"c").await.unwrap();
        store.set("schedule/t1/m1", b"d").await.unwrap();

        let mut t1_live = store.list("live/t1/").await.unwrap();
        t1_live.sort();
        assert_eq!(t1_live, vec!["live/t1/m1", "live/t1/m2"]);

        let all = store.list("").await.unwrap();
        assert_eq!(all.len(), 4);

        assert!(store.list("finished/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_invalid_keys() {
        let (_dir, store) = open_temp().await;

        assert!(store.get("").await.is_err());
        assert!(store.set("bad\0key", b"x").await.is_err());
        assert!(store.remove("").await.is_err());
    }

    #[tokio::test]
    async fn keys_with_separators_stay_flat() {
        let (dir, store) = open_temp().await;

        store.set("a/b/../c", b"x").await.unwrap();
        assert_eq!(store.get("a/b/../c").await.unwrap().as_deref(), Some(&b"x"[..]));

        // Nothing may be created outside the root or in subdirectories.
        let mut entries = std::fs::read_dir(dir.path()).unwrap();
        assert!(entries.all(|e| e.unwrap().file_type().unwrap().is_file()));
    }

    #[tokio::test]
    async fn stats_counts_entries_and_bytes() {
        let (_dir, store) = open_temp().await;

        store.set("k1", b"12345").await.unwrap();
        store.set("k2", b"123").await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.total_bytes, 8);
    }
}
