//! Content-addressed block storage.
//!
//! Every durable unit of the graph — a `NodeBlock`, `RelBlock`, a
//! `GraphManifest`, a `WALEntry` — is stored as an opaque byte blob keyed by
//! its [`Cid`]: the blake3 hash of its bytes. Equal bytes always hash to
//! the same `Cid`, so `store` is naturally idempotent; a pluggable
//! [`BlockStore`] backend sits behind a fixed-capacity LRU read cache.

mod lru;

pub use lru::LruCache;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default LRU capacity.
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// A content identifier: the blake3 hash of a block's bytes, rendered as
/// lowercase hex. Equal bytes always produce an equal `Cid`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cid(String);

impl Cid {
    pub fn of(bytes: &[u8]) -> Self {
        Cid(blake3::hash(bytes).to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for Cid {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Cid(s.to_string()))
    }
}

/// Pluggable put/get backend behind the LRU cache. Implementations need
/// only guarantee durable storage of bytes by key — hashing, caching and
/// JSON convenience live in [`BlockStore`].
#[async_trait]
pub trait RawBackend: Send + Sync {
    async fn put(&self, cid: &Cid, bytes: &[u8]) -> Result<()>;
    async fn get(&self, cid: &Cid) -> Result<Option<Vec<u8>>>;
    async fn pin(&self, _cid: &Cid) -> Result<()> {
        Ok(())
    }
    async fn unpin(&self, _cid: &Cid) -> Result<()> {
        Ok(())
    }
}

/// In-process backend: a plain map, no persistence across process restarts.
#[derive(Default)]
pub struct MemoryRawBackend {
    blocks: RwLock<HashMap<Cid, Vec<u8>>>,
    pinned: RwLock<std::collections::HashSet<Cid>>,
}

impl MemoryRawBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RawBackend for MemoryRawBackend {
    async fn put(&self, cid: &Cid, bytes: &[u8]) -> Result<()> {
        self.blocks.write().entry(cid.clone()).or_insert_with(|| bytes.to_vec());
        Ok(())
    }

    async fn get(&self, cid: &Cid) -> Result<Option<Vec<u8>>> {
        Ok(self.blocks.read().get(cid).cloned())
    }

    async fn pin(&self, cid: &Cid) -> Result<()> {
        self.pinned.write().insert(cid.clone());
        Ok(())
    }

    async fn unpin(&self, cid: &Cid) -> Result<()> {
        self.pinned.write().remove(cid);
        Ok(())
    }
}

/// Filesystem backend: one file per block under `root`, named by CID.
pub struct FsRawBackend {
    root: PathBuf,
}

impl FsRawBackend {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, cid: &Cid) -> PathBuf {
        self.root.join(cid.as_str())
    }
}

#[async_trait]
impl RawBackend for FsRawBackend {
    async fn put(&self, cid: &Cid, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(cid);
        if path.exists() {
            return Ok(());
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }

    async fn get(&self, cid: &Cid) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(cid)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::from(e)),
        }
    }
}

/// CID-addressed store with an LRU read cache in front of a pluggable
/// [`RawBackend`]. The cache is a pure optimization — invariant 6 of the
/// durable layout — so every read path falls through to the backend on a
/// miss and repopulates the cache.
pub struct BlockStore {
    backend: Box<dyn RawBackend>,
    cache: Mutex<LruCache<Cid, Vec<u8>>>,
}

impl BlockStore {
    pub fn new(backend: impl RawBackend + 'static, capacity: usize) -> Self {
        Self {
            backend: Box::new(backend),
            cache: Mutex::new(LruCache::new(capacity.max(1))),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(MemoryRawBackend::new(), DEFAULT_CACHE_CAPACITY)
    }

    /// Hash + write-if-absent. Deterministic, idempotent: storing the same
    /// bytes twice returns the same `Cid` without a duplicate backend write.
    pub async fn store(&self, bytes: &[u8]) -> Result<Cid> {
        let cid = Cid::of(bytes);
        self.backend.put(&cid, bytes).await.map_err(|e| {
            Error::StorageError(format!("block store write failed: {e}"))
        })?;
        self.cache.lock().put(cid.clone(), bytes.to_vec());
        Ok(cid)
    }

    /// Cache first, then backend. Missing key fails with `NotFound`.
    pub async fn retrieve(&self, cid: &Cid) -> Result<Vec<u8>> {
        if let Some(bytes) = self.cache.lock().get(cid) {
            return Ok(bytes);
        }
        let bytes = self.backend.get(cid).await.map_err(|e| {
            Error::StorageError(format!("block store read failed: {e}"))
        })?;
        let bytes = bytes.ok_or_else(|| Error::NotFound(format!("block {cid}")))?;
        self.cache.lock().put(cid.clone(), bytes.clone());
        Ok(bytes)
    }

    pub async fn store_json<T: Serialize>(&self, value: &T) -> Result<Cid> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| Error::StorageError(format!("serialization failed: {e}")))?;
        self.store(&bytes).await
    }

    pub async fn retrieve_json<T: for<'de> Deserialize<'de>>(&self, cid: &Cid) -> Result<T> {
        let bytes = self.retrieve(cid).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::StorageError(format!("deserialization failed: {e}")))
    }

    /// Hint the backend to retain this block. Idempotent.
    pub async fn pin(&self, cid: &Cid) -> Result<()> {
        self.backend.pin(cid).await
    }

    /// Hint the backend it may release this block. Idempotent.
    pub async fn unpin(&self, cid: &Cid) -> Result<()> {
        self.backend.unpin(cid).await
    }

    pub fn cache_len(&self) -> usize {
        self.cache.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_is_idempotent() {
        let store = BlockStore::in_memory();
        let c1 = store.store(b"hello").await.unwrap();
        let c2 = store.store(b"hello").await.unwrap();
        assert_eq!(c1, c2);
    }

    #[tokio::test]
    async fn retrieve_matches_stored_bytes() {
        let store = BlockStore::in_memory();
        let cid = store.store(b"payload").await.unwrap();
        assert_eq!(store.retrieve(&cid).await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn retrieve_missing_fails() {
        let store = BlockStore::in_memory();
        let bogus = Cid::of(b"never stored");
        assert!(store.retrieve(&bogus).await.is_err());
    }

    #[tokio::test]
    async fn json_roundtrip() {
        let store = BlockStore::in_memory();
        let cid = store.store_json(&vec![1, 2, 3]).await.unwrap();
        let back: Vec<i32> = store.retrieve_json(&cid).await.unwrap();
        assert_eq!(back, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn cache_hit_equals_backend_value() {
        let store = BlockStore::new(MemoryRawBackend::new(), 2);
        let cid = store.store(b"a").await.unwrap();
        // First retrieve populates/confirms cache, second must be identical.
        let first = store.retrieve(&cid).await.unwrap();
        let second = store.retrieve(&cid).await.unwrap();
        assert_eq!(first, second);
    }
}
