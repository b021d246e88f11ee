//! Content-addressed blob storage.

use crate::error::{StorageError, StorageResult};
use crate::traits::ObjectStore;
use bytes::Bytes;
use folio_core::ContentHash;
use futures::{StreamExt, TryStreamExt, stream};
use std::collections::HashMap;
use std::sync::Arc;

/// Stores file contents keyed by the SHA-256 of their UTF-8 bytes.
#[derive(Clone)]
pub struct BlobStore {
    store: Arc<dyn ObjectStore>,
    concurrency: usize,
}

impl BlobStore {
    pub fn new(store: Arc<dyn ObjectStore>, concurrency: usize) -> Self {
        Self {
            store,
            concurrency: concurrency.max(1),
        }
    }

    /// Object key for a blob: `blobs/ab/cd/abcd...`.
    pub fn key(hash: &ContentHash) -> String {
        let hex = hash.to_hex();
        format!("blobs/{}/{}/{}", &hex[..2], &hex[2..4], hex)
    }

    /// Store a string and return its hash. Existing blobs are not rewritten.
    pub async fn put_string(&self, content: &str) -> StorageResult<ContentHash> {
        let hash = ContentHash::compute(content.as_bytes());
        self.store
            .put_if_not_exists(&Self::key(&hash), Bytes::copy_from_slice(content.as_bytes()))
            .await?;
        Ok(hash)
    }

    /// Store many blobs with bounded concurrency.
    pub async fn put_many(&self, blobs: &[(ContentHash, &str)]) -> StorageResult<()> {
        stream::iter(blobs.iter().map(|(hash, content)| async move {
            let stored = self.put_string(content).await?;
            if stored != *hash {
                return Err(StorageError::Corrupt {
                    key: Self::key(hash),
                    reason: format!("content hashes to {stored}"),
                });
            }
            Ok::<(), StorageError>(())
        }))
        .buffer_unordered(self.concurrency)
        .try_collect::<Vec<_>>()
        .await?;
        Ok(())
    }

    /// Fetch a blob as a string.
    pub async fn get_string(&self, hash: &ContentHash) -> StorageResult<String> {
        let key = Self::key(hash);
        let data = self.store.get(&key).await?;
        String::from_utf8(data.to_vec()).map_err(|e| StorageError::Corrupt {
            key,
            reason: e.to_string(),
        })
    }

    /// A batching reader over this store.
    pub fn batch(&self) -> BatchBlobStore {
        BatchBlobStore {
            blobs: self.clone(),
            loaded: HashMap::new(),
        }
    }
}

/// Blob reader that fetches a set of hashes up front and serves them from
/// memory afterwards.
pub struct BatchBlobStore {
    blobs: BlobStore,
    loaded: HashMap<ContentHash, String>,
}

impl BatchBlobStore {
    /// Fetch every hash not already loaded.
    pub async fn preload(
        &mut self,
        hashes: impl IntoIterator<Item = ContentHash>,
    ) -> StorageResult<()> {
        let missing: Vec<ContentHash> = hashes
            .into_iter()
            .filter(|h| !self.loaded.contains_key(h))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        let blobs = &self.blobs;
        let fetched: Vec<(ContentHash, String)> = stream::iter(missing)
            .map(|hash| async move { blobs.get_string(&hash).await.map(|s| (hash, s)) })
            .buffer_unordered(blobs.concurrency)
            .try_collect()
            .await?;
        self.loaded.extend(fetched);
        Ok(())
    }

    /// Get one blob, fetching it if it was not preloaded.
    pub async fn get_string(&mut self, hash: &ContentHash) -> StorageResult<String> {
        if let Some(content) = self.loaded.get(hash) {
            return Ok(content.clone());
        }
        let content = self.blobs.get_string(hash).await?;
        self.loaded.insert(*hash, content.clone());
        Ok(content)
    }

    /// Everything loaded so far.
    pub fn loaded(&self) -> &HashMap<ContentHash, String> {
        &self.loaded
    }
}
