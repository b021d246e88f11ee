//! Durable storage for serialized chunk histories.

use crate::error::{StorageError, StorageResult};
use crate::traits::ObjectStore;
use bytes::Bytes;
use folio_core::{ChunkId, ProjectId};
use futures::{StreamExt, TryStreamExt, stream};
use std::sync::Arc;
use tracing::instrument;

/// Stores one JSON history document per `(project, chunk)`.
#[derive(Clone)]
pub struct HistoryStore {
    store: Arc<dyn ObjectStore>,
    concurrency: usize,
}

impl HistoryStore {
    pub fn new(store: Arc<dyn ObjectStore>, concurrency: usize) -> Self {
        Self {
            store,
            concurrency: concurrency.max(1),
        }
    }

    /// Object key for a chunk's history.
    pub fn key(project_id: &ProjectId, chunk_id: &ChunkId) -> String {
        format!("projects/{project_id}/chunks/{chunk_id}")
    }

    #[instrument(skip(self, raw), fields(project_id = %project_id, chunk_id = %chunk_id))]
    pub async fn store_raw(
        &self,
        project_id: &ProjectId,
        chunk_id: &ChunkId,
        raw: &serde_json::Value,
    ) -> StorageResult<()> {
        let key = Self::key(project_id, chunk_id);
        let body = serde_json::to_vec(raw).map_err(|e| StorageError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        self.store.put(&key, Bytes::from(body)).await
    }

    #[instrument(skip(self), fields(project_id = %project_id, chunk_id = %chunk_id))]
    pub async fn load_raw(
        &self,
        project_id: &ProjectId,
        chunk_id: &ChunkId,
    ) -> StorageResult<serde_json::Value> {
        let key = Self::key(project_id, chunk_id);
        let body = self.store.get(&key).await?;
        serde_json::from_slice(&body).map_err(|e| StorageError::Corrupt {
            key,
            reason: e.to_string(),
        })
    }

    /// Delete the histories of many chunks. Already-missing objects count as
    /// deleted, so a retried batch succeeds.
    #[instrument(skip(self, chunks), fields(count = chunks.len()))]
    pub async fn delete_chunks(&self, chunks: &[(ProjectId, ChunkId)]) -> StorageResult<()> {
        stream::iter(chunks.iter().map(|(project_id, chunk_id)| async move {
            match self.store.delete(&Self::key(project_id, chunk_id)).await {
                Ok(()) => Ok(()),
                Err(e) if e.is_not_found() => Ok(()),
                Err(e) => Err(e),
            }
        }))
        .buffer_unordered(self.concurrency)
        .try_collect::<Vec<_>>()
        .await?;
        Ok(())
    }
}
