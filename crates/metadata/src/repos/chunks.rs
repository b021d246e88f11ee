//! Chunk repository.

use crate::error::MetadataResult;
use crate::models::{ChunkRange, ChunkRecord, ConfirmOptions};
use async_trait::async_trait;
use folio_core::{ChunkId, ProjectId};
use time::OffsetDateTime;

/// Repository for a project's chunk index.
///
/// Only active chunks are visible through the lookup methods.
#[async_trait]
pub trait ChunkRepo: Send + Sync {
    /// The chunk with the highest end version.
    ///
    /// With `read_only`, the lookup may be served by a replica.
    async fn get_latest_chunk(
        &self,
        project_id: &ProjectId,
        read_only: bool,
    ) -> MetadataResult<Option<ChunkRecord>>;

    /// The chunk whose range contains `version`.
    async fn get_chunk_for_version(
        &self,
        project_id: &ProjectId,
        version: i64,
    ) -> MetadataResult<Option<ChunkRecord>>;

    /// The earliest chunk whose end timestamp is at or after `timestamp`, or
    /// the latest chunk if every change predates it.
    async fn get_chunk_for_timestamp(
        &self,
        project_id: &ProjectId,
        timestamp: OffsetDateTime,
    ) -> MetadataResult<Option<ChunkRecord>>;

    /// Ids of all chunks, in version order.
    async fn get_project_chunk_ids(&self, project_id: &ProjectId) -> MetadataResult<Vec<ChunkId>>;

    /// All chunks, in version order.
    async fn get_project_chunks(&self, project_id: &ProjectId) -> MetadataResult<Vec<ChunkRecord>>;

    /// Up to `limit` chunks ending at or after `version`, in version order.
    async fn get_chunks_from_version(
        &self,
        project_id: &ProjectId,
        version: i64,
        limit: usize,
    ) -> MetadataResult<Vec<ChunkRecord>>;

    /// Reserve an id for a chunk whose history is about to be uploaded.
    async fn insert_pending_chunk(
        &self,
        project_id: &ProjectId,
        range: &ChunkRange,
    ) -> MetadataResult<ChunkId>;

    /// Activate a pending chunk as the new latest chunk.
    ///
    /// Atomically checks the linked preceding chunk, activates the chunk and
    /// merges the project record. Fails with `VersionConflict` if another
    /// chunk already holds the range or the pending reservation is gone.
    async fn confirm_create(
        &self,
        project_id: &ProjectId,
        chunk_id: &ChunkId,
        range: &ChunkRange,
        opts: &ConfirmOptions,
    ) -> MetadataResult<()>;

    /// Atomically replace active chunk `old_chunk_id` with pending chunk
    /// `new_chunk_id`. Both must start at the same version.
    async fn confirm_update(
        &self,
        project_id: &ProjectId,
        old_chunk_id: &ChunkId,
        new_chunk_id: &ChunkId,
        range: &ChunkRange,
        opts: &ConfirmOptions,
    ) -> MetadataResult<()>;

    /// Soft-delete one active chunk.
    async fn delete_chunk(&self, project_id: &ProjectId, chunk_id: &ChunkId) -> MetadataResult<()>;

    /// Soft-delete every active chunk of a project. Returns how many.
    async fn delete_project_chunks(&self, project_id: &ProjectId) -> MetadataResult<u64>;
}
