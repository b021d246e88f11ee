//! Old chunk (tombstone) repository used by garbage collection.

use crate::error::MetadataResult;
use crate::models::OldChunk;
use async_trait::async_trait;
use time::OffsetDateTime;

/// Repository for chunks awaiting physical deletion.
#[async_trait]
pub trait OldChunkRepo: Send + Sync {
    /// Up to `limit` soft-deleted or abandoned pending chunks whose deletion
    /// (or creation) time is at or before `cutoff`, oldest first.
    async fn get_old_chunks_batch(
        &self,
        limit: usize,
        cutoff: OffsetDateTime,
    ) -> MetadataResult<Vec<OldChunk>>;

    /// Remove the index records of chunks whose history objects are gone.
    ///
    /// Never removes an active chunk. Returns the number of records removed.
    async fn delete_old_chunks(&self, chunks: &[OldChunk]) -> MetadataResult<u64>;
}
