//! Cache backend trait.

use crate::error::CacheResult;
use async_trait::async_trait;
use folio_core::ProjectId;
use std::time::Duration;

/// A project's current chunk in serialized form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawCacheEntry {
    /// JSON of the chunk's starting snapshot.
    pub snapshot: String,
    pub start_version: i64,
    /// JSON of each change, in order.
    pub changes: Vec<String>,
}

/// What a cached chunk covers, without its content.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheMetadata {
    pub start_version: i64,
    pub changes_count: i64,
}

impl CacheMetadata {
    pub fn end_version(&self) -> i64 {
        self.start_version + self.changes_count
    }
}

/// Keyed storage for one current chunk per project.
///
/// Reads and writes of an entry are atomic: a reader sees either the whole
/// previous entry or the whole new one.
#[async_trait]
pub trait CacheBackend: Send + Sync + 'static {
    /// The cached entry, or `None` if there is none or it expired.
    async fn get_chunk(&self, project_id: &ProjectId) -> CacheResult<Option<RawCacheEntry>>;

    /// Start version and change count of the cached entry.
    async fn get_chunk_metadata(
        &self,
        project_id: &ProjectId,
    ) -> CacheResult<Option<CacheMetadata>>;

    /// Replace the entry wholesale; it expires after `ttl`.
    async fn set_chunk(
        &self,
        project_id: &ProjectId,
        entry: RawCacheEntry,
        ttl: Duration,
    ) -> CacheResult<()>;

    /// Remove the entry.
    async fn clear(&self, project_id: &ProjectId) -> CacheResult<()>;

    /// Static identifier for the backend type, used in logs.
    fn backend_name(&self) -> &'static str;
}
