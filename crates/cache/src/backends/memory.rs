//! In-memory cache backend.
//!
//! Single-process only. Expiry follows `tokio::time`, so paused-clock tests
//! can advance past a TTL deterministically.

use crate::error::CacheResult;
use crate::traits::{CacheBackend, CacheMetadata, RawCacheEntry};
use async_trait::async_trait;
use dashmap::DashMap;
use folio_core::ProjectId;
use std::time::Duration;
use tokio::time::Instant;

struct Slot {
    entry: RawCacheEntry,
    expires_at: Instant,
}

/// In-memory cache backend.
#[derive(Default)]
pub struct MemoryCacheBackend {
    slots: DashMap<ProjectId, Slot>,
}

impl MemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries, expired or not.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn live<T>(&self, project_id: &ProjectId, f: impl FnOnce(&RawCacheEntry) -> T) -> Option<T> {
        let now = Instant::now();
        match self.slots.get(project_id) {
            Some(slot) if slot.expires_at > now => return Some(f(&slot.entry)),
            Some(_) => {}
            None => return None,
        }
        self.slots
            .remove_if(project_id, |_, slot| slot.expires_at <= now);
        None
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn get_chunk(&self, project_id: &ProjectId) -> CacheResult<Option<RawCacheEntry>> {
        Ok(self.live(project_id, RawCacheEntry::clone))
    }

    async fn get_chunk_metadata(
        &self,
        project_id: &ProjectId,
    ) -> CacheResult<Option<CacheMetadata>> {
        Ok(self.live(project_id, |entry| CacheMetadata {
            start_version: entry.start_version,
            changes_count: entry.changes.len() as i64,
        }))
    }

    async fn set_chunk(
        &self,
        project_id: &ProjectId,
        entry: RawCacheEntry,
        ttl: Duration,
    ) -> CacheResult<()> {
        self.slots.insert(
            project_id.clone(),
            Slot {
                entry,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn clear(&self, project_id: &ProjectId) -> CacheResult<()> {
        self.slots.remove(project_id);
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
