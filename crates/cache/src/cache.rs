//! The current-chunk cache.

use crate::error::CacheResult;
use crate::traits::{CacheBackend, CacheMetadata, RawCacheEntry};
use folio_core::history::{Change, History, Snapshot};
use folio_core::metrics::{CACHE_DIVERGENCES, CACHE_OPERATIONS, CACHE_VALIDITY_CHECKS};
use folio_core::{Chunk, ProjectId};
use std::sync::Arc;
use std::time::Duration;

/// Default entry lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Best-effort mirror of each project's most recent chunk.
///
/// Nothing here fails: backend and decoding errors are logged, counted and
/// reported as misses. Callers that need correctness validate a cached chunk
/// against durable metadata before using it.
#[derive(Clone)]
pub struct ChunkCache {
    backend: Arc<dyn CacheBackend>,
    ttl: Duration,
}

fn record(operation: &str, status: &str) {
    CACHE_OPERATIONS
        .with_label_values(&[operation, status])
        .inc();
}

fn encode(chunk: &Chunk) -> CacheResult<RawCacheEntry> {
    let history = chunk.history();
    Ok(RawCacheEntry {
        snapshot: serde_json::to_string(history.snapshot())?,
        start_version: chunk.start_version(),
        changes: history
            .changes()
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<_, _>>()?,
    })
}

fn decode(entry: RawCacheEntry) -> CacheResult<Chunk> {
    let snapshot: Snapshot = serde_json::from_str(&entry.snapshot)?;
    let changes = entry
        .changes
        .iter()
        .map(|raw| serde_json::from_str::<Change>(raw))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Chunk::new(History::new(snapshot, changes), entry.start_version))
}

/// Result of [`ChunkCache::get_changes_since_version`].
#[derive(Debug)]
pub enum CachedChanges {
    /// Changes after the requested version, in order. Empty when the version
    /// is the cached chunk's end.
    Changes(Vec<Change>),
    /// Nothing cached for the project.
    NotFound,
    /// The version is past the cached end or before the cached start.
    OutOfBounds,
}

fn ranges_match(cached: Option<(i64, i64)>, start_version: i64, end_version: i64) -> bool {
    let valid = cached == Some((start_version, end_version));
    let result = match (cached, valid) {
        (None, _) => "miss",
        (Some(_), true) => "valid",
        (Some(_), false) => "invalid",
    };
    CACHE_VALIDITY_CHECKS.with_label_values(&[result]).inc();
    valid
}

impl ChunkCache {
    pub fn new(backend: Arc<dyn CacheBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.backend_name()
    }

    /// The cached chunk, or `None` on a miss or any failure.
    pub async fn get_current_chunk(&self, project_id: &ProjectId) -> Option<Chunk> {
        let entry = match self.backend.get_chunk(project_id).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                record("get", "miss");
                return None;
            }
            Err(e) => {
                record("get", "error");
                tracing::warn!(project_id = %project_id, error = %e, "Chunk cache read failed");
                return None;
            }
        };
        match decode(entry) {
            Ok(chunk) => {
                record("get", "success");
                Some(chunk)
            }
            Err(e) => {
                record("get", "error");
                tracing::warn!(project_id = %project_id, error = %e, "Cached chunk is unreadable");
                None
            }
        }
    }

    /// Replace the cached chunk.
    pub async fn set_current_chunk(&self, project_id: &ProjectId, chunk: &Chunk) {
        let result = match encode(chunk) {
            Ok(entry) => self.backend.set_chunk(project_id, entry, self.ttl).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => record("set", "success"),
            Err(e) => {
                record("set", "error");
                tracing::warn!(
                    project_id = %project_id,
                    start_version = chunk.start_version(),
                    error = %e,
                    "Chunk cache write failed"
                );
            }
        }
    }

    /// Start version and change count of the cached chunk.
    pub async fn get_current_chunk_metadata(&self, project_id: &ProjectId) -> Option<CacheMetadata> {
        match self.backend.get_chunk_metadata(project_id).await {
            Ok(Some(metadata)) => {
                record("get_metadata", "success");
                Some(metadata)
            }
            Ok(None) => {
                record("get_metadata", "miss");
                None
            }
            Err(e) => {
                record("get_metadata", "error");
                tracing::warn!(project_id = %project_id, error = %e, "Chunk cache metadata read failed");
                None
            }
        }
    }

    /// Whether `cached` covers exactly the versions of `current`. A miss is
    /// never valid.
    pub fn check_cache_validity(&self, cached: Option<&Chunk>, current: &Chunk) -> bool {
        ranges_match(
            cached.map(|c| (c.start_version(), c.end_version())),
            current.start_version(),
            current.end_version(),
        )
    }

    /// Like [`Self::check_cache_validity`], against durable metadata only.
    pub fn check_cache_validity_with_metadata(
        &self,
        cached: Option<&CacheMetadata>,
        start_version: i64,
        end_version: i64,
    ) -> bool {
        ranges_match(
            cached.map(|m| (m.start_version, m.end_version())),
            start_version,
            end_version,
        )
    }

    /// Compare a cached chunk with the durable one, logging any divergence.
    pub fn compare_chunks(&self, project_id: &ProjectId, cached: &Chunk, current: &Chunk) -> bool {
        let same = match (cached.to_raw(), current.to_raw()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        };
        if !same {
            CACHE_DIVERGENCES.inc();
            tracing::warn!(
                project_id = %project_id,
                cached_start_version = cached.start_version(),
                cached_end_version = cached.end_version(),
                current_start_version = current.start_version(),
                current_end_version = current.end_version(),
                "Cached chunk differs from durable chunk"
            );
        }
        same
    }

    /// Drop the project's entry.
    pub async fn clear_cache(&self, project_id: &ProjectId) {
        match self.backend.clear(project_id).await {
            Ok(()) => record("clear", "success"),
            Err(e) => {
                record("clear", "error");
                tracing::warn!(project_id = %project_id, error = %e, "Chunk cache clear failed");
            }
        }
    }

    /// Changes cached after `version`, for clients catching up from it.
    ///
    /// Only the requested tail of the change list is decoded. Failures are
    /// reported as [`CachedChanges::NotFound`].
    pub async fn get_changes_since_version(
        &self,
        project_id: &ProjectId,
        version: i64,
    ) -> CachedChanges {
        const OPERATION: &str = "get_changes_since_version";
        let entry = match self.backend.get_chunk(project_id).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                record(OPERATION, "not_found");
                return CachedChanges::NotFound;
            }
            Err(e) => {
                record(OPERATION, "error");
                tracing::warn!(project_id = %project_id, error = %e, "Chunk cache read failed");
                return CachedChanges::NotFound;
            }
        };

        let end_version = entry.start_version + entry.changes.len() as i64;
        if version < entry.start_version || version > end_version {
            record(OPERATION, "out_of_bounds");
            return CachedChanges::OutOfBounds;
        }
        let skip = (version - entry.start_version) as usize;
        let decoded = entry.changes[skip..]
            .iter()
            .map(|raw| serde_json::from_str::<Change>(raw))
            .collect::<Result<Vec<_>, _>>();
        match decoded {
            Ok(changes) => {
                record(OPERATION, "success");
                CachedChanges::Changes(changes)
            }
            Err(e) => {
                record(OPERATION, "error");
                tracing::warn!(project_id = %project_id, error = %e, "Cached changes are unreadable");
                CachedChanges::NotFound
            }
        }
    }

    /// Remove everything cached for a project that is being permanently
    /// deleted. Returns whether the removal reached the backend.
    pub async fn hard_delete_project(&self, project_id: &ProjectId) -> bool {
        match self.backend.clear(project_id).await {
            Ok(()) => {
                record("hard_delete", "success");
                true
            }
            Err(e) => {
                record("hard_delete", "error");
                tracing::error!(
                    project_id = %project_id,
                    error = %e,
                    "Chunk cache hard delete failed"
                );
                false
            }
        }
    }

    /// The cached chunk if it covers exactly `start_version..=end_version`.
    ///
    /// Checks the cheap metadata first so a stale entry is not fetched in
    /// full, then re-checks the full entry, which may have been replaced in
    /// between.
    pub async fn get_current_chunk_if_valid(
        &self,
        project_id: &ProjectId,
        start_version: i64,
        end_version: i64,
    ) -> Option<Chunk> {
        let metadata = self.get_current_chunk_metadata(project_id).await;
        if !self.check_cache_validity_with_metadata(metadata.as_ref(), start_version, end_version) {
            return None;
        }
        let chunk = self.get_current_chunk(project_id).await?;
        ranges_match(
            Some((chunk.start_version(), chunk.end_version())),
            start_version,
            end_version,
        )
        .then_some(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryCacheBackend;
    use crate::error::CacheError;
    use async_trait::async_trait;
    use folio_core::history::{File, Operation};
    use time::macros::datetime;

    fn chunk(start_version: i64, changes: usize) -> Chunk {
        let changes = (0..changes)
            .map(|i| {
                Change::new(
                    vec![Operation::AddFile {
                        pathname: format!("file{i}.tex"),
                        file: File::from_string(format!("content {i}")),
                    }],
                    datetime!(2024-02-03 04:05:06.789 UTC),
                    vec![1],
                )
            })
            .collect();
        Chunk::new(History::new(Snapshot::new(), changes), start_version)
    }

    fn memory_cache() -> ChunkCache {
        ChunkCache::new(Arc::new(MemoryCacheBackend::new()), DEFAULT_TTL)
    }

    struct BrokenBackend;

    #[async_trait]
    impl CacheBackend for BrokenBackend {
        async fn get_chunk(&self, _: &ProjectId) -> CacheResult<Option<RawCacheEntry>> {
            Err(CacheError::Config("down".to_string()))
        }
        async fn get_chunk_metadata(&self, _: &ProjectId) -> CacheResult<Option<CacheMetadata>> {
            Err(CacheError::Config("down".to_string()))
        }
        async fn set_chunk(&self, _: &ProjectId, _: RawCacheEntry, _: Duration) -> CacheResult<()> {
            Err(CacheError::Config("down".to_string()))
        }
        async fn clear(&self, _: &ProjectId) -> CacheResult<()> {
            Err(CacheError::Config("down".to_string()))
        }
        fn backend_name(&self) -> &'static str {
            "broken"
        }
    }

    #[tokio::test]
    async fn test_set_then_get_returns_equal_chunk() {
        let cache = memory_cache();
        let project = ProjectId::parse("1").unwrap();
        let original = chunk(5, 1);

        cache.set_current_chunk(&project, &original).await;
        let cached = cache.get_current_chunk(&project).await.unwrap();
        assert_eq!(cached.start_version(), 5);
        assert_eq!(cached.end_version(), 6);
        assert!(cache.compare_chunks(&project, &cached, &original));

        let metadata = cache.get_current_chunk_metadata(&project).await.unwrap();
        assert_eq!(metadata.start_version, 5);
        assert_eq!(metadata.changes_count, 1);
    }

    #[tokio::test]
    async fn test_empty_chunk_round_trips() {
        let cache = memory_cache();
        let project = ProjectId::parse("2").unwrap();
        cache.set_current_chunk(&project, &chunk(10, 0)).await;
        let cached = cache.get_current_chunk(&project).await.unwrap();
        assert_eq!(cached.end_version(), 10);
        assert!(cached.history().changes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_a_miss() {
        let cache = memory_cache();
        let project = ProjectId::parse("3").unwrap();
        cache.set_current_chunk(&project, &chunk(0, 2)).await;
        tokio::time::advance(DEFAULT_TTL + Duration::from_secs(1)).await;
        assert!(cache.get_current_chunk(&project).await.is_none());
    }

    #[test]
    fn test_validity_requires_exact_range() {
        let cache = memory_cache();
        let current = chunk(3, 2);
        assert!(cache.check_cache_validity(Some(&chunk(3, 2)), &current));
        assert!(!cache.check_cache_validity(Some(&chunk(3, 1)), &current));
        assert!(!cache.check_cache_validity(Some(&chunk(3, 3)), &current));
        assert!(!cache.check_cache_validity(Some(&chunk(2, 3)), &current));
        assert!(!cache.check_cache_validity(None, &current));

        let metadata = CacheMetadata {
            start_version: 3,
            changes_count: 2,
        };
        assert!(cache.check_cache_validity_with_metadata(Some(&metadata), 3, 5));
        assert!(!cache.check_cache_validity_with_metadata(Some(&metadata), 3, 6));
        assert!(!cache.check_cache_validity_with_metadata(None, 3, 5));
    }

    #[test]
    fn test_compare_detects_divergence() {
        let cache = memory_cache();
        let project = ProjectId::parse("4").unwrap();
        let before = CACHE_DIVERGENCES.get();
        assert!(!cache.compare_chunks(&project, &chunk(0, 1), &chunk(0, 2)));
        assert!(CACHE_DIVERGENCES.get() > before);
    }

    #[tokio::test]
    async fn test_clear_removes_entry() {
        let cache = memory_cache();
        let project = ProjectId::parse("5").unwrap();
        cache.set_current_chunk(&project, &chunk(0, 1)).await;
        cache.clear_cache(&project).await;
        assert!(cache.get_current_chunk(&project).await.is_none());
        assert!(cache.get_current_chunk_metadata(&project).await.is_none());
    }

    #[tokio::test]
    async fn test_get_if_valid() {
        let cache = memory_cache();
        let project = ProjectId::parse("6").unwrap();
        cache.set_current_chunk(&project, &chunk(4, 3)).await;

        assert!(cache.get_current_chunk_if_valid(&project, 4, 7).await.is_some());
        assert!(cache.get_current_chunk_if_valid(&project, 4, 8).await.is_none());
        assert!(cache.get_current_chunk_if_valid(&project, 0, 7).await.is_none());
    }

    #[tokio::test]
    async fn test_changes_since_version() {
        let cache = memory_cache();
        let project = ProjectId::parse("9").unwrap();
        assert!(matches!(
            cache.get_changes_since_version(&project, 0).await,
            CachedChanges::NotFound
        ));

        // Covers versions 4..=7.
        cache.set_current_chunk(&project, &chunk(4, 3)).await;

        match cache.get_changes_since_version(&project, 5).await {
            CachedChanges::Changes(changes) => {
                assert_eq!(changes.len(), 2);
                assert!(matches!(
                    &changes[0].operations()[0],
                    Operation::AddFile { pathname, .. } if pathname == "file1.tex"
                ));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        match cache.get_changes_since_version(&project, 4).await {
            CachedChanges::Changes(changes) => assert_eq!(changes.len(), 3),
            other => panic!("unexpected result: {other:?}"),
        }
        match cache.get_changes_since_version(&project, 7).await {
            CachedChanges::Changes(changes) => assert!(changes.is_empty()),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(matches!(
            cache.get_changes_since_version(&project, 8).await,
            CachedChanges::OutOfBounds
        ));
        assert!(matches!(
            cache.get_changes_since_version(&project, 3).await,
            CachedChanges::OutOfBounds
        ));
    }

    #[tokio::test]
    async fn test_hard_delete_project() {
        let cache = memory_cache();
        let project = ProjectId::parse("10").unwrap();
        cache.set_current_chunk(&project, &chunk(0, 2)).await;
        assert!(cache.hard_delete_project(&project).await);
        assert!(cache.get_current_chunk(&project).await.is_none());
        assert!(matches!(
            cache.get_changes_since_version(&project, 0).await,
            CachedChanges::NotFound
        ));

        let broken = ChunkCache::new(Arc::new(BrokenBackend), DEFAULT_TTL);
        assert!(!broken.hard_delete_project(&project).await);
    }

    #[tokio::test]
    async fn test_backend_failures_are_misses() {
        let cache = ChunkCache::new(Arc::new(BrokenBackend), DEFAULT_TTL);
        let project = ProjectId::parse("7").unwrap();
        let errors_before = CACHE_OPERATIONS.with_label_values(&["get", "error"]).get();

        cache.set_current_chunk(&project, &chunk(0, 1)).await;
        assert!(cache.get_current_chunk(&project).await.is_none());
        assert!(cache.get_current_chunk_metadata(&project).await.is_none());
        cache.clear_cache(&project).await;

        assert!(CACHE_OPERATIONS.with_label_values(&["get", "error"]).get() > errors_before);
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_a_miss() {
        let backend = Arc::new(MemoryCacheBackend::new());
        let cache = ChunkCache::new(backend.clone(), DEFAULT_TTL);
        let project = ProjectId::parse("8").unwrap();
        backend
            .set_chunk(
                &project,
                RawCacheEntry {
                    snapshot: "not json".to_string(),
                    start_version: 0,
                    changes: Vec::new(),
                },
                DEFAULT_TTL,
            )
            .await
            .unwrap();
        assert!(cache.get_current_chunk(&project).await.is_none());
    }
}
