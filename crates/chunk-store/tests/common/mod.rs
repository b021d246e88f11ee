//! Chunk store test utilities.

use async_trait::async_trait;
use bytes::Bytes;
use folio_cache::{ChunkCache, DEFAULT_TTL, MemoryCacheBackend};
use folio_chunk_store::{ChunkStore, GcOptions};
use folio_core::history::truncate_to_millis;
use folio_core::{Change, Chunk, File, History, Operation, Snapshot};
use folio_metadata::{BackendSelector, ChunkBackend, SqliteBackend};
use folio_storage::{
    BlobStore, HistoryStore, MemoryBackend, ObjectStore, StorageError, StorageResult,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use time::OffsetDateTime;

/// In-memory object store whose writes and deletes can be made to fail.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryBackend,
    pub fail_puts: AtomicBool,
    pub fail_deletes: AtomicBool,
    pub gets: AtomicUsize,
}

#[allow(dead_code)]
impl FlakyStore {
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for FlakyStore {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.inner.exists(key).await
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(StorageError::Backend(format!("injected put failure for {key}")));
        }
        self.inner.put(key, data).await
    }

    async fn put_if_not_exists(&self, key: &str, data: Bytes) -> StorageResult<bool> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(StorageError::Backend(format!("injected put failure for {key}")));
        }
        self.inner.put_if_not_exists(key, data).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StorageError::Backend(format!(
                "injected delete failure for {key}"
            )));
        }
        self.inner.delete(key).await
    }

    fn backend_name(&self) -> &'static str {
        "flaky"
    }
}

/// A chunk store over SQLite and an in-memory object store.
#[allow(dead_code)]
pub struct TestChunkStore {
    pub store: ChunkStore,
    pub objects: Arc<FlakyStore>,
    pub metadata: Arc<dyn ChunkBackend>,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestChunkStore {
    pub async fn new() -> Self {
        Self::build(true).await
    }

    pub async fn without_cache() -> Self {
        Self::build(false).await
    }

    async fn build(with_cache: bool) -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let metadata: Arc<dyn ChunkBackend> = Arc::new(
            SqliteBackend::new(temp_dir.path().join("metadata.db"))
                .await
                .expect("Failed to open SQLite"),
        );
        let objects = Arc::new(FlakyStore::default());
        let cache = with_cache
            .then(|| ChunkCache::new(Arc::new(MemoryCacheBackend::new()), DEFAULT_TTL));

        let store = ChunkStore::new(
            BackendSelector::new(metadata.clone(), None),
            BlobStore::new(objects.clone(), 4),
            HistoryStore::new(objects.clone(), 4),
            cache,
        );
        Self {
            store,
            objects,
            metadata,
            _temp_dir: temp_dir,
        }
    }
}

/// GC options that reclaim everything already deleted.
#[allow(dead_code)]
pub fn gc_now(batch_size: usize) -> GcOptions {
    GcOptions {
        batch_size,
        max_batches: None,
        min_age: Duration::ZERO,
        timeout: Duration::from_secs(60),
    }
}

#[allow(dead_code)]
pub fn now() -> OffsetDateTime {
    truncate_to_millis(OffsetDateTime::now_utc())
}

/// A change adding `pathname` with `content` at `timestamp`.
#[allow(dead_code)]
pub fn add_file(pathname: &str, content: &str, timestamp: OffsetDateTime) -> Change {
    Change::new(
        vec![Operation::AddFile {
            pathname: pathname.to_string(),
            file: File::from_string(content),
        }],
        timestamp,
        vec![1],
    )
}

/// A chunk of `count` changes starting at `start_version`.
#[allow(dead_code)]
pub fn chunk_at(start_version: i64, count: usize, timestamp: OffsetDateTime) -> Chunk {
    let changes = (0..count)
        .map(|i| {
            add_file(
                &format!("v{}.tex", start_version + i as i64),
                &format!("content of version {}", start_version + i as i64),
                timestamp,
            )
        })
        .collect();
    Chunk::new(History::new(Snapshot::new(), changes), start_version)
}
