use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashSet;
use folio_storage::error::{StorageError, StorageResult};
use folio_storage::traits::ObjectStore;
use folio_storage::MemoryBackend;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::time::Duration;

/// In-memory backend that counts requests, tracks peak concurrency and fails
/// requests for chosen keys.
///
/// Every request sleeps briefly so concurrent requests overlap.
#[allow(dead_code)]
#[derive(Default)]
pub struct InstrumentedBackend {
    inner: MemoryBackend,
    pub gets: AtomicUsize,
    pub puts: AtomicUsize,
    pub deletes: AtomicUsize,
    in_flight: AtomicUsize,
    pub peak_in_flight: AtomicUsize,
    failing_keys: DashSet<String>,
}

#[allow(dead_code)]
impl InstrumentedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every request for `key` fail with a backend error.
    pub fn fail_key(&self, key: impl Into<String>) {
        self.failing_keys.insert(key.into());
    }

    /// Number of stored objects.
    pub fn stored(&self) -> usize {
        self.inner.len()
    }

    pub fn peak(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    async fn track<T>(
        &self,
        key: &str,
        counter: &AtomicUsize,
        op: impl std::future::Future<Output = StorageResult<T>>,
    ) -> StorageResult<T> {
        counter.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(5)).await;
        let result = if self.failing_keys.contains(key) {
            Err(StorageError::Backend(format!("injected failure for {key}")))
        } else {
            op.await
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[async_trait]
impl ObjectStore for InstrumentedBackend {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.inner.exists(key).await
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.track(key, &self.gets, self.inner.get(key)).await
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.track(key, &self.puts, self.inner.put(key, data)).await
    }

    async fn put_if_not_exists(&self, key: &str, data: Bytes) -> StorageResult<bool> {
        self.track(key, &self.puts, self.inner.put_if_not_exists(key, data))
            .await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.track(key, &self.deletes, self.inner.delete(key)).await
    }

    fn backend_name(&self) -> &'static str {
        "instrumented"
    }
}
