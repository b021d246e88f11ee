//! Redis cache test utilities.

use folio_cache::{CacheError, CacheResult, RedisCacheBackend};
use folio_core::history::{Change, File, History, Operation, Snapshot};
use folio_core::Chunk;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::{REDIS_PORT, Redis};
use time::OffsetDateTime;

/// A Redis backend running in a testcontainer.
#[allow(dead_code)]
pub struct TestRedis {
    pub backend: RedisCacheBackend,
    _container: ContainerAsync<Redis>,
}

impl TestRedis {
    pub async fn new() -> CacheResult<Self> {
        let container = Redis::default().start().await.map_err(|e| {
            CacheError::Config(format!("Failed to start Redis container: {e}"))
        })?;
        let host = container.get_host().await.expect("Failed to get host");
        let port = container
            .get_host_port_ipv4(REDIS_PORT)
            .await
            .expect("Failed to get port");

        let backend = RedisCacheBackend::connect(&format!("redis://{host}:{port}")).await?;
        Ok(Self {
            backend,
            _container: container,
        })
    }
}

/// Start Redis, or explain why the test is skipped.
#[allow(dead_code)]
pub async fn redis_or_skip() -> Option<TestRedis> {
    if std::env::var("SKIP_REDIS_TESTS").is_ok() {
        return None;
    }
    match TestRedis::new().await {
        Ok(redis) => Some(redis),
        Err(err) => {
            eprintln!("Skipping Redis cache tests: {err}");
            None
        }
    }
}

/// A chunk of `changes` single-file additions.
#[allow(dead_code)]
pub fn sample_chunk(start_version: i64, changes: usize) -> Chunk {
    let timestamp = folio_core::history::truncate_to_millis(OffsetDateTime::now_utc());
    let changes = (0..changes)
        .map(|i| {
            Change::new(
                vec![Operation::AddFile {
                    pathname: format!("chapter{i}.tex"),
                    file: File::from_string(format!("Content {i}")),
                }],
                timestamp,
                Vec::new(),
            )
        })
        .collect();
    Chunk::new(History::new(Snapshot::new(), changes), start_version)
}
