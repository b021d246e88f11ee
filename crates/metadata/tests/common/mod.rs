//! Chunk backend test utilities.

use folio_metadata::{ChunkBackend, MetadataResult, MongoBackend, PostgresBackend, SqliteBackend};
use std::sync::Arc;
use tempfile::TempDir;
use testcontainers::{ContainerAsync, ImageExt, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;

/// Stable prefix for Docker/container startup failures in Postgres test setup.
/// Tests use this marker to decide whether to skip due to unavailable Docker.
pub const POSTGRES_CONTAINER_START_ERR_PREFIX: &str = "postgres-container-start:";

/// A SQLite backend in a temporary directory.
#[allow(dead_code)]
pub struct TestSqlite {
    pub backend: Arc<SqliteBackend>,
    _temp_dir: TempDir,
}

impl TestSqlite {
    pub async fn new() -> MetadataResult<Self> {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let backend = SqliteBackend::new(temp_dir.path().join("chunks.db")).await?;
        Ok(Self {
            backend: Arc::new(backend),
            _temp_dir: temp_dir,
        })
    }

    pub fn backend(&self) -> Arc<dyn ChunkBackend> {
        self.backend.clone()
    }
}

/// A PostgreSQL backend running in a testcontainer.
#[allow(dead_code)]
pub struct TestPostgres {
    pub backend: Arc<PostgresBackend>,
    _container: ContainerAsync<Postgres>,
}

impl TestPostgres {
    pub async fn new() -> MetadataResult<Self> {
        let container = Postgres::default()
            .with_tag("15-alpine")
            .start()
            .await
            .map_err(|e| {
                folio_metadata::MetadataError::Internal(format!(
                    "{} Failed to start PostgreSQL container: {e}",
                    POSTGRES_CONTAINER_START_ERR_PREFIX
                ))
            })?;

        let host = container.get_host().await.expect("Failed to get host");
        let port = container
            .get_host_port_ipv4(5432)
            .await
            .expect("Failed to get port");

        // Default credentials from testcontainers-modules postgres
        let url = format!("postgres://postgres:postgres@{}:{}/postgres", host, port);
        let backend = PostgresBackend::from_url(&url, None, 5, None).await?;

        Ok(Self {
            backend: Arc::new(backend),
            _container: container,
        })
    }

    pub fn backend(&self) -> Arc<dyn ChunkBackend> {
        self.backend.clone()
    }
}

/// MongoDB tests need a replica set (transactions), which a plain container
/// does not provide. Point this at one to enable them.
pub const MONGO_URL_ENV: &str = "FOLIO_TEST_MONGO_URL";

/// A MongoDB backend in a fresh database, if a server is configured.
#[allow(dead_code)]
pub async fn test_mongo() -> Option<Arc<dyn ChunkBackend>> {
    let url = std::env::var(MONGO_URL_ENV).ok().filter(|url| !url.is_empty())?;
    let database = format!("folio_test_{}", mongodb::bson::oid::ObjectId::new().to_hex());
    match MongoBackend::connect(&url, &database).await {
        Ok(backend) => Some(Arc::new(backend)),
        Err(err) => {
            eprintln!("Skipping MongoDB chunk backend tests: {err}");
            None
        }
    }
}

/// Run a test against every available backend: always SQLite, PostgreSQL
/// unless `SKIP_POSTGRES_TESTS` is set or Docker is missing, MongoDB when
/// configured.
#[allow(dead_code)]
pub async fn run_backend_test_all<F, Fut>(test_fn: F)
where
    F: Fn(Arc<dyn ChunkBackend>) -> Fut + Clone,
    Fut: std::future::Future<Output = ()>,
{
    let sqlite = TestSqlite::new()
        .await
        .expect("Failed to create SQLite test backend");
    test_fn.clone()(sqlite.backend()).await;

    if std::env::var("SKIP_POSTGRES_TESTS").is_err() {
        match TestPostgres::new().await {
            Ok(postgres) => test_fn.clone()(postgres.backend()).await,
            Err(err) => eprintln!("Skipping PostgreSQL chunk backend tests: {err}"),
        }
    }

    if let Some(mongo) = test_mongo().await {
        test_fn(mongo).await;
    }
}
