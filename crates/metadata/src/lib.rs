//! Chunk metadata backends for Folio.
//!
//! This crate provides:
//! - The chunk index, old-chunk and project-record repositories
//! - Relational backends (SQLite, PostgreSQL) for numeric project ids
//! - A MongoDB backend for ObjectId project ids
//! - The [`BackendSelector`] that routes a project to its backend

pub mod error;
pub mod models;
pub mod mongo;
pub mod postgres;
pub mod repos;
pub mod selector;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use models::{ChunkRange, ChunkRecord, ChunkState, ConfirmOptions, OldChunk, ProjectRecord};
pub use mongo::MongoBackend;
pub use postgres::PostgresBackend;
pub use selector::BackendSelector;
pub use store::{ChunkBackend, SqliteBackend};

use folio_core::config::{MetadataConfig, RelationalConfig};
use std::sync::Arc;

/// Connect every configured backend and build a selector over them.
pub async fn from_config(config: &MetadataConfig) -> MetadataResult<BackendSelector> {
    config.validate().map_err(MetadataError::Config)?;

    let relational: Arc<dyn ChunkBackend> = match &config.relational {
        RelationalConfig::Sqlite { path } => Arc::new(SqliteBackend::new(path).await?),
        RelationalConfig::Postgres {
            url,
            replica_url,
            max_connections,
            statement_timeout_ms,
        } => {
            tracing::info!("Connecting to PostgreSQL using connection URL");
            Arc::new(
                PostgresBackend::from_url(
                    url,
                    replica_url.as_deref(),
                    *max_connections,
                    *statement_timeout_ms,
                )
                .await?,
            )
        }
    };

    let document: Option<Arc<dyn ChunkBackend>> = match &config.document {
        Some(document) => Some(Arc::new(
            MongoBackend::connect(&document.uri, &document.database).await?,
        )),
        None => None,
    };

    Ok(BackendSelector::new(relational, document))
}
