//! Versioned history chunk store for Folio.
//!
//! This crate ties the metadata backends, object storage and the chunk cache
//! together:
//! - [`ChunkStore`] creates, replaces, loads and deletes chunks
//! - [`GcOptions`] bounds the old chunk garbage collector

pub mod error;
pub mod gc;
pub mod store;

pub use error::{ChunkStoreError, ChunkStoreResult};
pub use gc::GcOptions;
pub use store::{CHUNK_PAGE_SIZE, ChunkStore};

use folio_core::config::AppConfig;
use folio_storage::{BlobStore, HistoryStore};

/// Connect every configured backend and build a chunk store.
pub async fn from_config(config: &AppConfig) -> ChunkStoreResult<ChunkStore> {
    config.validate().map_err(ChunkStoreError::Config)?;

    let objects = folio_storage::from_config(&config.storage).await?;
    let selector = folio_metadata::from_config(&config.metadata).await?;
    let cache = folio_cache::from_config(&config.cache)
        .await
        .map_err(|e| ChunkStoreError::Config(format!("chunk cache: {e}")))?;

    Ok(ChunkStore::new(
        selector,
        BlobStore::new(objects.clone(), config.history.upload_concurrency),
        HistoryStore::new(objects, config.gc.delete_concurrency),
        cache,
    ))
}
