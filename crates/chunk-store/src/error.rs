//! Chunk store error types.

use folio_metadata::MetadataError;
use folio_storage::StorageError;
use thiserror::Error;
use time::OffsetDateTime;

/// Errors surfaced by [`crate::ChunkStore`].
#[derive(Debug, Error)]
pub enum ChunkStoreError {
    /// The project has no chunks, or the named chunk does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("no chunk of project {project_id} covers version {version}")]
    VersionNotFound { project_id: String, version: i64 },

    #[error("project {project_id} has no chunk at or before {timestamp}")]
    BeforeTimestampNotFound {
        project_id: String,
        timestamp: OffsetDateTime,
    },

    /// Another writer got there first. Recompute against the current latest
    /// chunk and try again.
    #[error("version conflict for project {project_id}: {detail}")]
    VersionConflict { project_id: String, detail: String },

    #[error("project {project_id} is already initialized")]
    AlreadyInitialized { project_id: String },

    /// Unroutable project id or missing backend.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("metadata error: {0}")]
    Metadata(MetadataError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("history error: {0}")]
    Core(folio_core::Error),
}

impl ChunkStoreError {
    /// Whether the caller may retry after re-reading the latest chunk.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChunkStoreError::VersionConflict { .. })
    }
}

impl From<MetadataError> for ChunkStoreError {
    fn from(e: MetadataError) -> Self {
        match e {
            MetadataError::VersionConflict { project_id, detail } => {
                ChunkStoreError::VersionConflict { project_id, detail }
            }
            MetadataError::NotFound(what) => ChunkStoreError::NotFound(what),
            MetadataError::Config(msg) => ChunkStoreError::Config(msg),
            MetadataError::Core(core) => core.into(),
            other => ChunkStoreError::Metadata(other),
        }
    }
}

impl From<folio_core::Error> for ChunkStoreError {
    fn from(e: folio_core::Error) -> Self {
        match e {
            folio_core::Error::InvalidProjectId(id) => {
                ChunkStoreError::Config(format!("unroutable project id {id:?}"))
            }
            other => ChunkStoreError::Core(other),
        }
    }
}

/// Result type for chunk store operations.
pub type ChunkStoreResult<T> = std::result::Result<T, ChunkStoreError>;
