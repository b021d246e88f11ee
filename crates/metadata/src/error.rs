//! Metadata backend error types.

use thiserror::Error;

/// Chunk metadata operation errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("not found: {0}")]
    NotFound(String),

    /// A concurrent writer won the race for this version range, or the chunk
    /// being replaced is no longer current.
    #[error("version conflict for project {project_id}: {detail}")]
    VersionConflict { project_id: String, detail: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("document store error: {0}")]
    Document(#[from] mongodb::error::Error),

    #[error("invalid identifier: {0}")]
    Core(#[from] folio_core::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MetadataError {
    pub(crate) fn conflict(project_id: impl ToString, detail: impl Into<String>) -> Self {
        Self::VersionConflict {
            project_id: project_id.to_string(),
            detail: detail.into(),
        }
    }

    pub fn is_version_conflict(&self) -> bool {
        matches!(self, MetadataError::VersionConflict { .. })
    }
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_display() {
        let err = MetadataError::conflict("42", "chunk start version 3 already exists");
        assert!(err.is_version_conflict());
        assert_eq!(
            err.to_string(),
            "version conflict for project 42: chunk start version 3 already exists"
        );
    }

    #[test]
    fn test_not_found_is_not_conflict() {
        assert!(!MetadataError::NotFound("chunk 1".to_string()).is_version_conflict());
    }
}
