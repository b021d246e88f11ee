//! Project record repository.

use crate::error::MetadataResult;
use crate::models::ProjectRecord;
use async_trait::async_trait;
use folio_core::ProjectId;
use time::OffsetDateTime;

/// Repository for per-project high-water marks.
#[async_trait]
pub trait ProjectRecordRepo: Send + Sync {
    /// Allocate a fresh project id of this backend's shape.
    async fn generate_project_id(&self) -> MetadataResult<ProjectId>;

    /// Get a project's record, if one was ever written.
    async fn get_project_record(&self, project_id: &ProjectId)
    -> MetadataResult<Option<ProjectRecord>>;

    /// Merge high-water marks into the record, creating it if needed.
    ///
    /// `end_version` and `end_timestamp` only move forward; `pending_change_at`
    /// only moves backward. `None` leaves a field unchanged.
    async fn update_project_record(
        &self,
        project_id: &ProjectId,
        end_version: Option<i64>,
        end_timestamp: Option<OffsetDateTime>,
        pending_change_at: Option<OffsetDateTime>,
    ) -> MetadataResult<()>;

    /// Clear `pending_change_at` once the backup subsystem has caught up.
    async fn clear_pending_change_at(&self, project_id: &ProjectId) -> MetadataResult<()>;
}
