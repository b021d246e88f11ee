//! Routing of projects to their metadata backend.

use crate::error::{MetadataError, MetadataResult};
use crate::store::ChunkBackend;
use folio_core::{BackendKind, ProjectId};
use std::sync::Arc;

/// Picks the backend that owns a project, by the shape of its id.
///
/// Numeric ids belong to the relational backend, 24-hex ids to the
/// document backend. Routing never consults stored data.
#[derive(Clone)]
pub struct BackendSelector {
    relational: Arc<dyn ChunkBackend>,
    document: Option<Arc<dyn ChunkBackend>>,
}

impl BackendSelector {
    pub fn new(
        relational: Arc<dyn ChunkBackend>,
        document: Option<Arc<dyn ChunkBackend>>,
    ) -> Self {
        Self {
            relational,
            document,
        }
    }

    /// The backend for `project_id`.
    pub fn for_project(&self, project_id: &ProjectId) -> MetadataResult<&Arc<dyn ChunkBackend>> {
        self.for_kind(project_id.backend_kind())
    }

    /// The backend serving `kind`, if configured.
    pub fn for_kind(&self, kind: BackendKind) -> MetadataResult<&Arc<dyn ChunkBackend>> {
        match kind {
            BackendKind::Relational => Ok(&self.relational),
            BackendKind::Document => self.document.as_ref().ok_or_else(|| {
                MetadataError::Config("no document backend is configured".to_string())
            }),
        }
    }

    /// The relational backend, which also allocates new project ids.
    pub fn relational(&self) -> &Arc<dyn ChunkBackend> {
        &self.relational
    }

    /// Every configured backend.
    pub fn all(&self) -> Vec<&Arc<dyn ChunkBackend>> {
        std::iter::once(&self.relational)
            .chain(self.document.as_ref())
            .collect()
    }
}
