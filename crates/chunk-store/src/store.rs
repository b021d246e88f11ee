//! The chunk store: durable, versioned project history.
//!
//! A write uploads blobs, reserves a pending chunk id, uploads the history
//! object and only then activates the chunk in the metadata index. A failed
//! write therefore leaves at most a pending record and an orphaned object,
//! both reclaimed by [`ChunkStore::delete_old_chunks`].

use crate::error::{ChunkStoreError, ChunkStoreResult};
use folio_cache::ChunkCache;
use folio_core::metrics::{
    BACKEND_ERRORS, CHUNK_LOAD_DURATION, CHUNK_OPERATIONS, VERSION_CONFLICTS,
};
use folio_core::{Chunk, ChunkId, History, ProjectId, Snapshot};
use folio_metadata::{
    BackendSelector, ChunkBackend, ChunkRange, ChunkRecord, ConfirmOptions, MetadataError,
};
use folio_storage::{BlobStore, HistoryStore};
use futures::stream::{self, Stream, TryStreamExt};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};

/// Records fetched per round trip by [`ChunkStore::get_project_chunks_from_version`].
pub const CHUNK_PAGE_SIZE: usize = 100;

/// Orchestrates the metadata index, object storage and the current-chunk
/// cache.
#[derive(Clone)]
pub struct ChunkStore {
    pub(crate) selector: BackendSelector,
    pub(crate) blobs: BlobStore,
    pub(crate) histories: HistoryStore,
    cache: Option<ChunkCache>,
}

impl ChunkStore {
    pub fn new(
        selector: BackendSelector,
        blobs: BlobStore,
        histories: HistoryStore,
        cache: Option<ChunkCache>,
    ) -> Self {
        Self {
            selector,
            blobs,
            histories,
            cache,
        }
    }

    pub fn selector(&self) -> &BackendSelector {
        &self.selector
    }

    fn backend(&self, project_id: &ProjectId) -> ChunkStoreResult<&Arc<dyn ChunkBackend>> {
        Ok(self.selector.for_project(project_id)?)
    }

    /// Count and log a metadata failure, then convert it.
    fn backend_error(
        &self,
        backend: &dyn ChunkBackend,
        operation: &'static str,
        project_id: &ProjectId,
        err: MetadataError,
    ) -> ChunkStoreError {
        if err.is_version_conflict() {
            VERSION_CONFLICTS
                .with_label_values(&[backend.backend_name()])
                .inc();
            info!(
                project_id = %project_id,
                operation,
                error = %err,
                "Chunk version conflict"
            );
        } else if !matches!(err, MetadataError::NotFound(_)) {
            BACKEND_ERRORS
                .with_label_values(&[backend.backend_name(), operation])
                .inc();
            warn!(
                project_id = %project_id,
                backend = backend.backend_name(),
                operation,
                error = %err,
                "Chunk metadata operation failed"
            );
        }
        err.into()
    }

    fn record_operation(
        backend: &dyn ChunkBackend,
        operation: &str,
        result: &ChunkStoreResult<ChunkId>,
    ) {
        let status = match result {
            Ok(_) => "success",
            Err(e) if e.is_retryable() => "conflict",
            Err(_) => "error",
        };
        CHUNK_OPERATIONS
            .with_label_values(&[operation, backend.backend_name(), status])
            .inc();
    }

    /// Create a project with an empty chunk at version 0.
    ///
    /// Without `project_id`, a fresh id is allocated by the relational
    /// backend. Fails with `AlreadyInitialized` if the project has any chunk.
    #[instrument(skip(self, snapshot))]
    pub async fn initialize_project(
        &self,
        project_id: Option<ProjectId>,
        snapshot: Option<Snapshot>,
    ) -> ChunkStoreResult<ProjectId> {
        let project_id = match project_id {
            Some(project_id) => project_id,
            None => {
                let relational = self.selector.relational();
                relational.generate_project_id().await.map_err(|e| {
                    BACKEND_ERRORS
                        .with_label_values(&[relational.backend_name(), "generate_project_id"])
                        .inc();
                    warn!(error = %e, "Failed to allocate a project id");
                    ChunkStoreError::from(e)
                })?
            }
        };

        let backend = self.backend(&project_id)?;
        let latest = backend
            .get_latest_chunk(&project_id, false)
            .await
            .map_err(|e| self.backend_error(backend.as_ref(), "get_latest_chunk", &project_id, e))?;
        if latest.is_some() {
            return Err(ChunkStoreError::AlreadyInitialized {
                project_id: project_id.to_string(),
            });
        }

        let chunk = Chunk::new(History::new(snapshot.unwrap_or_default(), Vec::new()), 0);
        match self.create(&project_id, &chunk, None).await {
            Ok(_) => {
                info!(project_id = %project_id, "Initialized project");
                Ok(project_id)
            }
            Err(e) if e.is_retryable() => Err(ChunkStoreError::AlreadyInitialized {
                project_id: project_id.to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    /// Metadata of the latest chunk.
    ///
    /// With `read_only`, the lookup may be served by a replica and so may lag
    /// a just-committed write.
    #[instrument(skip(self), fields(project_id = %project_id))]
    pub async fn load_latest_raw(
        &self,
        project_id: &ProjectId,
        read_only: bool,
    ) -> ChunkStoreResult<ChunkRecord> {
        let backend = self.backend(project_id)?;
        backend
            .get_latest_chunk(project_id, read_only)
            .await
            .map_err(|e| self.backend_error(backend.as_ref(), "get_latest_chunk", project_id, e))?
            .ok_or_else(|| ChunkStoreError::NotFound(format!("chunks of project {project_id}")))
    }

    /// The latest chunk, served from the cache when it still matches the
    /// durable index.
    #[instrument(skip(self), fields(project_id = %project_id))]
    pub async fn load_latest(&self, project_id: &ProjectId) -> ChunkStoreResult<Chunk> {
        let record = self.load_latest_raw(project_id, false).await?;

        let start_time = Instant::now();
        if let Some(cache) = &self.cache
            && let Some(mut chunk) = cache
                .get_current_chunk_if_valid(project_id, record.start_version, record.end_version)
                .await
        {
            debug!(chunk_id = %record.id, "Serving latest chunk from cache");
            self.load_blobs(chunk.history_mut()).await?;
            CHUNK_LOAD_DURATION
                .with_label_values(&["cache"])
                .observe(start_time.elapsed().as_secs_f64());
            return Ok(chunk);
        }

        let chunk = self.load_by_chunk_record(project_id, &record).await?;
        if let Some(cache) = &self.cache {
            cache.set_current_chunk(project_id, &chunk).await;
        }
        Ok(chunk)
    }

    /// The chunk containing `version`.
    #[instrument(skip(self), fields(project_id = %project_id))]
    pub async fn load_at_version(
        &self,
        project_id: &ProjectId,
        version: i64,
    ) -> ChunkStoreResult<Chunk> {
        let record = self.get_chunk_metadata_for_version(project_id, version).await?;
        self.load_by_chunk_record(project_id, &record).await
    }

    /// The earliest chunk whose last change is at or after `timestamp`, or
    /// the latest chunk if every change predates it.
    #[instrument(skip(self), fields(project_id = %project_id))]
    pub async fn load_at_timestamp(
        &self,
        project_id: &ProjectId,
        timestamp: OffsetDateTime,
    ) -> ChunkStoreResult<Chunk> {
        let backend = self.backend(project_id)?;
        let record = backend
            .get_chunk_for_timestamp(project_id, timestamp)
            .await
            .map_err(|e| {
                self.backend_error(backend.as_ref(), "get_chunk_for_timestamp", project_id, e)
            })?
            .ok_or_else(|| ChunkStoreError::BeforeTimestampNotFound {
                project_id: project_id.to_string(),
                timestamp,
            })?;
        self.load_by_chunk_record(project_id, &record).await
    }

    /// Download and rehydrate the chunk described by `record`.
    ///
    /// Only the blobs the history references are fetched.
    #[instrument(skip(self, record), fields(project_id = %project_id, chunk_id = %record.id))]
    pub async fn load_by_chunk_record(
        &self,
        project_id: &ProjectId,
        record: &ChunkRecord,
    ) -> ChunkStoreResult<Chunk> {
        let start_time = Instant::now();
        let raw = self.histories.load_raw(project_id, &record.id).await?;
        let mut history = History::from_raw(raw)?;
        self.load_blobs(&mut history).await?;
        CHUNK_LOAD_DURATION
            .with_label_values(&["storage"])
            .observe(start_time.elapsed().as_secs_f64());

        let chunk = Chunk::new(history, record.start_version);
        if chunk.end_version() != record.end_version {
            return Err(ChunkStoreError::Core(folio_core::Error::InvalidChunk(format!(
                "chunk {} of project {project_id} holds versions {}..={} but is indexed as {}..={}",
                record.id,
                chunk.start_version(),
                chunk.end_version(),
                record.start_version,
                record.end_version
            ))));
        }
        Ok(chunk)
    }

    async fn load_blobs(&self, history: &mut History) -> ChunkStoreResult<()> {
        let mut batch = self.blobs.batch();
        batch.preload(history.find_blob_hashes()).await?;
        history.load_files(batch.loaded())?;
        Ok(())
    }

    /// Append `chunk` as the new latest chunk.
    ///
    /// A chunk starting above 0 must begin right after the current latest
    /// chunk. Losing a race to another writer fails with `VersionConflict`.
    #[instrument(skip(self, chunk), fields(project_id = %project_id, start_version = chunk.start_version()))]
    pub async fn create(
        &self,
        project_id: &ProjectId,
        chunk: &Chunk,
        earliest_change_timestamp: Option<OffsetDateTime>,
    ) -> ChunkStoreResult<ChunkId> {
        let backend = self.backend(project_id)?;
        let result = self
            .create_in(backend.as_ref(), project_id, chunk, earliest_change_timestamp)
            .await;
        Self::record_operation(backend.as_ref(), "create", &result);
        result
    }

    async fn create_in(
        &self,
        backend: &dyn ChunkBackend,
        project_id: &ProjectId,
        chunk: &Chunk,
        earliest_change_timestamp: Option<OffsetDateTime>,
    ) -> ChunkStoreResult<ChunkId> {
        let range = ChunkRange::of(chunk);

        let old_chunk_id = if range.start_version > 0 {
            let previous = backend
                .get_chunk_for_version(project_id, range.start_version - 1)
                .await
                .map_err(|e| self.backend_error(backend, "get_chunk_for_version", project_id, e))?;
            match previous {
                Some(previous) if previous.end_version == range.start_version - 1 => {
                    Some(previous.id)
                }
                _ => {
                    return Err(self.backend_error(
                        backend,
                        "create",
                        project_id,
                        MetadataError::VersionConflict {
                            project_id: project_id.to_string(),
                            detail: format!(
                                "no chunk ends at version {}",
                                range.start_version - 1
                            ),
                        },
                    ));
                }
            }
        } else {
            None
        };

        let chunk_id = self.upload(backend, project_id, chunk, &range).await?;
        let opts = ConfirmOptions {
            old_chunk_id,
            earliest_change_timestamp,
        };
        backend
            .confirm_create(project_id, &chunk_id, &range, &opts)
            .await
            .map_err(|e| self.backend_error(backend, "confirm_create", project_id, e))?;

        if let Some(cache) = &self.cache {
            cache.set_current_chunk(project_id, chunk).await;
        }
        debug!(
            project_id = %project_id,
            chunk_id = %chunk_id,
            end_version = range.end_version,
            "Created chunk"
        );
        Ok(chunk_id)
    }

    /// Store blobs, reserve a pending id and store the history object.
    async fn upload(
        &self,
        backend: &dyn ChunkBackend,
        project_id: &ProjectId,
        chunk: &Chunk,
        range: &ChunkRange,
    ) -> ChunkStoreResult<ChunkId> {
        self.blobs.put_many(&chunk.history().blobs_to_store()).await?;

        let chunk_id = backend
            .insert_pending_chunk(project_id, range)
            .await
            .map_err(|e| self.backend_error(backend, "insert_pending_chunk", project_id, e))?;

        let raw = chunk.history().to_raw()?;
        self.histories.store_raw(project_id, &chunk_id, &raw).await?;
        Ok(chunk_id)
    }

    /// Replace the latest chunk, which must end at `old_end_version`, with
    /// a longer `new_chunk` starting at the same version.
    #[instrument(skip(self, new_chunk), fields(project_id = %project_id))]
    pub async fn update(
        &self,
        project_id: &ProjectId,
        old_end_version: i64,
        new_chunk: &Chunk,
        earliest_change_timestamp: Option<OffsetDateTime>,
    ) -> ChunkStoreResult<ChunkId> {
        let backend = self.backend(project_id)?;
        let result = self
            .update_in(
                backend.as_ref(),
                project_id,
                old_end_version,
                new_chunk,
                earliest_change_timestamp,
            )
            .await;
        Self::record_operation(backend.as_ref(), "update", &result);
        result
    }

    async fn update_in(
        &self,
        backend: &dyn ChunkBackend,
        project_id: &ProjectId,
        old_end_version: i64,
        new_chunk: &Chunk,
        earliest_change_timestamp: Option<OffsetDateTime>,
    ) -> ChunkStoreResult<ChunkId> {
        let range = ChunkRange::of(new_chunk);
        let old = backend
            .get_chunk_for_version(project_id, old_end_version)
            .await
            .map_err(|e| self.backend_error(backend, "get_chunk_for_version", project_id, e))?
            .ok_or_else(|| ChunkStoreError::VersionNotFound {
                project_id: project_id.to_string(),
                version: old_end_version,
            })?;

        let detail = if old.end_version != old_end_version
            || old.start_version != range.start_version
        {
            Some(format!(
                "chunk {} covers {}..={}, expected {}..={old_end_version}",
                old.id, old.start_version, old.end_version, range.start_version
            ))
        } else if range.end_version < old_end_version {
            Some(format!(
                "replacement ends at {} before the replaced chunk's end {old_end_version}",
                range.end_version
            ))
        } else {
            backend
                .get_chunk_for_version(project_id, old_end_version + 1)
                .await
                .map_err(|e| self.backend_error(backend, "get_chunk_for_version", project_id, e))?
                .map(|next| format!("chunk {} is not the latest, chunk {} follows it", old.id, next.id))
        };
        if let Some(detail) = detail {
            return Err(self.backend_error(
                backend,
                "update",
                project_id,
                MetadataError::VersionConflict {
                    project_id: project_id.to_string(),
                    detail,
                },
            ));
        }

        let chunk_id = self.upload(backend, project_id, new_chunk, &range).await?;
        let opts = ConfirmOptions {
            old_chunk_id: None,
            earliest_change_timestamp,
        };
        let confirmed = backend
            .confirm_update(project_id, &old.id, &chunk_id, &range, &opts)
            .await
            .map_err(|e| self.backend_error(backend, "confirm_update", project_id, e));

        // The cached chunk no longer matches whichever writer won.
        if let Some(cache) = &self.cache {
            cache.clear_cache(project_id).await;
        }
        confirmed?;

        debug!(
            project_id = %project_id,
            old_chunk_id = %old.id,
            chunk_id = %chunk_id,
            end_version = range.end_version,
            "Replaced chunk"
        );
        Ok(chunk_id)
    }

    #[instrument(skip(self), fields(project_id = %project_id))]
    pub async fn get_chunk_id_for_version(
        &self,
        project_id: &ProjectId,
        version: i64,
    ) -> ChunkStoreResult<ChunkId> {
        Ok(self.get_chunk_metadata_for_version(project_id, version).await?.id)
    }

    #[instrument(skip(self), fields(project_id = %project_id))]
    pub async fn get_chunk_metadata_for_version(
        &self,
        project_id: &ProjectId,
        version: i64,
    ) -> ChunkStoreResult<ChunkRecord> {
        let backend = self.backend(project_id)?;
        backend
            .get_chunk_for_version(project_id, version)
            .await
            .map_err(|e| self.backend_error(backend.as_ref(), "get_chunk_for_version", project_id, e))?
            .ok_or_else(|| ChunkStoreError::VersionNotFound {
                project_id: project_id.to_string(),
                version,
            })
    }

    #[instrument(skip(self), fields(project_id = %project_id))]
    pub async fn get_project_chunk_ids(
        &self,
        project_id: &ProjectId,
    ) -> ChunkStoreResult<Vec<ChunkId>> {
        let backend = self.backend(project_id)?;
        backend
            .get_project_chunk_ids(project_id)
            .await
            .map_err(|e| self.backend_error(backend.as_ref(), "get_project_chunk_ids", project_id, e))
    }

    #[instrument(skip(self), fields(project_id = %project_id))]
    pub async fn get_project_chunks(
        &self,
        project_id: &ProjectId,
    ) -> ChunkStoreResult<Vec<ChunkRecord>> {
        let backend = self.backend(project_id)?;
        backend
            .get_project_chunks(project_id)
            .await
            .map_err(|e| self.backend_error(backend.as_ref(), "get_project_chunks", project_id, e))
    }

    /// Stream the chunks ending at or after `version`, in version order.
    ///
    /// Records are fetched a page at a time. The stream is empty when
    /// `version` is past the latest chunk.
    pub fn get_project_chunks_from_version<'a>(
        &'a self,
        project_id: &'a ProjectId,
        version: i64,
    ) -> impl Stream<Item = ChunkStoreResult<ChunkRecord>> + Send + 'a {
        stream::try_unfold(Some(version), move |next| async move {
            let Some(next) = next else {
                return Ok::<_, ChunkStoreError>(None);
            };
            let backend = self.backend(project_id)?;
            let page = backend
                .get_chunks_from_version(project_id, next, CHUNK_PAGE_SIZE)
                .await
                .map_err(|e| {
                    self.backend_error(backend.as_ref(), "get_chunks_from_version", project_id, e)
                })?;
            if page.is_empty() {
                return Ok(None);
            }
            let following = if page.len() < CHUNK_PAGE_SIZE {
                None
            } else {
                page.last().map(|record| record.end_version + 1)
            };
            Ok(Some((
                stream::iter(page.into_iter().map(Ok::<_, ChunkStoreError>)),
                following,
            )))
        })
        .try_flatten()
    }

    /// Soft-delete one chunk. Its history is reclaimed by garbage collection.
    #[instrument(skip(self), fields(project_id = %project_id, chunk_id = %chunk_id))]
    pub async fn destroy(&self, project_id: &ProjectId, chunk_id: &ChunkId) -> ChunkStoreResult<()> {
        let backend = self.backend(project_id)?;
        backend
            .delete_chunk(project_id, chunk_id)
            .await
            .map_err(|e| self.backend_error(backend.as_ref(), "delete_chunk", project_id, e))?;
        if let Some(cache) = &self.cache {
            cache.clear_cache(project_id).await;
        }
        Ok(())
    }

    /// Soft-delete every chunk of a project. Returns how many were deleted.
    #[instrument(skip(self), fields(project_id = %project_id))]
    pub async fn delete_project_chunks(&self, project_id: &ProjectId) -> ChunkStoreResult<u64> {
        let backend = self.backend(project_id)?;
        let deleted = backend
            .delete_project_chunks(project_id)
            .await
            .map_err(|e| {
                self.backend_error(backend.as_ref(), "delete_project_chunks", project_id, e)
            })?;
        if let Some(cache) = &self.cache {
            cache.hard_delete_project(project_id).await;
        }
        info!(project_id = %project_id, deleted, "Deleted project chunks");
        Ok(deleted)
    }

    /// Bring the project record's high-water marks up to the latest chunk.
    ///
    /// Does nothing for a project without chunks.
    #[instrument(skip(self), fields(project_id = %project_id))]
    pub async fn sync_project_record(&self, project_id: &ProjectId) -> ChunkStoreResult<()> {
        let backend = self.backend(project_id)?;
        let Some(latest) = backend
            .get_latest_chunk(project_id, false)
            .await
            .map_err(|e| self.backend_error(backend.as_ref(), "get_latest_chunk", project_id, e))?
        else {
            return Ok(());
        };
        backend
            .update_project_record(project_id, Some(latest.end_version), latest.end_timestamp, None)
            .await
            .map_err(|e| {
                self.backend_error(backend.as_ref(), "update_project_record", project_id, e)
            })
    }
}
