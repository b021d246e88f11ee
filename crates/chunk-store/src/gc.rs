//! Garbage collection of superseded and abandoned chunks.
//!
//! Fetching a batch claims abandoned pending chunks, so a writer that
//! confirms one afterwards gets a version conflict. Each batch then deletes
//! history objects first and index records second. If the object deletes
//! fail, the records stay and the next sweep retries them; deleting an
//! already-missing object succeeds, so a retried batch is harmless.

use crate::error::ChunkStoreResult;
use crate::store::ChunkStore;
use folio_core::config::GcConfig;
use folio_core::metrics::{GC_BATCHES, GC_CHUNKS_DELETED};
use folio_core::{ChunkId, ProjectId};
use folio_metadata::ChunkBackend;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Limits for one sweep.
#[derive(Clone, Debug)]
pub struct GcOptions {
    /// Old chunks reclaimed per batch.
    pub batch_size: usize,
    /// Stop after this many batches across all backends.
    pub max_batches: Option<u32>,
    /// Only reclaim chunks deleted (or left pending) at least this long ago.
    pub min_age: Duration,
    /// Stop starting new batches once this much time has passed.
    pub timeout: Duration,
}

impl Default for GcOptions {
    fn default() -> Self {
        Self::from(&GcConfig::default())
    }
}

impl From<&GcConfig> for GcOptions {
    fn from(config: &GcConfig) -> Self {
        Self {
            batch_size: config.max_delete_keys.max(1),
            max_batches: config.max_batches,
            min_age: Duration::from_secs(config.min_age_secs),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

/// Why a backend's sweep ended.
enum SweepEnd {
    /// Nothing old enough is left.
    Drained,
    /// The batch limit or deadline was reached.
    Limit,
}

struct Sweep {
    deadline: Instant,
    batches: u32,
    deleted: u64,
}

impl ChunkStore {
    /// Physically delete old chunks from every backend.
    ///
    /// Returns how many chunks were removed. An object-storage failure
    /// aborts the sweep with that error and leaves the failing batch's
    /// records in place.
    #[instrument(skip(self, opts), fields(batch_size = opts.batch_size))]
    pub async fn delete_old_chunks(&self, opts: &GcOptions) -> ChunkStoreResult<u64> {
        let mut sweep = Sweep {
            deadline: Instant::now() + opts.timeout,
            batches: 0,
            deleted: 0,
        };

        for backend in self.selector.all() {
            match self.sweep_backend(backend.as_ref(), opts, &mut sweep).await? {
                SweepEnd::Drained => {}
                SweepEnd::Limit => break,
            }
        }

        info!(
            deleted = sweep.deleted,
            batches = sweep.batches,
            "Old chunk garbage collection finished"
        );
        Ok(sweep.deleted)
    }

    async fn sweep_backend(
        &self,
        backend: &dyn ChunkBackend,
        opts: &GcOptions,
        sweep: &mut Sweep,
    ) -> ChunkStoreResult<SweepEnd> {
        let name = backend.backend_name();
        loop {
            if opts.max_batches.is_some_and(|max| sweep.batches >= max) {
                debug!(batches = sweep.batches, "GC batch limit reached");
                return Ok(SweepEnd::Limit);
            }
            if Instant::now() >= sweep.deadline {
                warn!(
                    backend = name,
                    deleted = sweep.deleted,
                    "GC timed out before draining old chunks"
                );
                return Ok(SweepEnd::Limit);
            }

            let cutoff = OffsetDateTime::now_utc() - opts.min_age;
            let batch = backend
                .get_old_chunks_batch(opts.batch_size, cutoff)
                .await
                .inspect_err(|e| {
                    GC_BATCHES.with_label_values(&[name, "error"]).inc();
                    error!(backend = name, error = %e, "Failed to fetch old chunks");
                })?;
            if batch.is_empty() {
                return Ok(SweepEnd::Drained);
            }
            sweep.batches += 1;
            let fetched = batch.len();

            let (batch, active): (Vec<_>, Vec<_>) = batch
                .into_iter()
                .partition(|old| old.state.is_collectable());
            if !active.is_empty() {
                error!(
                    backend = name,
                    count = active.len(),
                    "Backend returned active chunks as old chunks; skipping them"
                );
                if batch.is_empty() {
                    return Ok(SweepEnd::Drained);
                }
            }

            let keys: Vec<(ProjectId, ChunkId)> = batch
                .iter()
                .map(|old| (old.project_id.clone(), old.chunk_id.clone()))
                .collect();
            if let Err(e) = self.histories.delete_chunks(&keys).await {
                GC_BATCHES.with_label_values(&[name, "error"]).inc();
                error!(
                    backend = name,
                    count = keys.len(),
                    error = %e,
                    "Failed to delete old chunk histories"
                );
                return Err(e.into());
            }

            let removed = backend.delete_old_chunks(&batch).await.inspect_err(|e| {
                GC_BATCHES.with_label_values(&[name, "error"]).inc();
                error!(backend = name, error = %e, "Failed to delete old chunk records");
            })?;

            sweep.deleted += removed;
            GC_CHUNKS_DELETED.inc_by(removed);
            GC_BATCHES.with_label_values(&[name, "success"]).inc();
            debug!(backend = name, removed, "Deleted batch of old chunks");

            if fetched < opts.batch_size {
                return Ok(SweepEnd::Drained);
            }
        }
    }
}
