//! Chunk backend trait and the SQLite relational backend.

use crate::error::{MetadataError, MetadataResult};
use crate::repos::{ChunkRepo, OldChunkRepo, ProjectRecordRepo};
use async_trait::async_trait;
use folio_core::BackendKind;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// A complete chunk metadata backend.
#[async_trait]
pub trait ChunkBackend: ChunkRepo + OldChunkRepo + ProjectRecordRepo + Send + Sync {
    /// Which project id shape this backend serves.
    fn kind(&self) -> BackendKind;

    /// Static identifier for logs and metrics.
    fn backend_name(&self) -> &'static str;

    /// Create tables, collections and indexes.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check connectivity.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// SQLite relational backend (development and tests).
///
/// Timestamps are stored as unix milliseconds so range comparisons stay
/// numeric.
pub struct SqliteBackend {
    pool: Pool<Sqlite>,
}

impl SqliteBackend {
    /// Open (creating if missing) a database file and migrate it.
    pub async fn new(path: impl AsRef<Path>) -> MetadataResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            // One connection serializes writers and sidesteps "database is locked".
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let backend = Self { pool };
        backend.migrate().await?;
        tracing::info!(path = %path.display(), "Opened SQLite chunk metadata backend");
        Ok(backend)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

impl From<std::io::Error> for MetadataError {
    fn from(e: std::io::Error) -> Self {
        MetadataError::Config(e.to_string())
    }
}

#[async_trait]
impl ChunkBackend for SqliteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Relational
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Whether a SQLite error is a uniqueness violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.message().contains("UNIQUE constraint"))
}

mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use folio_core::{ChunkId, ProjectId};
    use sqlx::FromRow;
    use time::OffsetDateTime;

    const CHUNK_COLUMNS: &str = "id, start_version, end_version, end_timestamp";

    /// SQLite caps bound parameters; IN lists are split at this size.
    const MAX_IN_CLAUSE: usize = 900;

    #[derive(Debug, FromRow)]
    struct ChunkRow {
        id: i64,
        start_version: i64,
        end_version: i64,
        end_timestamp: Option<i64>,
    }

    impl ChunkRow {
        fn into_record(self) -> MetadataResult<ChunkRecord> {
            Ok(ChunkRecord {
                id: ChunkId::from(self.id),
                start_version: self.start_version,
                end_version: self.end_version,
                end_timestamp: self.end_timestamp.map(from_millis).transpose()?,
            })
        }
    }

    #[derive(Debug, FromRow)]
    struct OldChunkRow {
        chunk_id: i64,
        project_id: i64,
        state: String,
        start_version: i64,
        end_version: i64,
        deleted_at: i64,
    }

    #[derive(Debug, FromRow)]
    struct ProjectRow {
        current_end_version: Option<i64>,
        current_end_timestamp: Option<i64>,
        pending_change_at: Option<i64>,
    }

    fn records(rows: Vec<ChunkRow>) -> MetadataResult<Vec<ChunkRecord>> {
        rows.into_iter().map(ChunkRow::into_record).collect()
    }

    async fn merge_project_record<'e, E>(
        executor: E,
        project_id: i64,
        end_version: Option<i64>,
        end_timestamp: Option<OffsetDateTime>,
        pending_change_at: Option<OffsetDateTime>,
    ) -> MetadataResult<()>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        // MAX/MIN return NULL if either side is NULL, hence the COALESCE pairs.
        sqlx::query(
            "INSERT INTO projects (id, current_end_version, current_end_timestamp, pending_change_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                 current_end_version = MAX(
                     COALESCE(projects.current_end_version, excluded.current_end_version),
                     COALESCE(excluded.current_end_version, projects.current_end_version)),
                 current_end_timestamp = MAX(
                     COALESCE(projects.current_end_timestamp, excluded.current_end_timestamp),
                     COALESCE(excluded.current_end_timestamp, projects.current_end_timestamp)),
                 pending_change_at = MIN(
                     COALESCE(projects.pending_change_at, excluded.pending_change_at),
                     COALESCE(excluded.pending_change_at, projects.pending_change_at))",
        )
        .bind(project_id)
        .bind(end_version)
        .bind(end_timestamp.map(to_millis))
        .bind(pending_change_at.map(to_millis))
        .execute(executor)
        .await?;
        Ok(())
    }

    async fn insert_active_chunk(
        tx: &mut sqlx::Transaction<'_, Sqlite>,
        project_id: &ProjectId,
        chunk_id: i64,
        range: &ChunkRange,
    ) -> MetadataResult<()> {
        let result = sqlx::query(
            "INSERT INTO chunks (id, project_id, start_version, end_version, end_timestamp, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(chunk_id)
        .bind(project_id.as_i64()?)
        .bind(range.start_version)
        .bind(range.end_version)
        .bind(range.end_timestamp.map(to_millis))
        .bind(to_millis(now_millis()))
        .execute(&mut **tx)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(MetadataError::conflict(
                project_id,
                format!(
                    "an active chunk already starts at {} or ends at {}",
                    range.start_version, range.end_version
                ),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn take_pending_chunk(
        tx: &mut sqlx::Transaction<'_, Sqlite>,
        project_id: &ProjectId,
        chunk_id: i64,
    ) -> MetadataResult<()> {
        let removed = sqlx::query("DELETE FROM pending_chunks WHERE id = ?1 AND project_id = ?2")
            .bind(chunk_id)
            .bind(project_id.as_i64()?)
            .execute(&mut **tx)
            .await?
            .rows_affected();
        if removed != 1 {
            return Err(MetadataError::conflict(
                project_id,
                format!("pending chunk {chunk_id} no longer exists"),
            ));
        }
        Ok(())
    }

    #[async_trait]
    impl ChunkRepo for SqliteBackend {
        async fn get_latest_chunk(
            &self,
            project_id: &ProjectId,
            _read_only: bool,
        ) -> MetadataResult<Option<ChunkRecord>> {
            let row = sqlx::query_as::<_, ChunkRow>(&format!(
                "SELECT {CHUNK_COLUMNS} FROM chunks WHERE project_id = ?1
                 ORDER BY end_version DESC LIMIT 1"
            ))
            .bind(project_id.as_i64()?)
            .fetch_optional(&self.pool)
            .await?;
            row.map(ChunkRow::into_record).transpose()
        }

        async fn get_chunk_for_version(
            &self,
            project_id: &ProjectId,
            version: i64,
        ) -> MetadataResult<Option<ChunkRecord>> {
            let row = sqlx::query_as::<_, ChunkRow>(&format!(
                "SELECT {CHUNK_COLUMNS} FROM chunks
                 WHERE project_id = ?1 AND start_version <= ?2 AND end_version >= ?2
                 LIMIT 1"
            ))
            .bind(project_id.as_i64()?)
            .bind(version)
            .fetch_optional(&self.pool)
            .await?;
            row.map(ChunkRow::into_record).transpose()
        }

        async fn get_chunk_for_timestamp(
            &self,
            project_id: &ProjectId,
            timestamp: OffsetDateTime,
        ) -> MetadataResult<Option<ChunkRecord>> {
            let row = sqlx::query_as::<_, ChunkRow>(&format!(
                "SELECT {CHUNK_COLUMNS} FROM chunks
                 WHERE project_id = ?1 AND end_timestamp >= ?2
                 ORDER BY start_version ASC LIMIT 1"
            ))
            .bind(project_id.as_i64()?)
            .bind(to_millis(timestamp))
            .fetch_optional(&self.pool)
            .await?;
            match row {
                Some(row) => Ok(Some(row.into_record()?)),
                None => self.get_latest_chunk(project_id, false).await,
            }
        }

        async fn get_project_chunk_ids(
            &self,
            project_id: &ProjectId,
        ) -> MetadataResult<Vec<ChunkId>> {
            let ids: Vec<i64> = sqlx::query_scalar(
                "SELECT id FROM chunks WHERE project_id = ?1 ORDER BY start_version",
            )
            .bind(project_id.as_i64()?)
            .fetch_all(&self.pool)
            .await?;
            Ok(ids.into_iter().map(ChunkId::from).collect())
        }

        async fn get_project_chunks(
            &self,
            project_id: &ProjectId,
        ) -> MetadataResult<Vec<ChunkRecord>> {
            let rows = sqlx::query_as::<_, ChunkRow>(&format!(
                "SELECT {CHUNK_COLUMNS} FROM chunks WHERE project_id = ?1 ORDER BY start_version"
            ))
            .bind(project_id.as_i64()?)
            .fetch_all(&self.pool)
            .await?;
            records(rows)
        }

        async fn get_chunks_from_version(
            &self,
            project_id: &ProjectId,
            version: i64,
            limit: usize,
        ) -> MetadataResult<Vec<ChunkRecord>> {
            let rows = sqlx::query_as::<_, ChunkRow>(&format!(
                "SELECT {CHUNK_COLUMNS} FROM chunks
                 WHERE project_id = ?1 AND end_version >= ?2
                 ORDER BY start_version LIMIT ?3"
            ))
            .bind(project_id.as_i64()?)
            .bind(version)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
            records(rows)
        }

        async fn insert_pending_chunk(
            &self,
            project_id: &ProjectId,
            range: &ChunkRange,
        ) -> MetadataResult<ChunkId> {
            let id: i64 = sqlx::query_scalar(
                "INSERT INTO pending_chunks (project_id, start_version, end_version, end_timestamp, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5) RETURNING id",
            )
            .bind(project_id.as_i64()?)
            .bind(range.start_version)
            .bind(range.end_version)
            .bind(range.end_timestamp.map(to_millis))
            .bind(to_millis(now_millis()))
            .fetch_one(&self.pool)
            .await?;
            Ok(ChunkId::from(id))
        }

        async fn confirm_create(
            &self,
            project_id: &ProjectId,
            chunk_id: &ChunkId,
            range: &ChunkRange,
            opts: &ConfirmOptions,
        ) -> MetadataResult<()> {
            let pid = project_id.as_i64()?;
            let cid = numeric_chunk_id(chunk_id)?;
            let mut tx = self.pool.begin().await?;

            if let Some(old_chunk_id) = &opts.old_chunk_id {
                let old_end: Option<i64> = sqlx::query_scalar(
                    "SELECT end_version FROM chunks WHERE id = ?1 AND project_id = ?2",
                )
                .bind(numeric_chunk_id(old_chunk_id)?)
                .bind(pid)
                .fetch_optional(&mut *tx)
                .await?;
                if old_end != Some(range.start_version - 1) {
                    return Err(MetadataError::conflict(
                        project_id,
                        format!(
                            "chunk {old_chunk_id} is no longer the active chunk ending at {}",
                            range.start_version - 1
                        ),
                    ));
                }
            }

            take_pending_chunk(&mut tx, project_id, cid).await?;
            insert_active_chunk(&mut tx, project_id, cid, range).await?;
            merge_project_record(
                &mut *tx,
                pid,
                Some(range.end_version),
                range.end_timestamp,
                opts.earliest_change_timestamp,
            )
            .await?;

            tx.commit().await?;
            Ok(())
        }

        async fn confirm_update(
            &self,
            project_id: &ProjectId,
            old_chunk_id: &ChunkId,
            new_chunk_id: &ChunkId,
            range: &ChunkRange,
            opts: &ConfirmOptions,
        ) -> MetadataResult<()> {
            let pid = project_id.as_i64()?;
            let old_id = numeric_chunk_id(old_chunk_id)?;
            let new_id = numeric_chunk_id(new_chunk_id)?;
            let mut tx = self.pool.begin().await?;

            let old = sqlx::query_as::<_, ChunkRow>(&format!(
                "DELETE FROM chunks WHERE id = ?1 AND project_id = ?2 RETURNING {CHUNK_COLUMNS}"
            ))
            .bind(old_id)
            .bind(pid)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| {
                MetadataError::conflict(project_id, format!("chunk {old_chunk_id} is not active"))
            })?;
            check_replacement(
                project_id,
                old_chunk_id,
                old.start_version,
                old.end_version,
                range,
            )?;
            let successor: Option<i64> = sqlx::query_scalar(
                "SELECT id FROM chunks WHERE project_id = ?1 AND start_version > ?2 LIMIT 1",
            )
            .bind(pid)
            .bind(old.end_version)
            .fetch_optional(&mut *tx)
            .await?;
            if let Some(successor) = successor {
                return Err(MetadataError::conflict(
                    project_id,
                    format!("chunk {old_chunk_id} is followed by chunk {successor}"),
                ));
            }

            sqlx::query(
                "INSERT INTO old_chunks (chunk_id, project_id, start_version, end_version, deleted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .bind(old.id)
            .bind(pid)
            .bind(old.start_version)
            .bind(old.end_version)
            .bind(to_millis(now_millis()))
            .execute(&mut *tx)
            .await?;

            take_pending_chunk(&mut tx, project_id, new_id).await?;
            insert_active_chunk(&mut tx, project_id, new_id, range).await?;
            merge_project_record(
                &mut *tx,
                pid,
                Some(range.end_version),
                range.end_timestamp,
                opts.earliest_change_timestamp,
            )
            .await?;

            tx.commit().await?;
            Ok(())
        }

        async fn delete_chunk(
            &self,
            project_id: &ProjectId,
            chunk_id: &ChunkId,
        ) -> MetadataResult<()> {
            let mut tx = self.pool.begin().await?;
            let moved = sqlx::query(
                "INSERT INTO old_chunks (chunk_id, project_id, start_version, end_version, deleted_at)
                 SELECT id, project_id, start_version, end_version, ?3 FROM chunks
                 WHERE id = ?1 AND project_id = ?2",
            )
            .bind(numeric_chunk_id(chunk_id)?)
            .bind(project_id.as_i64()?)
            .bind(to_millis(now_millis()))
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if moved == 0 {
                return Err(MetadataError::NotFound(format!(
                    "chunk {chunk_id} in project {project_id}"
                )));
            }
            sqlx::query("DELETE FROM chunks WHERE id = ?1 AND project_id = ?2")
                .bind(numeric_chunk_id(chunk_id)?)
                .bind(project_id.as_i64()?)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(())
        }

        async fn delete_project_chunks(&self, project_id: &ProjectId) -> MetadataResult<u64> {
            let pid = project_id.as_i64()?;
            let mut tx = self.pool.begin().await?;
            let moved = sqlx::query(
                "INSERT INTO old_chunks (chunk_id, project_id, start_version, end_version, deleted_at)
                 SELECT id, project_id, start_version, end_version, ?2 FROM chunks
                 WHERE project_id = ?1",
            )
            .bind(pid)
            .bind(to_millis(now_millis()))
            .execute(&mut *tx)
            .await?
            .rows_affected();
            sqlx::query("DELETE FROM chunks WHERE project_id = ?1")
                .bind(pid)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(moved)
        }
    }

    #[async_trait]
    impl OldChunkRepo for SqliteBackend {
        async fn get_old_chunks_batch(
            &self,
            limit: usize,
            cutoff: OffsetDateTime,
        ) -> MetadataResult<Vec<OldChunk>> {
            let cutoff = to_millis(cutoff);
            let mut tx = self.pool.begin().await?;

            // Claimed pending chunks can no longer be confirmed.
            sqlx::query(
                "INSERT INTO old_chunks (chunk_id, project_id, state, start_version, end_version, deleted_at)
                 SELECT id, project_id, 'pending', start_version, end_version, created_at
                 FROM pending_chunks WHERE created_at <= ?1
                 ORDER BY created_at LIMIT ?2",
            )
            .bind(cutoff)
            .bind(limit as i64)
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "DELETE FROM pending_chunks
                 WHERE id IN (SELECT chunk_id FROM old_chunks WHERE state = 'pending')",
            )
            .execute(&mut *tx)
            .await?;

            let rows = sqlx::query_as::<_, OldChunkRow>(
                "SELECT chunk_id, project_id, state, start_version, end_version, deleted_at
                 FROM old_chunks WHERE deleted_at <= ?1
                 ORDER BY deleted_at LIMIT ?2",
            )
            .bind(cutoff)
            .bind(limit as i64)
            .fetch_all(&mut *tx)
            .await?;
            tx.commit().await?;

            rows.into_iter()
                .map(|row| {
                    Ok(OldChunk {
                        project_id: ProjectId::from_sequence(row.project_id)?,
                        chunk_id: ChunkId::from(row.chunk_id),
                        state: ChunkState::parse(&row.state)?,
                        start_version: row.start_version,
                        end_version: row.end_version,
                        deleted_at: from_millis(row.deleted_at)?,
                    })
                })
                .collect()
        }

        async fn delete_old_chunks(&self, chunks: &[OldChunk]) -> MetadataResult<u64> {
            let ids = chunks
                .iter()
                .map(|c| numeric_chunk_id(&c.chunk_id))
                .collect::<MetadataResult<Vec<i64>>>()?;

            let mut removed = 0;
            let mut tx = self.pool.begin().await?;
            for batch in ids.chunks(MAX_IN_CLAUSE) {
                let placeholders = vec!["?"; batch.len()].join(", ");
                let sql = format!("DELETE FROM old_chunks WHERE chunk_id IN ({placeholders})");
                let mut query = sqlx::query(&sql);
                for id in batch {
                    query = query.bind(*id);
                }
                removed += query.execute(&mut *tx).await?.rows_affected();
            }
            tx.commit().await?;
            Ok(removed)
        }
    }

    #[async_trait]
    impl ProjectRecordRepo for SqliteBackend {
        async fn generate_project_id(&self) -> MetadataResult<ProjectId> {
            let id: i64 =
                sqlx::query_scalar("INSERT INTO projects (current_end_version) VALUES (NULL) RETURNING id")
                    .fetch_one(&self.pool)
                    .await?;
            Ok(ProjectId::from_sequence(id)?)
        }

        async fn get_project_record(
            &self,
            project_id: &ProjectId,
        ) -> MetadataResult<Option<ProjectRecord>> {
            let row = sqlx::query_as::<_, ProjectRow>(
                "SELECT current_end_version, current_end_timestamp, pending_change_at
                 FROM projects WHERE id = ?1",
            )
            .bind(project_id.as_i64()?)
            .fetch_optional(&self.pool)
            .await?;
            row.map(|row| {
                Ok(ProjectRecord {
                    current_end_version: row.current_end_version,
                    current_end_timestamp: row.current_end_timestamp.map(from_millis).transpose()?,
                    pending_change_at: row.pending_change_at.map(from_millis).transpose()?,
                })
            })
            .transpose()
        }

        async fn update_project_record(
            &self,
            project_id: &ProjectId,
            end_version: Option<i64>,
            end_timestamp: Option<OffsetDateTime>,
            pending_change_at: Option<OffsetDateTime>,
        ) -> MetadataResult<()> {
            merge_project_record(
                &self.pool,
                project_id.as_i64()?,
                end_version,
                end_timestamp,
                pending_change_at,
            )
            .await
        }

        async fn clear_pending_change_at(&self, project_id: &ProjectId) -> MetadataResult<()> {
            sqlx::query("UPDATE projects SET pending_change_at = NULL WHERE id = ?1")
                .bind(project_id.as_i64()?)
                .execute(&self.pool)
                .await?;
            Ok(())
        }
    }
}

/// SQL schema for SQLite.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    current_end_version INTEGER,
    current_end_timestamp INTEGER,
    pending_change_at INTEGER
);

-- Chunk ids are allocated here; AUTOINCREMENT keeps them from being reused.
CREATE TABLE IF NOT EXISTS pending_chunks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL,
    start_version INTEGER NOT NULL,
    end_version INTEGER NOT NULL,
    end_timestamp INTEGER,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_pending_chunks_created_at ON pending_chunks(created_at);

CREATE TABLE IF NOT EXISTS chunks (
    id INTEGER PRIMARY KEY,
    project_id INTEGER NOT NULL,
    start_version INTEGER NOT NULL,
    end_version INTEGER NOT NULL,
    end_timestamp INTEGER,
    created_at INTEGER NOT NULL,
    CHECK (start_version <= end_version)
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_chunks_project_start ON chunks(project_id, start_version);
CREATE UNIQUE INDEX IF NOT EXISTS idx_chunks_project_end ON chunks(project_id, end_version);
CREATE INDEX IF NOT EXISTS idx_chunks_project_end_timestamp ON chunks(project_id, end_timestamp);

-- state is 'pending' for uploads claimed by garbage collection before
-- they were confirmed.
CREATE TABLE IF NOT EXISTS old_chunks (
    chunk_id INTEGER PRIMARY KEY,
    project_id INTEGER NOT NULL,
    state TEXT NOT NULL DEFAULT 'deleted' CHECK (state IN ('deleted', 'pending')),
    start_version INTEGER NOT NULL,
    end_version INTEGER NOT NULL,
    deleted_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_old_chunks_deleted_at ON old_chunks(deleted_at);
"#;
