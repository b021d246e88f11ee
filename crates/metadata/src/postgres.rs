//! PostgreSQL relational backend.

use crate::error::{MetadataError, MetadataResult};
use crate::models::*;
use crate::repos::{ChunkRepo, OldChunkRepo, ProjectRecordRepo};
use crate::store::ChunkBackend;
use async_trait::async_trait;
use folio_core::{BackendKind, ChunkId, ProjectId};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{FromRow, Pool, Postgres};
use std::str::FromStr;
use time::OffsetDateTime;

/// PostgreSQL schema (embedded).
const POSTGRES_SCHEMA: &str = include_str!("postgres_schema.sql");

/// Retries for project id allocation when a manually inserted id collides
/// with the sequence.
const PROJECT_ID_ATTEMPTS: usize = 5;

const CHUNK_COLUMNS: &str = "id, start_version, end_version, end_timestamp";

fn postgres_schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                return None;
            }
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    // 23505 = unique_violation
    matches!(err, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505"))
}

/// PostgreSQL backend with an optional read replica.
pub struct PostgresBackend {
    pool: Pool<Postgres>,
    read_pool: Option<Pool<Postgres>>,
}

impl PostgresBackend {
    /// Connect to a primary (and optionally a replica) and migrate.
    pub async fn from_url(
        url: &str,
        replica_url: Option<&str>,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let pool = Self::connect(
            PgConnectOptions::from_str(url)?,
            max_connections,
            statement_timeout_ms,
        )
        .await?;

        let read_pool = match replica_url {
            Some(replica) => {
                tracing::info!("PostgreSQL read replica configured");
                Some(
                    Self::connect(
                        PgConnectOptions::from_str(replica)?,
                        max_connections,
                        statement_timeout_ms,
                    )
                    .await?,
                )
            }
            None => None,
        };

        let backend = Self { pool, read_pool };
        backend.migrate().await?;
        Ok(backend)
    }

    async fn connect(
        mut opts: PgConnectOptions,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Pool<Postgres>> {
        // Bounds hung queries, GC batches in particular.
        if let Some(timeout_ms) = statement_timeout_ms {
            opts = opts.options([("statement_timeout", format!("{}ms", timeout_ms))]);
            tracing::info!("PostgreSQL statement_timeout set to {}ms", timeout_ms);
        }

        Ok(PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?)
    }

    /// Get a reference to the primary connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    fn reader(&self, read_only: bool) -> &Pool<Postgres> {
        match (&self.read_pool, read_only) {
            (Some(replica), true) => replica,
            _ => &self.pool,
        }
    }
}

#[async_trait]
impl ChunkBackend for PostgresBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Relational
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn migrate(&self) -> MetadataResult<()> {
        // Prepared statements hold one statement each.
        for statement in postgres_schema_statements(POSTGRES_SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        if let Some(replica) = &self.read_pool {
            sqlx::query("SELECT 1").execute(replica).await?;
        }
        Ok(())
    }
}

#[derive(Debug, FromRow)]
struct ChunkRow {
    id: i64,
    start_version: i64,
    end_version: i64,
    end_timestamp: Option<OffsetDateTime>,
}

impl From<ChunkRow> for ChunkRecord {
    fn from(row: ChunkRow) -> Self {
        ChunkRecord {
            id: ChunkId::from(row.id),
            start_version: row.start_version,
            end_version: row.end_version,
            end_timestamp: row.end_timestamp,
        }
    }
}

#[derive(Debug, FromRow)]
struct OldChunkRow {
    chunk_id: i64,
    project_id: i64,
    state: String,
    start_version: i64,
    end_version: i64,
    deleted_at: OffsetDateTime,
}

#[derive(Debug, FromRow)]
struct ProjectRow {
    current_end_version: Option<i64>,
    current_end_timestamp: Option<OffsetDateTime>,
    pending_change_at: Option<OffsetDateTime>,
}

async fn merge_project_record<'e, E>(
    executor: E,
    project_id: i64,
    end_version: Option<i64>,
    end_timestamp: Option<OffsetDateTime>,
    pending_change_at: Option<OffsetDateTime>,
) -> MetadataResult<()>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    // GREATEST/LEAST ignore NULLs.
    sqlx::query(
        r#"
        INSERT INTO projects (id, current_end_version, current_end_timestamp, pending_change_at)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (id) DO UPDATE SET
            current_end_version = GREATEST(projects.current_end_version, EXCLUDED.current_end_version),
            current_end_timestamp = GREATEST(projects.current_end_timestamp, EXCLUDED.current_end_timestamp),
            pending_change_at = LEAST(projects.pending_change_at, EXCLUDED.pending_change_at)
        "#,
    )
    .bind(project_id)
    .bind(end_version)
    .bind(end_timestamp)
    .bind(pending_change_at)
    .execute(executor)
    .await?;
    Ok(())
}

async fn take_pending_chunk(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    project_id: &ProjectId,
    chunk_id: i64,
) -> MetadataResult<()> {
    let removed = sqlx::query("DELETE FROM pending_chunks WHERE id = $1 AND project_id = $2")
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

async fn insert_active_chunk(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    project_id: &ProjectId,
    chunk_id: i64,
    range: &ChunkRange,
) -> MetadataResult<()> {
    let result = sqlx::query(
        r#"
        INSERT INTO chunks (id, project_id, start_version, end_version, end_timestamp, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(chunk_id)
    .bind(project_id.as_i64()?)
    .bind(range.start_version)
    .bind(range.end_version)
    .bind(range.end_timestamp)
    .bind(now_millis())
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

#[async_trait]
impl ChunkRepo for PostgresBackend {
    async fn get_latest_chunk(
        &self,
        project_id: &ProjectId,
        read_only: bool,
    ) -> MetadataResult<Option<ChunkRecord>> {
        let row = sqlx::query_as::<_, ChunkRow>(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks WHERE project_id = $1
             ORDER BY end_version DESC LIMIT 1"
        ))
        .bind(project_id.as_i64()?)
        .fetch_optional(self.reader(read_only))
        .await?;
        Ok(row.map(Into::into))
    }

    async fn get_chunk_for_version(
        &self,
        project_id: &ProjectId,
        version: i64,
    ) -> MetadataResult<Option<ChunkRecord>> {
        let row = sqlx::query_as::<_, ChunkRow>(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks
             WHERE project_id = $1 AND start_version <= $2 AND end_version >= $2
             LIMIT 1"
        ))
        .bind(project_id.as_i64()?)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn get_chunk_for_timestamp(
        &self,
        project_id: &ProjectId,
        timestamp: OffsetDateTime,
    ) -> MetadataResult<Option<ChunkRecord>> {
        let row = sqlx::query_as::<_, ChunkRow>(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks
             WHERE project_id = $1 AND end_timestamp >= $2
             ORDER BY start_version ASC LIMIT 1"
        ))
        .bind(project_id.as_i64()?)
        .bind(timestamp)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(row.into())),
            None => self.get_latest_chunk(project_id, false).await,
        }
    }

    async fn get_project_chunk_ids(&self, project_id: &ProjectId) -> MetadataResult<Vec<ChunkId>> {
        let ids: Vec<i64> =
            sqlx::query_scalar("SELECT id FROM chunks WHERE project_id = $1 ORDER BY start_version")
                .bind(project_id.as_i64()?)
                .fetch_all(&self.pool)
                .await?;
        Ok(ids.into_iter().map(ChunkId::from).collect())
    }

    async fn get_project_chunks(&self, project_id: &ProjectId) -> MetadataResult<Vec<ChunkRecord>> {
        let rows = sqlx::query_as::<_, ChunkRow>(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks WHERE project_id = $1 ORDER BY start_version"
        ))
        .bind(project_id.as_i64()?)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn get_chunks_from_version(
        &self,
        project_id: &ProjectId,
        version: i64,
        limit: usize,
    ) -> MetadataResult<Vec<ChunkRecord>> {
        let rows = sqlx::query_as::<_, ChunkRow>(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks
             WHERE project_id = $1 AND end_version >= $2
             ORDER BY start_version LIMIT $3"
        ))
        .bind(project_id.as_i64()?)
        .bind(version)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn insert_pending_chunk(
        &self,
        project_id: &ProjectId,
        range: &ChunkRange,
    ) -> MetadataResult<ChunkId> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO pending_chunks (project_id, start_version, end_version, end_timestamp, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(project_id.as_i64()?)
        .bind(range.start_version)
        .bind(range.end_version)
        .bind(range.end_timestamp)
        .bind(now_millis())
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
            // FOR SHARE keeps the predecessor from being replaced until commit.
            let old_end: Option<i64> = sqlx::query_scalar(
                "SELECT end_version FROM chunks WHERE id = $1 AND project_id = $2 FOR SHARE",
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
        let new_id = numeric_chunk_id(new_chunk_id)?;
        let mut tx = self.pool.begin().await?;

        let old = sqlx::query_as::<_, ChunkRow>(&format!(
            "DELETE FROM chunks WHERE id = $1 AND project_id = $2 RETURNING {CHUNK_COLUMNS}"
        ))
        .bind(numeric_chunk_id(old_chunk_id)?)
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
            "SELECT id FROM chunks WHERE project_id = $1 AND start_version > $2 LIMIT 1",
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
            r#"
            INSERT INTO old_chunks (chunk_id, project_id, start_version, end_version, deleted_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(old.id)
        .bind(pid)
        .bind(old.start_version)
        .bind(old.end_version)
        .bind(now_millis())
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

    async fn delete_chunk(&self, project_id: &ProjectId, chunk_id: &ChunkId) -> MetadataResult<()> {
        let moved = sqlx::query(
            r#"
            WITH moved AS (
                DELETE FROM chunks WHERE id = $1 AND project_id = $2
                RETURNING id, project_id, start_version, end_version
            )
            INSERT INTO old_chunks (chunk_id, project_id, start_version, end_version, deleted_at)
            SELECT id, project_id, start_version, end_version, $3 FROM moved
            "#,
        )
        .bind(numeric_chunk_id(chunk_id)?)
        .bind(project_id.as_i64()?)
        .bind(now_millis())
        .execute(&self.pool)
        .await?
        .rows_affected();
        if moved == 0 {
            return Err(MetadataError::NotFound(format!(
                "chunk {chunk_id} in project {project_id}"
            )));
        }
        Ok(())
    }

    async fn delete_project_chunks(&self, project_id: &ProjectId) -> MetadataResult<u64> {
        let moved = sqlx::query(
            r#"
            WITH moved AS (
                DELETE FROM chunks WHERE project_id = $1
                RETURNING id, project_id, start_version, end_version
            )
            INSERT INTO old_chunks (chunk_id, project_id, start_version, end_version, deleted_at)
            SELECT id, project_id, start_version, end_version, $2 FROM moved
            "#,
        )
        .bind(project_id.as_i64()?)
        .bind(now_millis())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(moved)
    }
}

#[async_trait]
impl OldChunkRepo for PostgresBackend {
    async fn get_old_chunks_batch(
        &self,
        limit: usize,
        cutoff: OffsetDateTime,
    ) -> MetadataResult<Vec<OldChunk>> {
        let mut tx = self.pool.begin().await?;

        // Claimed pending chunks can no longer be confirmed. Rows locked by
        // an in-flight confirm are skipped.
        sqlx::query(
            r#"
            WITH claimed AS (
                DELETE FROM pending_chunks WHERE id IN (
                    SELECT id FROM pending_chunks WHERE created_at <= $1
                    ORDER BY created_at LIMIT $2
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING id, project_id, start_version, end_version, created_at
            )
            INSERT INTO old_chunks (chunk_id, project_id, state, start_version, end_version, deleted_at)
            SELECT id, project_id, 'pending', start_version, end_version, created_at FROM claimed
            "#,
        )
        .bind(cutoff)
        .bind(limit as i64)
        .execute(&mut *tx)
        .await?;

        let rows = sqlx::query_as::<_, OldChunkRow>(
            r#"
            SELECT chunk_id, project_id, state, start_version, end_version, deleted_at
            FROM old_chunks WHERE deleted_at <= $1
            ORDER BY deleted_at
            LIMIT $2
            "#,
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
                    deleted_at: row.deleted_at,
                })
            })
            .collect()
    }

    async fn delete_old_chunks(&self, chunks: &[OldChunk]) -> MetadataResult<u64> {
        let ids = chunks
            .iter()
            .map(|c| numeric_chunk_id(&c.chunk_id))
            .collect::<MetadataResult<Vec<i64>>>()?;
        if ids.is_empty() {
            return Ok(0);
        }

        Ok(sqlx::query("DELETE FROM old_chunks WHERE chunk_id = ANY($1)")
            .bind(&ids[..])
            .execute(&self.pool)
            .await?
            .rows_affected())
    }
}

#[async_trait]
impl ProjectRecordRepo for PostgresBackend {
    async fn generate_project_id(&self) -> MetadataResult<ProjectId> {
        for attempt in 1..=PROJECT_ID_ATTEMPTS {
            match sqlx::query_scalar::<_, i64>("INSERT INTO projects DEFAULT VALUES RETURNING id")
                .fetch_one(&self.pool)
                .await
            {
                Ok(id) => return Ok(ProjectId::from_sequence(id)?),
                Err(e) if is_unique_violation(&e) => {
                    tracing::warn!(attempt, "Project id sequence collided, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(MetadataError::Internal(format!(
            "failed to allocate a project id after {PROJECT_ID_ATTEMPTS} attempts"
        )))
    }

    async fn get_project_record(
        &self,
        project_id: &ProjectId,
    ) -> MetadataResult<Option<ProjectRecord>> {
        let row = sqlx::query_as::<_, ProjectRow>(
            "SELECT current_end_version, current_end_timestamp, pending_change_at
             FROM projects WHERE id = $1",
        )
        .bind(project_id.as_i64()?)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| ProjectRecord {
            current_end_version: row.current_end_version,
            current_end_timestamp: row.current_end_timestamp,
            pending_change_at: row.pending_change_at,
        }))
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
        sqlx::query("UPDATE projects SET pending_change_at = NULL WHERE id = $1")
            .bind(project_id.as_i64()?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
