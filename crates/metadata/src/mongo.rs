//! MongoDB document backend.
//!
//! Chunks live in a single `chunks` collection with a `state` field.
//! Uniqueness of active version ranges is enforced by partial unique
//! indexes, and multi-document writes run in session transactions, so the
//! deployment must be a replica set.

use crate::error::{MetadataError, MetadataResult};
use crate::models::*;
use crate::repos::{ChunkRepo, OldChunkRepo, ProjectRecordRepo};
use crate::store::ChunkBackend;
use async_trait::async_trait;
use folio_core::{BackendKind, ChunkId, ProjectId};
use futures::TryStreamExt;
use mongodb::bson::{self, DateTime, Document, doc, oid::ObjectId};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{IndexOptions, ReadPreference, SelectionCriteria};
use mongodb::{Client, ClientSession, Collection, Database, IndexModel};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const CHUNKS: &str = "chunks";
const PROJECTS: &str = "projects";

const DUPLICATE_KEY: i32 = 11000;
const WRITE_CONFLICT: i32 = 112;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChunkDoc {
    #[serde(rename = "_id")]
    id: ObjectId,
    project_id: ObjectId,
    state: ChunkState,
    start_version: i64,
    end_version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    end_timestamp: Option<DateTime>,
    updated_at: DateTime,
    /// Set when garbage collection claimed the chunk while still pending.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    abandoned: bool,
}

impl ChunkDoc {
    fn record(&self) -> MetadataResult<ChunkRecord> {
        Ok(ChunkRecord {
            id: ChunkId::new(self.id.to_hex()),
            start_version: self.start_version,
            end_version: self.end_version,
            end_timestamp: self.end_timestamp.map(bson_to_time).transpose()?,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectDoc {
    current_end_version: Option<i64>,
    current_end_timestamp: Option<DateTime>,
    pending_change_at: Option<DateTime>,
}

fn time_to_bson(ts: OffsetDateTime) -> DateTime {
    DateTime::from_millis(to_millis(ts))
}

fn bson_to_time(dt: DateTime) -> MetadataResult<OffsetDateTime> {
    from_millis(dt.timestamp_millis())
}

fn object_id(id: &str) -> MetadataResult<ObjectId> {
    ObjectId::parse_str(id).map_err(|_| MetadataError::NotFound(format!("document {id}")))
}

fn project_oid(project_id: &ProjectId) -> MetadataResult<ObjectId> {
    match project_id.backend_kind() {
        BackendKind::Document => object_id(project_id.as_str()),
        BackendKind::Relational => Err(MetadataError::Config(format!(
            "project {project_id} is not a document project"
        ))),
    }
}

fn error_code(err: &mongodb::error::Error) -> Option<i32> {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(e)) => Some(e.code),
        ErrorKind::Command(e) => Some(e.code),
        _ => None,
    }
}

/// Duplicate keys and transaction write conflicts are version conflicts;
/// anything else passes through.
fn map_write_error(project_id: &ProjectId, err: mongodb::error::Error) -> MetadataError {
    match error_code(&err) {
        Some(DUPLICATE_KEY) => {
            MetadataError::conflict(project_id, "an active chunk already covers this range")
        }
        Some(WRITE_CONFLICT) => {
            MetadataError::conflict(project_id, "concurrent write to the same chunk")
        }
        _ if err.contains_label("TransientTransactionError") => {
            MetadataError::conflict(project_id, format!("transaction aborted: {err}"))
        }
        _ => err.into(),
    }
}

/// `$set` fields moving a chunk from `from` to `to`.
fn set_state(from: ChunkState, to: ChunkState) -> MetadataResult<Document> {
    if !from.can_transition_to(to) {
        return Err(MetadataError::Internal(format!(
            "illegal chunk state transition {from} -> {to}"
        )));
    }
    Ok(doc! { "state": to.as_str(), "updatedAt": time_to_bson(now_millis()) })
}

fn project_record_update(
    end_version: Option<i64>,
    end_timestamp: Option<OffsetDateTime>,
    pending_change_at: Option<OffsetDateTime>,
) -> Option<Document> {
    let mut max = Document::new();
    if let Some(v) = end_version {
        max.insert("currentEndVersion", v);
    }
    if let Some(ts) = end_timestamp {
        max.insert("currentEndTimestamp", time_to_bson(ts));
    }
    let mut min = Document::new();
    if let Some(ts) = pending_change_at {
        min.insert("pendingChangeAt", time_to_bson(ts));
    }

    let mut update = Document::new();
    if !max.is_empty() {
        update.insert("$max", max);
    }
    if !min.is_empty() {
        update.insert("$min", min);
    }
    (!update.is_empty()).then_some(update)
}

/// MongoDB backend.
pub struct MongoBackend {
    client: Client,
    db: Database,
}

impl MongoBackend {
    /// Connect, then create indexes.
    pub async fn connect(uri: &str, database: &str) -> MetadataResult<Self> {
        let client = Client::with_uri_str(uri).await?;
        let db = client.database(database);
        let backend = Self { client, db };
        backend.migrate().await?;
        tracing::info!(database = database, "Connected to MongoDB chunk metadata backend");
        Ok(backend)
    }

    fn chunks(&self) -> Collection<ChunkDoc> {
        self.db.collection(CHUNKS)
    }

    fn projects(&self) -> Collection<Document> {
        self.db.collection(PROJECTS)
    }

    async fn find_chunks(
        &self,
        filter: Document,
        limit: Option<i64>,
    ) -> MetadataResult<Vec<ChunkRecord>> {
        let chunks = self.chunks();
        let mut find = chunks.find(filter).sort(doc! { "startVersion": 1 });
        if let Some(limit) = limit {
            find = find.limit(limit);
        }
        let docs: Vec<ChunkDoc> = find.await?.try_collect().await?;
        docs.iter().map(ChunkDoc::record).collect()
    }

    /// Commit the transaction if the body succeeded, abort it otherwise.
    async fn finish_transaction(
        &self,
        project_id: &ProjectId,
        session: &mut ClientSession,
        outcome: MetadataResult<()>,
    ) -> MetadataResult<()> {
        match outcome {
            Ok(()) => session
                .commit_transaction()
                .await
                .map_err(|e| map_write_error(project_id, e)),
            Err(e) => {
                if let Err(abort_err) = session.abort_transaction().await {
                    tracing::warn!(
                        project_id = %project_id,
                        error = %abort_err,
                        "Failed to abort MongoDB transaction"
                    );
                }
                Err(e)
            }
        }
    }

    /// Promote a pending chunk to active within a transaction.
    async fn activate_pending(
        &self,
        session: &mut ClientSession,
        project_id: &ProjectId,
        chunk_id: &ChunkId,
        range: &ChunkRange,
    ) -> MetadataResult<()> {
        let mut set = set_state(ChunkState::Pending, ChunkState::Active)?;
        set.insert("startVersion", range.start_version);
        set.insert("endVersion", range.end_version);
        if let Some(ts) = range.end_timestamp {
            set.insert("endTimestamp", time_to_bson(ts));
        }

        let result = self
            .chunks()
            .update_one(
                doc! {
                    "_id": object_id(chunk_id.as_str())?,
                    "projectId": project_oid(project_id)?,
                    "state": ChunkState::Pending.as_str(),
                },
                doc! { "$set": set },
            )
            .session(&mut *session)
            .await
            .map_err(|e| map_write_error(project_id, e))?;
        if result.matched_count != 1 {
            return Err(MetadataError::conflict(
                project_id,
                format!("pending chunk {chunk_id} no longer exists"),
            ));
        }
        Ok(())
    }

    async fn merge_project_record_in(
        &self,
        session: &mut ClientSession,
        project_id: &ProjectId,
        range: &ChunkRange,
        opts: &ConfirmOptions,
    ) -> MetadataResult<()> {
        if let Some(update) = project_record_update(
            Some(range.end_version),
            range.end_timestamp,
            opts.earliest_change_timestamp,
        ) {
            self.projects()
                .update_one(doc! { "_id": project_oid(project_id)? }, update)
                .upsert(true)
                .session(&mut *session)
                .await
                .map_err(|e| map_write_error(project_id, e))?;
        }
        Ok(())
    }

    async fn confirm_create_in(
        &self,
        session: &mut ClientSession,
        project_id: &ProjectId,
        chunk_id: &ChunkId,
        range: &ChunkRange,
        opts: &ConfirmOptions,
    ) -> MetadataResult<()> {
        if let Some(old_chunk_id) = &opts.old_chunk_id {
            // Touching the predecessor makes a concurrent replacement of it a
            // write conflict.
            let touched = self
                .chunks()
                .update_one(
                    doc! {
                        "_id": object_id(old_chunk_id.as_str())?,
                        "projectId": project_oid(project_id)?,
                        "state": ChunkState::Active.as_str(),
                        "endVersion": range.start_version - 1,
                    },
                    doc! { "$set": { "updatedAt": time_to_bson(now_millis()) } },
                )
                .session(&mut *session)
                .await
                .map_err(|e| map_write_error(project_id, e))?;
            if touched.matched_count != 1 {
                return Err(MetadataError::conflict(
                    project_id,
                    format!(
                        "chunk {old_chunk_id} is no longer the active chunk ending at {}",
                        range.start_version - 1
                    ),
                ));
            }
        }

        self.activate_pending(session, project_id, chunk_id, range)
            .await?;
        self.merge_project_record_in(session, project_id, range, opts)
            .await
    }

    async fn confirm_update_in(
        &self,
        session: &mut ClientSession,
        project_id: &ProjectId,
        old_chunk_id: &ChunkId,
        new_chunk_id: &ChunkId,
        range: &ChunkRange,
        opts: &ConfirmOptions,
    ) -> MetadataResult<()> {
        let retired = self
            .chunks()
            .find_one_and_update(
                doc! {
                    "_id": object_id(old_chunk_id.as_str())?,
                    "projectId": project_oid(project_id)?,
                    "state": ChunkState::Active.as_str(),
                },
                doc! { "$set": set_state(ChunkState::Active, ChunkState::Deleted)? },
            )
            .session(&mut *session)
            .await
            .map_err(|e| map_write_error(project_id, e))?
            .ok_or_else(|| {
                MetadataError::conflict(project_id, format!("chunk {old_chunk_id} is not active"))
            })?;
        check_replacement(
            project_id,
            old_chunk_id,
            retired.start_version,
            retired.end_version,
            range,
        )?;

        let successor = self
            .chunks()
            .find_one(doc! {
                "projectId": project_oid(project_id)?,
                "state": ChunkState::Active.as_str(),
                "startVersion": { "$gt": retired.end_version },
            })
            .session(&mut *session)
            .await
            .map_err(|e| map_write_error(project_id, e))?;
        if let Some(successor) = successor {
            return Err(MetadataError::conflict(
                project_id,
                format!("chunk {old_chunk_id} is followed by chunk {}", successor.id),
            ));
        }

        self.activate_pending(session, project_id, new_chunk_id, range)
            .await?;
        self.merge_project_record_in(session, project_id, range, opts)
            .await
    }
}

#[async_trait]
impl ChunkBackend for MongoBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Document
    }

    fn backend_name(&self) -> &'static str {
        "mongodb"
    }

    async fn migrate(&self) -> MetadataResult<()> {
        let active_only = doc! { "state": ChunkState::Active.as_str() };
        let indexes = [
            IndexModel::builder()
                .keys(doc! { "projectId": 1, "startVersion": 1 })
                .options(
                    IndexOptions::builder()
                        .name("active_project_start".to_string())
                        .unique(true)
                        .partial_filter_expression(active_only.clone())
                        .build(),
                )
                .build(),
            IndexModel::builder()
                .keys(doc! { "projectId": 1, "endVersion": 1 })
                .options(
                    IndexOptions::builder()
                        .name("active_project_end".to_string())
                        .unique(true)
                        .partial_filter_expression(active_only)
                        .build(),
                )
                .build(),
            IndexModel::builder()
                .keys(doc! { "projectId": 1, "state": 1, "endTimestamp": 1 })
                .options(
                    IndexOptions::builder()
                        .name("project_state_end_timestamp".to_string())
                        .build(),
                )
                .build(),
            IndexModel::builder()
                .keys(doc! { "state": 1, "updatedAt": 1 })
                .options(IndexOptions::builder().name("state_updated_at".to_string()).build())
                .build(),
        ];
        self.chunks().create_indexes(indexes).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        self.db.run_command(doc! { "ping": 1 }).await?;
        Ok(())
    }
}

#[async_trait]
impl ChunkRepo for MongoBackend {
    async fn get_latest_chunk(
        &self,
        project_id: &ProjectId,
        read_only: bool,
    ) -> MetadataResult<Option<ChunkRecord>> {
        let chunks = self.chunks();
        let mut find = chunks
            .find_one(doc! {
                "projectId": project_oid(project_id)?,
                "state": ChunkState::Active.as_str(),
            })
            .sort(doc! { "endVersion": -1 });
        if read_only {
            find = find.selection_criteria(SelectionCriteria::ReadPreference(
                ReadPreference::SecondaryPreferred {
                    options: Default::default(),
                },
            ));
        }
        find.await?.as_ref().map(ChunkDoc::record).transpose()
    }

    async fn get_chunk_for_version(
        &self,
        project_id: &ProjectId,
        version: i64,
    ) -> MetadataResult<Option<ChunkRecord>> {
        self.chunks()
            .find_one(doc! {
                "projectId": project_oid(project_id)?,
                "state": ChunkState::Active.as_str(),
                "startVersion": { "$lte": version },
                "endVersion": { "$gte": version },
            })
            .await?
            .as_ref()
            .map(ChunkDoc::record)
            .transpose()
    }

    async fn get_chunk_for_timestamp(
        &self,
        project_id: &ProjectId,
        timestamp: OffsetDateTime,
    ) -> MetadataResult<Option<ChunkRecord>> {
        let found = self
            .chunks()
            .find_one(doc! {
                "projectId": project_oid(project_id)?,
                "state": ChunkState::Active.as_str(),
                "endTimestamp": { "$gte": time_to_bson(timestamp) },
            })
            .sort(doc! { "startVersion": 1 })
            .await?;
        match found {
            Some(chunk) => Ok(Some(chunk.record()?)),
            None => self.get_latest_chunk(project_id, false).await,
        }
    }

    async fn get_project_chunk_ids(&self, project_id: &ProjectId) -> MetadataResult<Vec<ChunkId>> {
        Ok(self
            .get_project_chunks(project_id)
            .await?
            .into_iter()
            .map(|record| record.id)
            .collect())
    }

    async fn get_project_chunks(&self, project_id: &ProjectId) -> MetadataResult<Vec<ChunkRecord>> {
        self.find_chunks(
            doc! {
                "projectId": project_oid(project_id)?,
                "state": ChunkState::Active.as_str(),
            },
            None,
        )
        .await
    }

    async fn get_chunks_from_version(
        &self,
        project_id: &ProjectId,
        version: i64,
        limit: usize,
    ) -> MetadataResult<Vec<ChunkRecord>> {
        self.find_chunks(
            doc! {
                "projectId": project_oid(project_id)?,
                "state": ChunkState::Active.as_str(),
                "endVersion": { "$gte": version },
            },
            Some(limit as i64),
        )
        .await
    }

    async fn insert_pending_chunk(
        &self,
        project_id: &ProjectId,
        range: &ChunkRange,
    ) -> MetadataResult<ChunkId> {
        let chunk = ChunkDoc {
            id: ObjectId::new(),
            project_id: project_oid(project_id)?,
            state: ChunkState::Pending,
            start_version: range.start_version,
            end_version: range.end_version,
            end_timestamp: range.end_timestamp.map(time_to_bson),
            updated_at: time_to_bson(now_millis()),
            abandoned: false,
        };
        self.chunks().insert_one(&chunk).await?;
        Ok(ChunkId::new(chunk.id.to_hex()))
    }

    async fn confirm_create(
        &self,
        project_id: &ProjectId,
        chunk_id: &ChunkId,
        range: &ChunkRange,
        opts: &ConfirmOptions,
    ) -> MetadataResult<()> {
        let mut session = self.client.start_session().await?;
        session.start_transaction().await?;
        let outcome = self
            .confirm_create_in(&mut session, project_id, chunk_id, range, opts)
            .await;
        self.finish_transaction(project_id, &mut session, outcome).await
    }

    async fn confirm_update(
        &self,
        project_id: &ProjectId,
        old_chunk_id: &ChunkId,
        new_chunk_id: &ChunkId,
        range: &ChunkRange,
        opts: &ConfirmOptions,
    ) -> MetadataResult<()> {
        let mut session = self.client.start_session().await?;
        session.start_transaction().await?;
        let outcome = self
            .confirm_update_in(
                &mut session,
                project_id,
                old_chunk_id,
                new_chunk_id,
                range,
                opts,
            )
            .await;
        self.finish_transaction(project_id, &mut session, outcome).await
    }

    async fn delete_chunk(&self, project_id: &ProjectId, chunk_id: &ChunkId) -> MetadataResult<()> {
        let result = self
            .chunks()
            .update_one(
                doc! {
                    "_id": object_id(chunk_id.as_str())?,
                    "projectId": project_oid(project_id)?,
                    "state": ChunkState::Active.as_str(),
                },
                doc! { "$set": set_state(ChunkState::Active, ChunkState::Deleted)? },
            )
            .await?;
        if result.matched_count == 0 {
            return Err(MetadataError::NotFound(format!(
                "chunk {chunk_id} in project {project_id}"
            )));
        }
        Ok(())
    }

    async fn delete_project_chunks(&self, project_id: &ProjectId) -> MetadataResult<u64> {
        let result = self
            .chunks()
            .update_many(
                doc! {
                    "projectId": project_oid(project_id)?,
                    "state": ChunkState::Active.as_str(),
                },
                doc! { "$set": set_state(ChunkState::Active, ChunkState::Deleted)? },
            )
            .await?;
        Ok(result.modified_count)
    }
}

#[async_trait]
impl OldChunkRepo for MongoBackend {
    async fn get_old_chunks_batch(
        &self,
        limit: usize,
        cutoff: OffsetDateTime,
    ) -> MetadataResult<Vec<OldChunk>> {
        let cutoff = time_to_bson(cutoff);
        // Claimed pending chunks can no longer be confirmed. updatedAt is
        // kept so the chunk's age is unchanged.
        let mut claim = set_state(ChunkState::Pending, ChunkState::Deleted)?;
        claim.remove("updatedAt");
        claim.insert("abandoned", true);
        self.chunks()
            .update_many(
                doc! {
                    "state": ChunkState::Pending.as_str(),
                    "updatedAt": { "$lte": cutoff },
                },
                doc! { "$set": claim },
            )
            .await?;

        let docs: Vec<ChunkDoc> = self
            .chunks()
            .find(doc! {
                "state": ChunkState::Deleted.as_str(),
                "updatedAt": { "$lte": cutoff },
            })
            .sort(doc! { "updatedAt": 1 })
            .limit(limit as i64)
            .await?
            .try_collect()
            .await?;

        docs.into_iter()
            .map(|chunk| {
                Ok(OldChunk {
                    project_id: ProjectId::parse(&chunk.project_id.to_hex())?,
                    chunk_id: ChunkId::new(chunk.id.to_hex()),
                    state: if chunk.abandoned {
                        ChunkState::Pending
                    } else {
                        chunk.state
                    },
                    start_version: chunk.start_version,
                    end_version: chunk.end_version,
                    deleted_at: bson_to_time(chunk.updated_at)?,
                })
            })
            .collect()
    }

    async fn delete_old_chunks(&self, chunks: &[OldChunk]) -> MetadataResult<u64> {
        let ids = chunks
            .iter()
            .map(|c| object_id(c.chunk_id.as_str()))
            .collect::<MetadataResult<Vec<ObjectId>>>()?;
        if ids.is_empty() {
            return Ok(0);
        }
        let result = self
            .chunks()
            .delete_many(doc! {
                "_id": { "$in": ids },
                "state": { "$ne": ChunkState::Active.as_str() },
            })
            .await?;
        Ok(result.deleted_count)
    }
}

#[async_trait]
impl ProjectRecordRepo for MongoBackend {
    async fn generate_project_id(&self) -> MetadataResult<ProjectId> {
        let id = ObjectId::new();
        self.projects().insert_one(doc! { "_id": id }).await?;
        Ok(ProjectId::parse(&id.to_hex())?)
    }

    async fn get_project_record(
        &self,
        project_id: &ProjectId,
    ) -> MetadataResult<Option<ProjectRecord>> {
        let Some(raw) = self
            .projects()
            .find_one(doc! { "_id": project_oid(project_id)? })
            .await?
        else {
            return Ok(None);
        };
        let project: ProjectDoc = bson::from_document(raw)
            .map_err(|e| MetadataError::Internal(format!("malformed project {project_id}: {e}")))?;
        Ok(Some(ProjectRecord {
            current_end_version: project.current_end_version,
            current_end_timestamp: project.current_end_timestamp.map(bson_to_time).transpose()?,
            pending_change_at: project.pending_change_at.map(bson_to_time).transpose()?,
        }))
    }

    async fn update_project_record(
        &self,
        project_id: &ProjectId,
        end_version: Option<i64>,
        end_timestamp: Option<OffsetDateTime>,
        pending_change_at: Option<OffsetDateTime>,
    ) -> MetadataResult<()> {
        let Some(update) = project_record_update(end_version, end_timestamp, pending_change_at)
        else {
            return Ok(());
        };
        self.projects()
            .update_one(doc! { "_id": project_oid(project_id)? }, update)
            .upsert(true)
            .await?;
        Ok(())
    }

    async fn clear_pending_change_at(&self, project_id: &ProjectId) -> MetadataResult<()> {
        self.projects()
            .update_one(
                doc! { "_id": project_oid(project_id)? },
                doc! { "$unset": { "pendingChangeAt": "" } },
            )
            .await?;
        Ok(())
    }
}
