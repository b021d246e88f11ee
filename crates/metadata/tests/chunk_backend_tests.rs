//! Behavior shared by every chunk metadata backend.

mod common;

use common::run_backend_test_all;
use folio_core::{ChunkId, ProjectId};
use folio_metadata::{ChunkBackend, ChunkRange, ChunkState, ConfirmOptions, MetadataError};
use std::sync::Arc;
use time::macros::datetime;
use time::{Duration, OffsetDateTime};

fn range(start: i64, end: i64, end_timestamp: Option<OffsetDateTime>) -> ChunkRange {
    ChunkRange {
        start_version: start,
        end_version: end,
        end_timestamp,
    }
}

fn far_future() -> OffsetDateTime {
    OffsetDateTime::now_utc() + Duration::days(1)
}

async fn active_chunk(
    backend: &Arc<dyn ChunkBackend>,
    project: &ProjectId,
    range: ChunkRange,
    predecessor: Option<&ChunkId>,
) -> ChunkId {
    let id = backend.insert_pending_chunk(project, &range).await.unwrap();
    let opts = ConfirmOptions {
        old_chunk_id: predecessor.cloned(),
        earliest_change_timestamp: None,
    };
    backend
        .confirm_create(project, &id, &range, &opts)
        .await
        .unwrap();
    id
}

fn assert_conflict<T: std::fmt::Debug>(result: Result<T, MetadataError>) {
    match result {
        Err(MetadataError::VersionConflict { .. }) => {}
        other => panic!("expected version conflict, got {other:?}"),
    }
}

#[tokio::test]
async fn test_create_and_lookup() {
    run_backend_test_all(|backend| async move {
        let project = backend.generate_project_id().await.unwrap();
        assert!(backend.get_latest_chunk(&project, false).await.unwrap().is_none());

        let ts = datetime!(2024-03-01 10:00:00.250 UTC);
        let id = active_chunk(&backend, &project, range(0, 2, Some(ts)), None).await;

        let latest = backend.get_latest_chunk(&project, true).await.unwrap().unwrap();
        assert_eq!(latest.id, id);
        assert_eq!((latest.start_version, latest.end_version), (0, 2));
        assert_eq!(latest.end_timestamp, Some(ts));

        let at = backend.get_chunk_for_version(&project, 1).await.unwrap();
        assert_eq!(at.map(|c| c.id), Some(id.clone()));
        assert!(backend.get_chunk_for_version(&project, 3).await.unwrap().is_none());

        assert_eq!(backend.get_project_chunk_ids(&project).await.unwrap(), vec![id]);

        let record = backend.get_project_record(&project).await.unwrap().unwrap();
        assert_eq!(record.current_end_version, Some(2));
        assert_eq!(record.current_end_timestamp, Some(ts));
    })
    .await;
}

#[tokio::test]
async fn test_pending_chunks_are_invisible() {
    run_backend_test_all(|backend| async move {
        let project = backend.generate_project_id().await.unwrap();
        backend
            .insert_pending_chunk(&project, &range(0, 4, None))
            .await
            .unwrap();

        assert!(backend.get_latest_chunk(&project, false).await.unwrap().is_none());
        assert!(backend.get_chunk_for_version(&project, 2).await.unwrap().is_none());
        assert!(backend.get_project_chunks(&project).await.unwrap().is_empty());
    })
    .await;
}

#[tokio::test]
async fn test_append_chain_and_ordering() {
    run_backend_test_all(|backend| async move {
        let project = backend.generate_project_id().await.unwrap();
        let a = active_chunk(&backend, &project, range(0, 2, None), None).await;
        let b = active_chunk(&backend, &project, range(3, 5, None), Some(&a)).await;
        let c = active_chunk(&backend, &project, range(6, 6, None), Some(&b)).await;

        let chunks = backend.get_project_chunks(&project).await.unwrap();
        let starts: Vec<i64> = chunks.iter().map(|c| c.start_version).collect();
        assert_eq!(starts, vec![0, 3, 6]);
        assert_eq!(chunks[2].id, c);

        let page = backend.get_chunks_from_version(&project, 4, 1).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, b);

        let rest = backend.get_chunks_from_version(&project, 4, 10).await.unwrap();
        assert_eq!(rest.len(), 2);
    })
    .await;
}

#[tokio::test]
async fn test_concurrent_create_at_same_start_conflicts() {
    run_backend_test_all(|backend| async move {
        let project = backend.generate_project_id().await.unwrap();
        let first = backend
            .insert_pending_chunk(&project, &range(0, 3, None))
            .await
            .unwrap();
        let second = backend
            .insert_pending_chunk(&project, &range(0, 5, None))
            .await
            .unwrap();

        backend
            .confirm_create(&project, &first, &range(0, 3, None), &ConfirmOptions::default())
            .await
            .unwrap();
        assert_conflict(
            backend
                .confirm_create(&project, &second, &range(0, 5, None), &ConfirmOptions::default())
                .await,
        );

        let latest = backend.get_latest_chunk(&project, false).await.unwrap().unwrap();
        assert_eq!(latest.id, first);
    })
    .await;
}

#[tokio::test]
async fn test_append_after_stale_predecessor_conflicts() {
    run_backend_test_all(|backend| async move {
        let project = backend.generate_project_id().await.unwrap();
        let a = active_chunk(&backend, &project, range(0, 2, None), None).await;
        active_chunk(&backend, &project, range(3, 4, None), Some(&a)).await;

        // Predecessor ends at 2, but the append claims to start at 5.
        let late = backend
            .insert_pending_chunk(&project, &range(5, 6, None))
            .await
            .unwrap();
        let opts = ConfirmOptions {
            old_chunk_id: Some(a),
            earliest_change_timestamp: None,
        };
        assert_conflict(
            backend
                .confirm_create(&project, &late, &range(5, 6, None), &opts)
                .await,
        );
    })
    .await;
}

#[tokio::test]
async fn test_confirm_twice_conflicts() {
    run_backend_test_all(|backend| async move {
        let project = backend.generate_project_id().await.unwrap();
        let id = active_chunk(&backend, &project, range(0, 1, None), None).await;
        assert_conflict(
            backend
                .confirm_create(&project, &id, &range(0, 1, None), &ConfirmOptions::default())
                .await,
        );
    })
    .await;
}

#[tokio::test]
async fn test_update_replaces_chunk_atomically() {
    run_backend_test_all(|backend| async move {
        let project = backend.generate_project_id().await.unwrap();
        let old = active_chunk(&backend, &project, range(0, 2, None), None).await;

        let new = backend
            .insert_pending_chunk(&project, &range(0, 4, None))
            .await
            .unwrap();
        backend
            .confirm_update(&project, &old, &new, &range(0, 4, None), &ConfirmOptions::default())
            .await
            .unwrap();

        let latest = backend.get_latest_chunk(&project, false).await.unwrap().unwrap();
        assert_eq!(latest.id, new);
        assert_eq!(latest.end_version, 4);
        assert_eq!(backend.get_project_chunk_ids(&project).await.unwrap(), vec![new.clone()]);

        let old_chunks = backend.get_old_chunks_batch(100, far_future()).await.unwrap();
        let retired = old_chunks
            .iter()
            .find(|c| c.chunk_id == old)
            .expect("replaced chunk should await collection");
        assert_eq!(retired.state, ChunkState::Deleted);
        assert!(old_chunks.iter().all(|c| c.chunk_id != new));
    })
    .await;
}

#[tokio::test]
async fn test_update_of_replaced_chunk_conflicts() {
    run_backend_test_all(|backend| async move {
        let project = backend.generate_project_id().await.unwrap();
        let old = active_chunk(&backend, &project, range(0, 2, None), None).await;

        let winner = backend
            .insert_pending_chunk(&project, &range(0, 3, None))
            .await
            .unwrap();
        let loser = backend
            .insert_pending_chunk(&project, &range(0, 5, None))
            .await
            .unwrap();
        backend
            .confirm_update(&project, &old, &winner, &range(0, 3, None), &ConfirmOptions::default())
            .await
            .unwrap();
        assert_conflict(
            backend
                .confirm_update(&project, &old, &loser, &range(0, 5, None), &ConfirmOptions::default())
                .await,
        );

        let latest = backend.get_latest_chunk(&project, false).await.unwrap().unwrap();
        assert_eq!(latest.id, winner);

        // The rejected replacement stays pending and is collectable.
        let pending = backend.get_old_chunks_batch(100, far_future()).await.unwrap();
        let abandoned = pending.iter().find(|c| c.chunk_id == loser).unwrap();
        assert_eq!(abandoned.state, ChunkState::Pending);
    })
    .await;
}

#[tokio::test]
async fn test_update_must_keep_start_version() {
    run_backend_test_all(|backend| async move {
        let project = backend.generate_project_id().await.unwrap();
        let old = active_chunk(&backend, &project, range(0, 2, None), None).await;
        let shifted = backend
            .insert_pending_chunk(&project, &range(1, 4, None))
            .await
            .unwrap();
        assert_conflict(
            backend
                .confirm_update(&project, &old, &shifted, &range(1, 4, None), &ConfirmOptions::default())
                .await,
        );
        let latest = backend.get_latest_chunk(&project, false).await.unwrap().unwrap();
        assert_eq!(latest.id, old);
    })
    .await;
}

#[tokio::test]
async fn test_update_of_non_latest_chunk_conflicts() {
    run_backend_test_all(|backend| async move {
        let project = backend.generate_project_id().await.unwrap();
        let first = active_chunk(&backend, &project, range(0, 0, None), None).await;
        let middle = active_chunk(&backend, &project, range(1, 5, None), Some(&first)).await;
        let last = active_chunk(&backend, &project, range(6, 8, None), Some(&middle)).await;

        let overlapping = backend
            .insert_pending_chunk(&project, &range(1, 7, None))
            .await
            .unwrap();
        assert_conflict(
            backend
                .confirm_update(
                    &project,
                    &middle,
                    &overlapping,
                    &range(1, 7, None),
                    &ConfirmOptions::default(),
                )
                .await,
        );

        assert_eq!(
            backend.get_project_chunk_ids(&project).await.unwrap(),
            vec![first, middle.clone(), last.clone()]
        );
        let at_seven = backend.get_chunk_for_version(&project, 7).await.unwrap().unwrap();
        assert_eq!(at_seven.id, last);
        let at_three = backend.get_chunk_for_version(&project, 3).await.unwrap().unwrap();
        assert_eq!(at_three.id, middle);
    })
    .await;
}

#[tokio::test]
async fn test_update_must_not_shrink_chunk() {
    run_backend_test_all(|backend| async move {
        let project = backend.generate_project_id().await.unwrap();
        let first = active_chunk(&backend, &project, range(0, 0, None), None).await;
        let old = active_chunk(&backend, &project, range(1, 5, None), Some(&first)).await;

        let shorter = backend
            .insert_pending_chunk(&project, &range(1, 3, None))
            .await
            .unwrap();
        assert_conflict(
            backend
                .confirm_update(&project, &old, &shorter, &range(1, 3, None), &ConfirmOptions::default())
                .await,
        );

        let latest = backend.get_latest_chunk(&project, false).await.unwrap().unwrap();
        assert_eq!(latest.id, old);
        assert_eq!(latest.end_version, 5);
        let at_five = backend.get_chunk_for_version(&project, 5).await.unwrap().unwrap();
        assert_eq!(at_five.id, old);
    })
    .await;
}

#[tokio::test]
async fn test_claimed_pending_chunk_cannot_be_confirmed() {
    run_backend_test_all(|backend| async move {
        let project = backend.generate_project_id().await.unwrap();
        let first = active_chunk(&backend, &project, range(0, 0, None), None).await;
        let pending = backend
            .insert_pending_chunk(&project, &range(1, 3, None))
            .await
            .unwrap();

        // The collector fetches a batch while the upload is still unconfirmed.
        let batch = backend.get_old_chunks_batch(100, far_future()).await.unwrap();
        let claimed = batch.iter().find(|c| c.chunk_id == pending).unwrap();
        assert_eq!(claimed.state, ChunkState::Pending);

        let opts = ConfirmOptions {
            old_chunk_id: Some(first.clone()),
            earliest_change_timestamp: None,
        };
        assert_conflict(
            backend
                .confirm_create(&project, &pending, &range(1, 3, None), &opts)
                .await,
        );

        let latest = backend.get_latest_chunk(&project, false).await.unwrap().unwrap();
        assert_eq!(latest.id, first);
        assert!(backend.get_chunk_for_version(&project, 1).await.unwrap().is_none());

        assert_eq!(backend.delete_old_chunks(&batch).await.unwrap(), 1);
        assert!(backend.get_old_chunks_batch(100, far_future()).await.unwrap().is_empty());
    })
    .await;
}

#[tokio::test]
async fn test_timestamp_lookup() {
    run_backend_test_all(|backend| async move {
        let project = backend.generate_project_id().await.unwrap();
        let t1 = datetime!(2024-01-01 00:00:00 UTC);
        let t3 = datetime!(2024-01-03 00:00:00 UTC);
        let a = active_chunk(&backend, &project, range(0, 2, Some(t1)), None).await;
        let b = active_chunk(&backend, &project, range(3, 5, Some(t3)), Some(&a)).await;

        let lookup = |ts: OffsetDateTime| {
            let backend = backend.clone();
            let project = project.clone();
            async move {
                backend
                    .get_chunk_for_timestamp(&project, ts)
                    .await
                    .unwrap()
                    .map(|c| c.id)
            }
        };
        assert_eq!(lookup(datetime!(2023-12-31 00:00:00 UTC)).await, Some(a.clone()));
        assert_eq!(lookup(t1).await, Some(a));
        assert_eq!(lookup(datetime!(2024-01-02 00:00:00 UTC)).await, Some(b.clone()));
        // Past the end of history, the latest chunk answers.
        assert_eq!(lookup(datetime!(2024-02-01 00:00:00 UTC)).await, Some(b));
    })
    .await;
}

#[tokio::test]
async fn test_delete_chunk_and_project() {
    run_backend_test_all(|backend| async move {
        let project = backend.generate_project_id().await.unwrap();
        let a = active_chunk(&backend, &project, range(0, 2, None), None).await;
        let b = active_chunk(&backend, &project, range(3, 5, None), Some(&a)).await;

        backend.delete_chunk(&project, &b).await.unwrap();
        match backend.delete_chunk(&project, &b).await {
            Err(MetadataError::NotFound(_)) => {}
            other => panic!("expected not found, got {other:?}"),
        }
        let latest = backend.get_latest_chunk(&project, false).await.unwrap().unwrap();
        assert_eq!(latest.id, a);

        assert_eq!(backend.delete_project_chunks(&project).await.unwrap(), 1);
        assert!(backend.get_latest_chunk(&project, false).await.unwrap().is_none());
        assert_eq!(backend.delete_project_chunks(&project).await.unwrap(), 0);
    })
    .await;
}

#[tokio::test]
async fn test_old_chunk_batches_respect_cutoff_and_never_return_active() {
    run_backend_test_all(|backend| async move {
        let project = backend.generate_project_id().await.unwrap();
        let kept = active_chunk(&backend, &project, range(0, 2, None), None).await;

        let other = backend.generate_project_id().await.unwrap();
        let gone = active_chunk(&backend, &other, range(0, 1, None), None).await;
        backend.delete_project_chunks(&other).await.unwrap();
        let abandoned = backend
            .insert_pending_chunk(&other, &range(2, 3, None))
            .await
            .unwrap();

        let long_ago = OffsetDateTime::now_utc() - Duration::days(1);
        assert!(backend.get_old_chunks_batch(100, long_ago).await.unwrap().is_empty());

        let batch = backend.get_old_chunks_batch(100, far_future()).await.unwrap();
        let ids: Vec<&ChunkId> = batch.iter().map(|c| &c.chunk_id).collect();
        assert!(ids.contains(&&gone));
        assert!(ids.contains(&&abandoned));
        assert!(!ids.contains(&&kept));
        assert!(batch.iter().all(|c| c.state.is_collectable()));
        assert!(batch.iter().all(|c| c.project_id == other));

        let limited = backend.get_old_chunks_batch(1, far_future()).await.unwrap();
        assert_eq!(limited.len(), 1);

        assert_eq!(backend.delete_old_chunks(&batch).await.unwrap(), 2);
        assert!(backend.get_old_chunks_batch(100, far_future()).await.unwrap().is_empty());
        // Deleting again is a no-op.
        assert_eq!(backend.delete_old_chunks(&batch).await.unwrap(), 0);

        let latest = backend.get_latest_chunk(&project, false).await.unwrap().unwrap();
        assert_eq!(latest.id, kept);
    })
    .await;
}

#[tokio::test]
async fn test_project_record_merges_high_water_marks() {
    run_backend_test_all(|backend| async move {
        let project = backend.generate_project_id().await.unwrap();
        let early = datetime!(2024-05-01 00:00:00 UTC);
        let late = datetime!(2024-05-02 00:00:00 UTC);

        backend
            .update_project_record(&project, Some(10), Some(late), Some(late))
            .await
            .unwrap();
        backend
            .update_project_record(&project, Some(4), Some(early), Some(early))
            .await
            .unwrap();

        let record = backend.get_project_record(&project).await.unwrap().unwrap();
        assert_eq!(record.current_end_version, Some(10));
        assert_eq!(record.current_end_timestamp, Some(late));
        assert_eq!(record.pending_change_at, Some(early));

        backend
            .update_project_record(&project, None, None, None)
            .await
            .unwrap();
        backend.clear_pending_change_at(&project).await.unwrap();
        let record = backend.get_project_record(&project).await.unwrap().unwrap();
        assert_eq!(record.current_end_version, Some(10));
        assert_eq!(record.pending_change_at, None);
    })
    .await;
}

#[tokio::test]
async fn test_confirm_records_pending_change() {
    run_backend_test_all(|backend| async move {
        let project = backend.generate_project_id().await.unwrap();
        let changed_at = datetime!(2024-06-01 12:00:00.5 UTC);
        let id = backend
            .insert_pending_chunk(&project, &range(0, 0, Some(changed_at)))
            .await
            .unwrap();
        let opts = ConfirmOptions {
            old_chunk_id: None,
            earliest_change_timestamp: Some(changed_at),
        };
        backend
            .confirm_create(&project, &id, &range(0, 0, Some(changed_at)), &opts)
            .await
            .unwrap();

        let record = backend.get_project_record(&project).await.unwrap().unwrap();
        assert_eq!(record.current_end_version, Some(0));
        assert_eq!(record.pending_change_at, Some(changed_at));
    })
    .await;
}
