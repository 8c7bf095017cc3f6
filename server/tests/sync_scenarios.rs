//! End-to-end sync scenarios against a scripted external store.
//!
//! Time is paused: timers and rate-limit waits advance instantly.

mod common;

use common::{fields, harness, harness_with, options, run_for, FakeExternalStore, KIND};
use ferry_engine::{
    ChangeStatus, ConflictDecision, ConflictStatus, FailureKind, SyncIndicator, SyncStatus,
};
use ferry_engine::conflict::DELETED_FIELD;
use ferry_server::client::{ExternalApi, ExternalRequest, ExternalResponse};
use ferry_server::queue::Priority;
use ferry_server::store::{LocalStore, MemoryStore};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn referral(status: &str, notes: &str) -> ferry_engine::Fields {
    fields(json!({"status": status, "notes": notes, "score": 1}))
}

/// Create one entity and wait until it is confirmed remotely.
async fn synced(h: &common::Harness) -> u64 {
    let receipt = h.engine.record_create(KIND, referral("open", "a")).await.unwrap();
    run_for(3).await;
    let status = h.engine.sync_status(receipt.local_id).await.unwrap();
    assert_eq!(status.status, SyncStatus::Clean);
    receipt.local_id
}

// ============================================================================
// Push
// ============================================================================

#[tokio::test(start_paused = true)]
async fn offline_create_is_pushed_once_back_online() {
    let h = harness();
    h.remote.set_offline(true);
    h.engine.start().await.unwrap();

    let receipt = h.engine.record_create(KIND, referral("open", "a")).await.unwrap();
    run_for(2).await;

    let status = h.engine.sync_status(receipt.local_id).await.unwrap();
    assert_eq!(status.external_id, None);
    assert_eq!(status.indicator, SyncIndicator::RetryingSync);

    h.remote.set_offline(false);
    run_for(30).await;

    let status = h.engine.sync_status(receipt.local_id).await.unwrap();
    assert_eq!(status.status, SyncStatus::Clean);
    assert_eq!(status.indicator, SyncIndicator::Synced);
    assert_eq!(status.external_id.as_deref(), Some("rec_1"));
    assert_eq!(h.remote.applied_creates(), 1);
    assert_eq!(h.remote.record("rec_1").unwrap().properties["Status"], json!("open"));
}

#[tokio::test(start_paused = true)]
async fn writes_to_one_entity_reach_the_remote_in_order() {
    let h = harness();
    h.engine.start().await.unwrap();

    let receipt = h.engine.record_create(KIND, referral("open", "a")).await.unwrap();
    h.engine
        .record_update(receipt.local_id, referral("triaged", "a"))
        .await
        .unwrap();
    h.engine
        .record_update(receipt.local_id, referral("closed", "a"))
        .await
        .unwrap();
    run_for(10).await;

    assert_eq!(h.remote.writes(), vec!["create", "update", "update"]);
    assert_eq!(h.remote.record("rec_1").unwrap().properties["Status"], json!("closed"));
    let status = h.engine.sync_status(receipt.local_id).await.unwrap();
    assert_eq!(status.status, SyncStatus::Clean);
    assert_eq!(status.local_version, 3);
}

#[tokio::test(start_paused = true)]
async fn lost_response_is_replayed_with_the_same_token() {
    let h = harness();
    h.remote.lose_next_write();
    h.engine.start().await.unwrap();

    let receipt = h.engine.record_create(KIND, referral("open", "a")).await.unwrap();
    run_for(10).await;

    let creates: Vec<_> = h
        .remote
        .calls()
        .into_iter()
        .filter(|c| c.name == "create")
        .collect();
    assert_eq!(creates.len(), 2);
    assert_eq!(creates[0].idempotency_key, creates[1].idempotency_key);
    assert_eq!(h.remote.applied_creates(), 1);
    assert_eq!(h.remote.live_records().len(), 1);

    let status = h.engine.sync_status(receipt.local_id).await.unwrap();
    assert_eq!(status.status, SyncStatus::Clean);
    assert_eq!(status.external_id.as_deref(), Some("rec_1"));
}

#[tokio::test(start_paused = true)]
async fn local_delete_reaches_the_remote() {
    let h = harness();
    h.engine.start().await.unwrap();
    let local_id = synced(&h).await;

    h.engine.record_delete(local_id).await.unwrap();
    run_for(3).await;

    assert!(h.remote.record("rec_1").unwrap().deleted);
    let status = h.engine.sync_status(local_id).await.unwrap();
    assert!(status.deleted);
    assert_eq!(status.status, SyncStatus::Clean);
}

#[tokio::test(start_paused = true)]
async fn delete_of_a_record_already_gone_counts_as_done() {
    let h = harness();
    h.engine.start().await.unwrap();
    let local_id = synced(&h).await;

    h.remote.delete("rec_1");
    h.engine.record_delete(local_id).await.unwrap();
    run_for(3).await;

    let status = h.engine.sync_status(local_id).await.unwrap();
    assert_eq!(status.status, SyncStatus::Clean);
    assert!(h.engine.list_failed_operations().await.unwrap().is_empty());
}

// ============================================================================
// Pull
// ============================================================================

#[tokio::test(start_paused = true)]
async fn clean_pull_creates_and_updates_local_entities() {
    let h = harness();
    h.remote.seed("rec_a", json!({"Status": "open", "Notes": "x", "Score": 2}));
    h.remote.seed("rec_b", json!({"Status": "new", "Notes": "y", "Score": "5"}));
    h.remote.seed("rec_c", json!({"Status": "new"}));
    h.engine.start().await.unwrap();
    run_for(2).await;

    let snapshot = h.store.snapshot().await;
    assert_eq!(snapshot.entities.len(), 3);
    let b = snapshot
        .entities
        .values()
        .find(|e| e.external_id.as_deref() == Some("rec_b"))
        .unwrap();
    assert_eq!(b.fields["score"], json!(5));
    assert_eq!(b.status, SyncStatus::Clean);

    h.remote.edit("rec_b", json!({"Status": "closed"}));
    assert_eq!(h.engine.schedule_background_sync().await.unwrap(), 1);
    run_for(2).await;

    let status = h.engine.sync_status(b.local_id).await.unwrap();
    assert_eq!(status.fields["status"], json!("closed"));
    assert_eq!(status.status, SyncStatus::Clean);
    // Nothing to push back
    assert!(h.remote.writes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unmappable_record_lands_in_diagnostics() {
    let h = harness();
    h.remote.seed("rec_ok", json!({"Status": "open"}));
    h.remote.seed_raw(
        "rec_bad",
        json!({"id": "rec_bad", "version": "v9", "editedAt": 1, "properties": {"Status": 42}}),
    );
    h.engine.start().await.unwrap();
    run_for(2).await;

    let diagnostics = h.engine.list_diagnostics().await.unwrap();
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0].external_id.as_deref(), Some("rec_bad"));
    assert_eq!(diagnostics[0].payload["properties"]["Status"], json!(42));
    assert_eq!(h.store.snapshot().await.entities.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn remote_delete_tombstones_a_clean_entity() {
    let h = harness();
    h.engine.start().await.unwrap();
    let local_id = synced(&h).await;

    h.remote.delete("rec_1");
    h.engine.schedule_background_sync().await.unwrap();
    run_for(2).await;

    let status = h.engine.sync_status(local_id).await.unwrap();
    assert!(status.deleted);
    assert_eq!(status.status, SyncStatus::Clean);
}

#[tokio::test(start_paused = true)]
async fn expired_cursor_falls_back_to_full_sync() {
    let h = harness();
    h.remote.seed("rec_a", json!({"Status": "open"}));
    h.engine.start().await.unwrap();
    run_for(2).await;
    assert_eq!(h.remote.full_listings(), 1);

    h.remote.edit("rec_a", json!({"Status": "closed"}));
    h.remote.expire_cursors();
    h.engine.schedule_background_sync().await.unwrap();
    run_for(2).await;

    assert_eq!(h.remote.full_listings(), 2);
    let snapshot = h.store.snapshot().await;
    let entity = snapshot.entities.values().next().unwrap();
    assert_eq!(entity.fields["status"], json!("closed"));
    assert!(snapshot.cursors[KIND].token.is_some());
}

// ============================================================================
// Conflicts
// ============================================================================

#[tokio::test(start_paused = true)]
async fn disjoint_edits_merge_during_pull() {
    let h = harness();
    h.engine.start().await.unwrap();
    let local_id = synced(&h).await;

    h.remote.fail_writes(Some(FailureKind::ServerError(503)));
    h.engine.record_update(local_id, referral("open", "b")).await.unwrap();
    run_for(1).await;

    h.remote.edit("rec_1", json!({"Status": "closed"}));
    h.engine.schedule_background_sync().await.unwrap();
    run_for(1).await;

    h.remote.fail_writes(None);
    run_for(30).await;

    let remote = h.remote.record("rec_1").unwrap();
    assert_eq!(remote.properties["Status"], json!("closed"));
    assert_eq!(remote.properties["Notes"], json!("b"));

    let status = h.engine.sync_status(local_id).await.unwrap();
    assert_eq!(status.fields["status"], json!("closed"));
    assert_eq!(status.fields["notes"], json!("b"));
    assert_eq!(status.status, SyncStatus::Clean);
    assert!(h.engine.list_conflicts(None).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn version_conflict_refetches_and_merges() {
    let h = harness();
    h.engine.start().await.unwrap();
    let local_id = synced(&h).await;

    // Edited remotely behind our back; the push below carries a stale etag
    h.remote.edit("rec_1", json!({"Status": "closed"}));
    h.engine.record_update(local_id, referral("open", "b")).await.unwrap();
    run_for(5).await;

    let gets = h.remote.calls().iter().filter(|c| c.name == "get").count();
    assert_eq!(gets, 1);

    let remote = h.remote.record("rec_1").unwrap();
    assert_eq!(remote.properties["Status"], json!("closed"));
    assert_eq!(remote.properties["Notes"], json!("b"));
    let status = h.engine.sync_status(local_id).await.unwrap();
    assert_eq!(status.status, SyncStatus::Clean);
}

#[tokio::test(start_paused = true)]
async fn same_field_conflict_waits_for_an_operator() {
    let h = harness();
    h.engine.start().await.unwrap();
    let local_id = synced(&h).await;

    h.remote.edit("rec_1", json!({"Status": "archived"}));
    h.engine
        .record_update(local_id, referral("closed", "a"))
        .await
        .unwrap();
    run_for(5).await;

    let status = h.engine.sync_status(local_id).await.unwrap();
    assert_eq!(status.status, SyncStatus::Conflicted);
    assert_eq!(status.indicator, SyncIndicator::NeedsReview);

    let conflicts = h
        .engine
        .list_conflicts(Some(ConflictStatus::Unresolved))
        .await
        .unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].fields, vec!["status".to_string()]);
    assert_eq!(conflicts[0].remote.fields["status"], json!("archived"));

    // Nothing is pushed while the conflict is open
    run_for(5).await;
    assert_eq!(h.remote.record("rec_1").unwrap().properties["Status"], json!("archived"));

    h.engine
        .resolve_conflict(conflicts[0].id, ConflictDecision::TakeLocal)
        .await
        .unwrap();
    run_for(3).await;

    assert_eq!(h.remote.record("rec_1").unwrap().properties["Status"], json!("closed"));
    let status = h.engine.sync_status(local_id).await.unwrap();
    assert_eq!(status.status, SyncStatus::Clean);
    let resolved = h.engine.list_conflicts(None).await.unwrap();
    assert_eq!(resolved[0].status, ConflictStatus::ResolvedLocal);
}

#[tokio::test(start_paused = true)]
async fn edit_against_remote_delete_is_recreated_when_local_wins() {
    let h = harness();
    h.engine.start().await.unwrap();
    let local_id = synced(&h).await;

    // The edit cannot get out before the record is deleted remotely
    h.remote.fail_writes(Some(FailureKind::ServerError(503)));
    h.engine
        .record_update(local_id, referral("closed", "b"))
        .await
        .unwrap();
    run_for(1).await;
    h.remote.delete("rec_1");
    h.engine.schedule_background_sync().await.unwrap();
    run_for(3).await;

    let conflicts = h
        .engine
        .list_conflicts(Some(ConflictStatus::Unresolved))
        .await
        .unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].fields, vec![DELETED_FIELD.to_string()]);
    assert!(conflicts[0].remote.deleted);

    h.remote.fail_writes(None);
    h.engine
        .resolve_conflict(conflicts[0].id, ConflictDecision::TakeLocal)
        .await
        .unwrap();
    run_for(10).await;

    let status = h.engine.sync_status(local_id).await.unwrap();
    assert_eq!(status.status, SyncStatus::Clean);
    assert_eq!(status.external_id.as_deref(), Some("rec_2"));
    assert!(h.engine.list_failed_operations().await.unwrap().is_empty());
    assert_eq!(h.remote.writes().last(), Some(&"create"));

    let live = h.remote.live_records();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].id, "rec_2");
    assert_eq!(live[0].properties["Status"], json!("closed"));
    assert_eq!(live[0].properties["Notes"], json!("b"));

    // The new record comes back through the feed as one we already know
    h.engine.schedule_background_sync().await.unwrap();
    run_for(3).await;
    assert_eq!(h.store.snapshot().await.entities.len(), 1);
    let status = h.engine.sync_status(local_id).await.unwrap();
    assert_eq!(status.status, SyncStatus::Clean);
}

// ============================================================================
// Failure handling and recovery
// ============================================================================

#[tokio::test(start_paused = true)]
async fn failed_operation_can_be_retried() {
    let h = harness();
    h.remote.fail_next("create", FailureKind::BadRequest);
    h.engine.start().await.unwrap();

    let receipt = h.engine.record_create(KIND, referral("open", "a")).await.unwrap();
    run_for(2).await;

    let status = h.engine.sync_status(receipt.local_id).await.unwrap();
    assert_eq!(status.status, SyncStatus::Failed);
    assert_eq!(status.indicator, SyncIndicator::Failed);

    let failed = h.engine.list_failed_operations().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].status, ChangeStatus::FailedPermanent);
    assert_eq!(failed[0].id, receipt.change_id);

    h.engine
        .retry_failed_operation(receipt.change_id)
        .await
        .unwrap();
    run_for(2).await;

    let status = h.engine.sync_status(receipt.local_id).await.unwrap();
    assert_eq!(status.status, SyncStatus::Clean);
    assert!(h.engine.list_failed_operations().await.unwrap().is_empty());
    assert_eq!(h.remote.applied_creates(), 1);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_give_up_after_max_attempts() {
    let mut opts = options();
    opts.retry = opts.retry.with_max_attempts(3);
    let h = harness_with(Arc::new(MemoryStore::new()), FakeExternalStore::new(), opts);
    h.remote.fail_writes(Some(FailureKind::ServerError(500)));
    h.engine.start().await.unwrap();

    let receipt = h.engine.record_create(KIND, referral("open", "a")).await.unwrap();
    run_for(60).await;

    assert_eq!(h.remote.writes().len(), 3);
    let status = h.engine.sync_status(receipt.local_id).await.unwrap();
    assert_eq!(status.status, SyncStatus::Failed);
    let failed = h.engine.list_failed_operations().await.unwrap();
    assert_eq!(failed[0].attempts, 3);
    assert!(failed[0].last_error.as_deref().unwrap().contains("server error 500"));
}

#[tokio::test(start_paused = true)]
async fn interrupted_push_is_recovered_after_restart() {
    let remote = FakeExternalStore::new();
    let store = MemoryStore::new();
    let now = common::T0;

    // First run: the create was claimed and reached the remote, then the
    // process died before recording the acknowledgement.
    let receipt = store.create(KIND, referral("open", "a"), now).await.unwrap();
    let task = store.claim(receipt.change_id, now).await.unwrap();
    remote
        .send(ExternalRequest::Create {
            kind: KIND.to_string(),
            properties: fields(json!({"Status": "open", "Notes": "a", "Score": 1})),
            idempotency_key: task.entry.idempotency_token(),
        })
        .await
        .unwrap();
    let snapshot = store.snapshot().await;

    let restored = Arc::new(MemoryStore::from_snapshot(snapshot).unwrap());
    let h = harness_with(restored, remote, options());
    assert_eq!(h.engine.start().await.unwrap(), 1);
    run_for(3).await;

    let status = h.engine.sync_status(receipt.local_id).await.unwrap();
    assert_eq!(status.status, SyncStatus::Clean);
    assert_eq!(status.external_id.as_deref(), Some("rec_1"));
    assert_eq!(h.remote.applied_creates(), 1);
    assert_eq!(h.remote.live_records().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn restart_settles_pending_pushes_and_unapplied_remote_edits() {
    let remote = FakeExternalStore::new();
    remote.seed("ext_1", json!({"Status": "open", "Notes": "a", "Score": 1}));

    // First run: pull ext_1, then stop
    let store = Arc::new(MemoryStore::new());
    let first = harness_with(store.clone(), remote.clone(), options());
    first.engine.start().await.unwrap();
    run_for(2).await;
    first.engine.shutdown(Duration::from_secs(5)).await;

    let pulled = store
        .snapshot()
        .await
        .entities
        .values()
        .find(|e| e.external_id.as_deref() == Some("ext_1"))
        .map(|e| e.local_id)
        .unwrap();
    let cursor = store.cursor(KIND).await.unwrap().and_then(|c| c.token);
    assert!(cursor.is_some());

    // Local writes while nothing pushes. The first create was sent just
    // before the crash and its acknowledgement never landed.
    let now = common::T0;
    let sent = store.create(KIND, referral("open", "b"), now).await.unwrap();
    let task = store.claim(sent.change_id, now).await.unwrap();
    remote
        .send(ExternalRequest::Create {
            kind: KIND.to_string(),
            properties: fields(json!({"Status": "open", "Notes": "b", "Score": 1})),
            idempotency_key: task.entry.idempotency_token(),
        })
        .await
        .unwrap();
    let queued = store.create(KIND, referral("open", "c"), now).await.unwrap();
    store.update(pulled, referral("open", "local"), now).await.unwrap();

    // Remote edits past the stored cursor, fetched but never applied
    remote.edit("ext_1", json!({"Status": "closed"}));
    remote.seed("ext_2", json!({"Status": "new", "Notes": "d", "Score": 2}));
    let page = remote
        .send(ExternalRequest::Query {
            kind: KIND.to_string(),
            since: cursor.clone(),
            page: None,
        })
        .await
        .unwrap();
    assert!(matches!(page, ExternalResponse::Page(ref p) if !p.records.is_empty()));

    let snapshot = store.snapshot().await;
    assert_eq!(snapshot.cursors[KIND].token, cursor);

    let restored = Arc::new(MemoryStore::from_snapshot(snapshot).unwrap());
    let h = harness_with(restored, remote, options());
    assert_eq!(h.engine.start().await.unwrap(), 1);
    run_for(10).await;

    let entities = h.store.snapshot().await.entities;
    assert_eq!(entities.len(), 4);
    assert!(entities.values().all(|e| e.status == SyncStatus::Clean));
    assert_eq!(h.remote.applied_creates(), 2);
    assert_eq!(h.remote.live_records().len(), 4);

    let sent = h.engine.sync_status(sent.local_id).await.unwrap();
    assert_eq!(sent.external_id.as_deref(), Some("rec_1"));
    let queued = h.engine.sync_status(queued.local_id).await.unwrap();
    assert_eq!(queued.external_id.as_deref(), Some("rec_2"));

    let merged = h.remote.record("ext_1").unwrap();
    assert_eq!(merged.properties["Status"], json!("closed"));
    assert_eq!(merged.properties["Notes"], json!("local"));
    let ext_2 = entities
        .values()
        .find(|e| e.external_id.as_deref() == Some("ext_2"))
        .unwrap();
    assert_eq!(ext_2.fields["notes"], json!("d"));

    let seq = |token: Option<String>| token.and_then(|t| t.parse::<u64>().ok()).unwrap();
    let resumed = h.store.cursor(KIND).await.unwrap().and_then(|c| c.token);
    assert!(seq(resumed) > seq(cursor));
}

// ============================================================================
// Scheduling
// ============================================================================

#[tokio::test(start_paused = true)]
async fn request_budget_holds_under_load() {
    let h = harness();
    h.engine.start().await.unwrap();

    for i in 0..8 {
        h.engine
            .record_create(KIND, referral("open", &format!("n{i}")))
            .await
            .unwrap();
    }
    run_for(10).await;

    let calls = h.remote.calls();
    assert_eq!(h.remote.applied_creates(), 8);
    for window in calls.windows(4) {
        assert!(window[3].at - window[0].at >= Duration::from_secs(1));
    }
    let stats = h.engine.stats().await.unwrap();
    assert_eq!(stats.pushed, 8);
    assert_eq!(stats.open_changes, 0);
    assert!(stats.client.throttled > 0);
}

#[tokio::test(start_paused = true)]
async fn interactive_request_reports_where_the_entity_stands() {
    let h = harness();
    h.engine.start().await.unwrap();
    let local_id = synced(&h).await;

    let ticket = h.engine.request_sync(local_id, Priority::Interactive).await.unwrap();
    assert!(!ticket.queued);
    assert_eq!(ticket.change_id, None);
    assert_eq!(ticket.indicator, SyncIndicator::Synced);

    h.remote.set_offline(true);
    h.engine.record_update(local_id, referral("closed", "a")).await.unwrap();
    let ticket = h.engine.request_sync(local_id, Priority::Interactive).await.unwrap();
    assert_eq!(ticket.status, SyncStatus::PendingPush);
    assert_ne!(ticket.indicator, SyncIndicator::Synced);

    h.remote.set_offline(false);
    run_for(10).await;
    assert_eq!(h.remote.record("rec_1").unwrap().properties["Status"], json!("closed"));
}

#[tokio::test(start_paused = true)]
async fn shutdown_keeps_unpushed_changes_in_the_outbox() {
    let h = harness();
    h.remote.set_offline(true);
    h.engine.start().await.unwrap();

    h.engine.record_create(KIND, referral("open", "a")).await.unwrap();
    run_for(1).await;
    h.engine.shutdown(Duration::from_secs(5)).await;

    assert_eq!(h.store.open_change_count().await.unwrap(), 1);
    let snapshot = h.store.snapshot().await;
    assert_eq!(snapshot.open_change_count(), 1);
}
