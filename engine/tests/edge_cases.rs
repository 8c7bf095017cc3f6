//! Edge case tests for ferry-engine
//!
//! These tests cover ordering, replay and schema drift at the store level.

use ferry_engine::{
    ChangeOp, ChangeStatus, ConflictDecision, ConflictResolver, ConflictStatus, DeploymentMode,
    EntityMapper, Error, FieldDef, FieldType, KindMapping, RemoteAck, RemoteBatch, RemoteChange,
    Store, StoreSnapshot, SyncIndicator, SyncStatus,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;

fn fields(value: Value) -> ferry_engine::Fields {
    value.as_object().cloned().unwrap()
}

fn remote(ext: &str, version: &str, edited_at: u64, value: Value) -> RemoteChange {
    RemoteChange {
        external_id: ext.into(),
        version: version.into(),
        edited_at,
        fields: fields(value),
        extras: Default::default(),
        field_times: BTreeMap::new(),
        deleted: false,
    }
}

fn ack(ext: &str, version: &str, edited_at: u64) -> RemoteAck {
    RemoteAck {
        external_id: ext.into(),
        version: version.into(),
        edited_at,
    }
}

/// Push every dispatchable entry, acknowledging with increasing versions.
fn drain(store: &mut Store, resolver: &ConflictResolver, now: &mut u64) -> Vec<(ChangeOp, Value)> {
    let mut pushed = Vec::new();
    loop {
        let ready = store.dispatchable(*now, 100);
        if ready.is_empty() {
            return pushed;
        }
        for id in ready {
            *now += 1;
            let task = store.claim(id, *now).unwrap();
            pushed.push((task.entry.op, Value::Object(task.entry.payload.clone())));
            let ext = task
                .external_id
                .clone()
                .unwrap_or_else(|| format!("ext-{}", task.entry.local_id));
            *now += 1;
            store
                .confirm(id, &ack(&ext, &format!("v{now}"), *now), resolver, *now)
                .unwrap();
        }
    }
}

// ============================================================================
// Ordering
// ============================================================================

#[test]
fn writes_reach_remote_in_enqueue_order() {
    let resolver = ConflictResolver::default();
    let mut store = Store::new();
    let mut now = 1000;

    let receipt = store.create("referrals", fields(json!({"n": 1})), now).unwrap();
    store.update(receipt.local_id, fields(json!({"n": 2})), now + 1).unwrap();
    store.update(receipt.local_id, fields(json!({"n": 3})), now + 2).unwrap();
    now += 10;

    let pushed = drain(&mut store, &resolver, &mut now);
    assert_eq!(
        pushed,
        vec![
            (ChangeOp::Create, json!({"n": 1})),
            (ChangeOp::Update, json!({"n": 2})),
            (ChangeOp::Update, json!({"n": 3})),
        ]
    );
    let entity = store.entity(receipt.local_id).unwrap();
    assert_eq!(entity.status, SyncStatus::Clean);
    assert_eq!(entity.fields, fields(json!({"n": 3})));
}

#[test]
fn claiming_out_of_order_is_refused() {
    let mut store = Store::new();
    let first = store.create("referrals", fields(json!({"n": 1})), 1).unwrap();
    let second = store.update(first.local_id, fields(json!({"n": 2})), 2).unwrap();

    let err = store.claim(second.change_id, 3).unwrap_err();
    assert!(matches!(err, Error::OutOfOrder { head: Some(h), .. } if h == first.change_id));
}

#[test]
fn entities_progress_independently() {
    let resolver = ConflictResolver::default();
    let mut store = Store::new();
    let a = store.create("referrals", fields(json!({"n": 1})), 1).unwrap();
    let b = store.create("referrals", fields(json!({"n": 2})), 2).unwrap();

    store.claim(a.change_id, 3).unwrap();
    // A is in flight, B is still claimable.
    assert_eq!(store.dispatchable(4, 10), vec![b.change_id]);
    store.claim(b.change_id, 4).unwrap();
    store
        .confirm(b.change_id, &ack("ext-b", "v1", 5), &resolver, 5)
        .unwrap();
    assert_eq!(store.entity(b.local_id).unwrap().status, SyncStatus::Clean);
    assert_eq!(store.entity(a.local_id).unwrap().status, SyncStatus::Pushing);
}

// ============================================================================
// Replay
// ============================================================================

#[test]
fn replayed_batch_is_idempotent() {
    let resolver = ConflictResolver::default();
    let mut store = Store::new();
    let mut batch = RemoteBatch::new("referrals");
    batch.changes.push(remote("ext-1", "v1", 10, json!({"n": 1})));
    batch.changes.push(remote("ext-2", "v1", 10, json!({"n": 2})));
    batch.cursor = Some("c1".into());

    store.apply_remote(batch.clone(), &resolver, 20).unwrap();
    let first = store.export_state();
    let report = store.apply_remote(batch, &resolver, 30).unwrap();

    assert_eq!(report.created, 0);
    assert_eq!(report.stale, 2);
    let second = store.export_state();
    assert_eq!(first.entities, second.entities);
    assert_eq!(first.outbox, second.outbox);
}

#[test]
fn older_remote_edit_never_overwrites_newer_state() {
    let resolver = ConflictResolver::default();
    let mut store = Store::new();
    let mut batch = RemoteBatch::new("referrals");
    batch.changes.push(remote("ext-1", "v2", 20, json!({"n": 2})));
    store.apply_remote(batch, &resolver, 25).unwrap();

    let mut batch = RemoteBatch::new("referrals");
    batch.changes.push(remote("ext-1", "v1", 10, json!({"n": 1})));
    let report = store.apply_remote(batch, &resolver, 30).unwrap();

    assert_eq!(report.stale, 1);
    let entity = store.find_by_external("referrals", "ext-1").unwrap();
    assert_eq!(entity.fields, fields(json!({"n": 2})));
}

#[test]
fn confirming_a_superseded_entry_is_a_noop() {
    let resolver = ConflictResolver::default();
    let mut store = Store::new();
    let mut batch = RemoteBatch::new("referrals");
    batch.changes.push(remote("ext-1", "v1", 10, json!({"a": 1, "b": 1})));
    store.apply_remote(batch, &resolver, 10).unwrap();
    let local_id = store.find_by_external("referrals", "ext-1").unwrap().local_id;

    let write = store
        .update(local_id, fields(json!({"a": 2, "b": 1})), 20)
        .unwrap();
    let mut batch = RemoteBatch::new("referrals");
    batch.changes.push(remote("ext-1", "v2", 25, json!({"a": 1, "b": 2})));
    store.apply_remote(batch, &resolver, 30).unwrap();

    assert_eq!(
        store.change(write.change_id).unwrap().status,
        ChangeStatus::Superseded
    );
    let committed = store
        .confirm(write.change_id, &ack("ext-1", "v9", 40), &resolver, 40)
        .unwrap();
    assert_eq!(committed.outcome, ferry_engine::Outcome::Duplicate);
}

// ============================================================================
// Conflicts
// ============================================================================

#[test]
fn external_first_mode_prefers_remote_without_ancestor() {
    let resolver = ConflictResolver::new(DeploymentMode::ExternalFirst);
    let mut store = Store::new();
    // Created locally, never synced: no ancestor.
    let receipt = store.create("referrals", fields(json!({"n": 1})), 100).unwrap();
    store.claim(receipt.change_id, 100).unwrap();
    store
        .confirm(receipt.change_id, &ack("ext-1", "v1", 100), &resolver, 100)
        .unwrap();
    store.update(receipt.local_id, fields(json!({"n": 2})), 200).unwrap();

    // Strip the ancestor through a snapshot to force record-level resolution.
    let mut snapshot = store.export_state();
    snapshot.entities.get_mut(&receipt.local_id).unwrap().base = None;
    let mut store = Store::from_snapshot(snapshot).unwrap();

    let mut batch = RemoteBatch::new("referrals");
    batch.changes.push(remote("ext-1", "v2", 200, json!({"n": 3})));
    store.apply_remote(batch, &resolver, 300).unwrap();

    let entity = store.entity(receipt.local_id).unwrap();
    assert_eq!(entity.fields, fields(json!({"n": 3})));
    assert_eq!(entity.status, SyncStatus::Clean);
}

#[test]
fn merged_decision_is_pushed() {
    let resolver = ConflictResolver::default();
    let mut store = Store::new();
    let mut batch = RemoteBatch::new("referrals");
    batch.changes.push(remote("ext-1", "v1", 10, json!({"status": "open"})));
    store.apply_remote(batch, &resolver, 10).unwrap();
    let local_id = store.find_by_external("referrals", "ext-1").unwrap().local_id;

    store
        .update(local_id, fields(json!({"status": "closed"})), 20)
        .unwrap();
    let mut batch = RemoteBatch::new("referrals");
    batch.changes.push(remote("ext-1", "v2", 30, json!({"status": "in_progress"})));
    store.apply_remote(batch, &resolver, 30).unwrap();

    let conflict = store.conflicts(Some(ConflictStatus::Unresolved))[0].clone();
    assert_eq!(conflict.fields, vec!["status".to_string()]);
    assert_eq!(conflict.ancestor, Some(fields(json!({"status": "open"}))));

    let committed = store
        .resolve_conflict(
            conflict.id,
            ConflictDecision::Merged(fields(json!({"status": "escalated"}))),
            40,
        )
        .unwrap();
    let task = store.claim(committed.change_ids[0], 50).unwrap();
    assert_eq!(task.entry.payload, fields(json!({"status": "escalated"})));
    assert_eq!(task.external_version.as_deref(), Some("v2"));
    assert_eq!(
        store.conflict(conflict.id).unwrap().status,
        ConflictStatus::ResolvedMerged
    );
}

#[test]
fn failed_entity_defers_remote_changes_until_retry() {
    let resolver = ConflictResolver::default();
    let mut store = Store::new();
    let mut batch = RemoteBatch::new("referrals");
    batch.changes.push(remote("ext-1", "v1", 10, json!({"a": 1, "b": 1})));
    store.apply_remote(batch, &resolver, 10).unwrap();
    let local_id = store.find_by_external("referrals", "ext-1").unwrap().local_id;

    let write = store
        .update(local_id, fields(json!({"a": 2, "b": 1})), 20)
        .unwrap();
    store.claim(write.change_id, 21).unwrap();
    store.give_up(write.change_id, "bad request", 22).unwrap();
    assert_eq!(store.sync_indicator(local_id).unwrap(), SyncIndicator::Failed);

    let mut batch = RemoteBatch::new("referrals");
    batch.changes.push(remote("ext-1", "v2", 30, json!({"a": 1, "b": 2})));
    let report = store.apply_remote(batch, &resolver, 30).unwrap();
    assert_eq!(report.deferred, 1);
    assert_eq!(store.entity(local_id).unwrap().status, SyncStatus::Failed);

    // The retry folds the deferred remote edit into the pending push.
    let committed = store.retry_failed(write.change_id, &resolver, 40).unwrap();
    assert_eq!(committed.change_ids.len(), 1);
    let task = store.claim(committed.change_ids[0], 41).unwrap();
    assert_eq!(task.entry.payload, fields(json!({"a": 2, "b": 2})));
}

// ============================================================================
// Schema drift
// ============================================================================

#[test]
fn extras_survive_a_pull_and_push_cycle() {
    let mapper = EntityMapper::new().with_kind(KindMapping::new(
        "referrals",
        1,
        vec![FieldDef::new("title", "Name", FieldType::Text)],
    ));
    let payload = json!({"Name": "Food", "Added later": 42});
    let local = mapper.to_local("referrals", &payload).unwrap();

    let resolver = ConflictResolver::default();
    let mut store = Store::new();
    let mut batch = RemoteBatch::new("referrals");
    batch.changes.push(RemoteChange {
        fields: local.fields,
        extras: local.extras,
        ..remote("ext-1", "v1", 10, json!({}))
    });
    store.apply_remote(batch, &resolver, 10).unwrap();
    let local_id = store.find_by_external("referrals", "ext-1").unwrap().local_id;

    let write = store
        .update(local_id, fields(json!({"title": "Food bank"})), 20)
        .unwrap();
    let task = store.claim(write.change_id, 21).unwrap();
    let outbound = mapper
        .to_external("referrals", &task.entry.payload, &task.extras)
        .unwrap();
    assert_eq!(outbound["Name"], json!("Food bank"));
    assert_eq!(outbound["Added later"], json!(42));
}

// ============================================================================
// Persistence
// ============================================================================

#[test]
fn invalid_snapshot_is_rejected() {
    let mut store = Store::new();
    let mut snapshot = StoreSnapshot::default();
    snapshot.format_version = 99;
    assert!(matches!(
        store.import_state(snapshot),
        Err(Error::InvalidSnapshot(_))
    ));
}
