//! In-memory reference store.
//!
//! Holds entities, the change log, conflicts, cursors and mapping
//! diagnostics. Every public mutation loads the affected [`Ledger`], applies
//! one transition and writes the result back, so a failed call leaves the
//! store untouched. Batch operations keep a [`Checkpoint`] of the ledgers
//! they touch and roll back to it if any record in the batch fails.

use crate::{
    change::{ChangeLogEntry, ChangeOp, ChangeStatus},
    conflict::{ConflictDecision, ConflictRecord, ConflictResolver, ConflictStatus},
    entity::{RemoteAck, RemoteChange, SyncIndicator, SyncStatus, SyncableEntity},
    error::Result,
    ledger::{Effects, Ledger, Outcome, PushTask},
    snapshot::{Sequences, StoreSnapshot},
    ChangeId, ConflictId, EntityKind, Error, ExternalId, Fields, LocalId, Timestamp,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Position in a kind's remote change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCursor {
    pub kind: EntityKind,
    /// Opaque watermark from the feed; `None` forces a full sync
    pub token: Option<String>,
    pub updated_at: Timestamp,
}

/// A remote record the mapper could not translate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingDiagnostic {
    pub id: u64,
    pub kind: EntityKind,
    pub external_id: Option<ExternalId>,
    /// The full raw payload, kept for inspection
    pub payload: Value,
    pub error: String,
    pub detected_at: Timestamp,
}

/// A rejected record on its way into the diagnostics table.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedRecord {
    pub external_id: Option<ExternalId>,
    pub payload: Value,
    pub error: String,
}

/// One page of remote changes, applied atomically together with its cursor.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RemoteBatch {
    pub kind: EntityKind,
    pub changes: Vec<RemoteChange>,
    pub rejected: Vec<RejectedRecord>,
    /// New cursor token; `None` leaves the cursor as it is
    pub cursor: Option<String>,
}

impl RemoteBatch {
    pub fn new(kind: impl Into<EntityKind>) -> Self {
        Self {
            kind: kind.into(),
            ..Default::default()
        }
    }
}

/// Counts from applying a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullReport {
    pub created: usize,
    pub applied: usize,
    pub stale: usize,
    pub deferred: usize,
    pub auto_resolved: usize,
    pub conflicts: usize,
    pub rejected: usize,
    pub tombstoned: usize,
}

impl PullReport {
    /// Tally the outcome of one applied record.
    pub fn count(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::RemoteApplied => self.applied += 1,
            Outcome::Stale => self.stale += 1,
            Outcome::Deferred | Outcome::ConflictRefreshed => self.deferred += 1,
            Outcome::AutoResolved => self.auto_resolved += 1,
            Outcome::ConflictOpened => self.conflicts += 1,
            _ => {}
        }
    }

    pub fn merge(&mut self, other: PullReport) {
        self.created += other.created;
        self.applied += other.applied;
        self.stale += other.stale;
        self.deferred += other.deferred;
        self.auto_resolved += other.auto_resolved;
        self.conflicts += other.conflicts;
        self.rejected += other.rejected;
        self.tombstoned += other.tombstoned;
    }
}

/// Result of a local write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteReceipt {
    pub local_id: LocalId,
    pub change_id: ChangeId,
}

/// Outcome of a store mutation plus ids of the rows it inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed {
    pub outcome: Outcome,
    pub change_ids: Vec<ChangeId>,
    pub conflict_id: Option<ConflictId>,
}

/// Pre-images of what a batch has touched so far.
#[derive(Debug)]
struct Checkpoint {
    sequences: Sequences,
    kind: EntityKind,
    cursor: Option<SyncCursor>,
    ledgers: BTreeMap<LocalId, Ledger>,
}

/// The in-memory store.
#[derive(Debug, Clone, Default)]
pub struct Store {
    entities: BTreeMap<LocalId, SyncableEntity>,
    outbox: BTreeMap<ChangeId, ChangeLogEntry>,
    conflicts: BTreeMap<ConflictId, ConflictRecord>,
    cursors: BTreeMap<EntityKind, SyncCursor>,
    diagnostics: BTreeMap<u64, MappingDiagnostic>,
    by_external: BTreeMap<(EntityKind, ExternalId), LocalId>,
    sequences: Sequences,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    // === Ledger plumbing ===

    fn load(&self, local_id: LocalId) -> Result<Ledger> {
        let entity = self
            .entities
            .get(&local_id)
            .cloned()
            .ok_or(Error::EntityNotFound(local_id))?;
        let open = self
            .outbox
            .values()
            .filter(|e| e.local_id == local_id && e.status.is_open())
            .cloned()
            .collect();
        let conflict = self
            .conflicts
            .values()
            .find(|c| c.local_id == local_id && c.status == ConflictStatus::Unresolved)
            .cloned();
        Ok(Ledger::new(entity, open, conflict))
    }

    fn save(&mut self, ledger: Ledger, effects: Effects) -> Committed {
        let Ledger {
            entity,
            open,
            conflict,
        } = ledger;

        self.reindex(&entity);
        self.entities.insert(entity.local_id, entity);
        for entry in open {
            self.outbox.insert(entry.id, entry);
        }
        if let Some(conflict) = conflict {
            self.conflicts.insert(conflict.id, conflict);
        }

        let mut change_ids = Vec::with_capacity(effects.changes.len());
        for draft in effects.changes {
            self.sequences.change_id += 1;
            let id = self.sequences.change_id;
            self.outbox.insert(id, draft.into_entry(id));
            change_ids.push(id);
        }

        let conflict_id = effects.conflict.map(|draft| {
            self.sequences.conflict_id += 1;
            let id = self.sequences.conflict_id;
            self.conflicts.insert(id, draft.into_record(id));
            id
        });

        Committed {
            outcome: effects.outcome,
            change_ids,
            conflict_id,
        }
    }

    fn with_ledger<F>(&mut self, local_id: LocalId, f: F) -> Result<Committed>
    where
        F: FnOnce(&mut Ledger) -> Result<Effects>,
    {
        let mut ledger = self.load(local_id)?;
        let effects = f(&mut ledger)?;
        Ok(self.save(ledger, effects))
    }

    /// Point the external id index at `entity`, dropping a replaced id.
    fn reindex(&mut self, entity: &SyncableEntity) {
        let replaced = self
            .entities
            .get(&entity.local_id)
            .is_some_and(|previous| previous.external_id != entity.external_id);
        if replaced {
            self.unindex(entity.local_id);
        }
        if let Some(external_id) = &entity.external_id {
            self.by_external
                .insert((entity.kind.clone(), external_id.clone()), entity.local_id);
        }
    }

    fn unindex(&mut self, local_id: LocalId) {
        let key = self.entities.get(&local_id).and_then(|e| {
            e.external_id
                .clone()
                .map(|external_id| (e.kind.clone(), external_id))
        });
        if let Some(key) = key {
            if self.by_external.get(&key) == Some(&local_id) {
                self.by_external.remove(&key);
            }
        }
    }

    fn entry(&self, change_id: ChangeId) -> Result<&ChangeLogEntry> {
        self.outbox
            .get(&change_id)
            .ok_or(Error::ChangeNotFound(change_id))
    }

    // === Local writes ===

    /// Insert a new entity together with its create entry.
    pub fn create(
        &mut self,
        kind: impl Into<EntityKind>,
        fields: Fields,
        now: Timestamp,
    ) -> Result<WriteReceipt> {
        self.sequences.local_id += 1;
        let local_id = self.sequences.local_id;
        let (ledger, effects) = Ledger::create(local_id, kind, fields, now);
        let committed = self.save(ledger, effects);
        Ok(WriteReceipt {
            local_id,
            change_id: committed.change_ids[0],
        })
    }

    pub fn update(&mut self, local_id: LocalId, fields: Fields, now: Timestamp) -> Result<WriteReceipt> {
        let committed = self.with_ledger(local_id, |l| l.local_update(fields, now))?;
        Ok(WriteReceipt {
            local_id,
            change_id: committed.change_ids[0],
        })
    }

    pub fn delete(&mut self, local_id: LocalId, now: Timestamp) -> Result<WriteReceipt> {
        let committed = self.with_ledger(local_id, |l| l.local_delete(now))?;
        Ok(WriteReceipt {
            local_id,
            change_id: committed.change_ids[0],
        })
    }

    // === Queries ===

    pub fn entity(&self, local_id: LocalId) -> Option<&SyncableEntity> {
        self.entities.get(&local_id)
    }

    pub fn entities(&self) -> impl Iterator<Item = &SyncableEntity> {
        self.entities.values()
    }

    pub fn find_by_external(&self, kind: &str, external_id: &str) -> Option<&SyncableEntity> {
        self.by_external
            .get(&(kind.to_string(), external_id.to_string()))
            .and_then(|id| self.entities.get(id))
    }

    pub fn change(&self, change_id: ChangeId) -> Option<&ChangeLogEntry> {
        self.outbox.get(&change_id)
    }

    /// All retained entries of an entity, oldest first.
    pub fn changes_for(&self, local_id: LocalId) -> Vec<&ChangeLogEntry> {
        self.outbox
            .values()
            .filter(|e| e.local_id == local_id)
            .collect()
    }

    /// Head entries that may be claimed at `now`, oldest first.
    pub fn dispatchable(&self, now: Timestamp, limit: usize) -> Vec<ChangeId> {
        let mut seen = BTreeSet::new();
        let mut ready = Vec::new();
        for entry in self.outbox.values().filter(|e| e.status.is_open()) {
            if !seen.insert(entry.local_id) {
                continue;
            }
            let pending_push = self
                .entities
                .get(&entry.local_id)
                .is_some_and(|e| e.status == crate::SyncStatus::PendingPush);
            if pending_push && entry.is_due(now) {
                ready.push(entry.id);
                if ready.len() >= limit {
                    break;
                }
            }
        }
        ready
    }

    /// Head entry of one entity, if it may be claimed at `now`.
    pub fn dispatchable_for(&self, local_id: LocalId, now: Timestamp) -> Result<Option<ChangeId>> {
        Ok(self.load(local_id)?.dispatchable(now).map(|e| e.id))
    }

    pub fn sync_indicator(&self, local_id: LocalId) -> Result<SyncIndicator> {
        Ok(self.load(local_id)?.indicator())
    }

    pub fn open_change_count(&self) -> usize {
        self.outbox.values().filter(|e| e.status.is_open()).count()
    }

    // === Push lifecycle ===

    pub fn claim(&mut self, change_id: ChangeId, now: Timestamp) -> Result<PushTask> {
        let entry = self.entry(change_id)?;
        if !entry.status.is_open() {
            return Err(Error::InvalidChangeState {
                change_id,
                status: entry.status,
            });
        }
        let mut ledger = self.load(entry.local_id)?;
        let task = ledger.claim(change_id, now)?;
        self.save(ledger, Effects::outcome(Outcome::Claimed));
        Ok(task)
    }

    pub fn confirm(
        &mut self,
        change_id: ChangeId,
        ack: &RemoteAck,
        resolver: &ConflictResolver,
        now: Timestamp,
    ) -> Result<Committed> {
        let entry = self.entry(change_id)?;
        if entry.status != ChangeStatus::InFlight {
            return Ok(Committed {
                outcome: Outcome::Duplicate,
                change_ids: Vec::new(),
                conflict_id: None,
            });
        }
        let local_id = entry.local_id;
        let shadow = match entry.op {
            ChangeOp::Delete => None,
            _ => self.shadow_holding(&entry.kind, &ack.external_id, local_id)?,
        };

        let committed = self.with_ledger(local_id, |l| l.confirm(change_id, ack, now, resolver))?;
        if let Some(shadow) = shadow {
            self.entities.remove(&shadow);
        }
        Ok(committed)
    }

    /// The entity already bound to `external_id`, if it is only a pulled
    /// copy of the record that `local_id` created.
    ///
    /// A pull can list a freshly created record before the create's
    /// acknowledgement is recorded. Such a copy was never written locally.
    fn shadow_holding(
        &self,
        kind: &str,
        external_id: &str,
        local_id: LocalId,
    ) -> Result<Option<LocalId>> {
        let key = (kind.to_string(), external_id.to_string());
        let owner = match self.by_external.get(&key) {
            Some(&owner) if owner != local_id => owner,
            _ => return Ok(None),
        };
        let untouched = self
            .entities
            .get(&owner)
            .is_some_and(|e| e.status == SyncStatus::Clean)
            && !self.outbox.values().any(|e| e.local_id == owner)
            && !self.conflicts.values().any(|c| c.local_id == owner);
        if untouched {
            Ok(Some(owner))
        } else {
            Err(Error::ExternalIdTaken {
                external_id: external_id.to_string(),
                local_id: owner,
            })
        }
    }

    pub fn reschedule(
        &mut self,
        change_id: ChangeId,
        retry_at: Timestamp,
        error: &str,
        resolver: &ConflictResolver,
        now: Timestamp,
    ) -> Result<Committed> {
        let local_id = self.entry(change_id)?.local_id;
        self.with_ledger(local_id, |l| {
            l.reschedule(change_id, retry_at, error, now, resolver)
        })
    }

    pub fn give_up(&mut self, change_id: ChangeId, error: &str, now: Timestamp) -> Result<Committed> {
        let local_id = self.entry(change_id)?.local_id;
        self.with_ledger(local_id, |l| l.give_up(change_id, error, now))
    }

    /// Feed a single remote record to an existing entity (e.g. after a
    /// version conflict on push).
    pub fn observe_remote(
        &mut self,
        local_id: LocalId,
        remote: RemoteChange,
        resolver: &ConflictResolver,
        now: Timestamp,
    ) -> Result<Committed> {
        self.with_ledger(local_id, |l| l.observe_remote(remote, resolver, now))
    }

    // === Pull ===

    /// Apply one page of the change feed and advance the cursor with it.
    pub fn apply_remote(
        &mut self,
        batch: RemoteBatch,
        resolver: &ConflictResolver,
        now: Timestamp,
    ) -> Result<PullReport> {
        let kind = batch.kind.clone();
        self.staged(&kind, |store, checkpoint| {
            store.apply_batch(batch, resolver, now, checkpoint)
        })
    }

    /// Apply a complete listing of a kind. Local entities whose remote
    /// record is absent from the listing were deleted remotely.
    pub fn apply_full_sync(
        &mut self,
        batch: RemoteBatch,
        resolver: &ConflictResolver,
        now: Timestamp,
    ) -> Result<PullReport> {
        let kind = batch.kind.clone();
        let mut listed: BTreeSet<ExternalId> =
            batch.changes.iter().map(|c| c.external_id.clone()).collect();
        listed.extend(batch.rejected.iter().filter_map(|r| r.external_id.clone()));

        self.staged(&kind, |store, checkpoint| {
            let mut report = store.apply_batch(batch, resolver, now, checkpoint)?;

            let missing: Vec<LocalId> = store
                .entities
                .values()
                .filter(|e| e.kind == kind)
                .filter(|e| matches!(&e.external_id, Some(id) if !listed.contains(id)))
                .map(|e| e.local_id)
                .collect();
            for local_id in missing {
                let committed = store.with_staged_ledger(checkpoint, local_id, |l| {
                    l.remote_missing(resolver, now)
                })?;
                match committed.outcome {
                    Outcome::RemoteApplied => report.tombstoned += 1,
                    outcome => report.count(outcome),
                }
            }
            Ok(report)
        })
    }

    /// Run a batch, undoing everything it did if it fails part way.
    fn staged<F>(&mut self, kind: &str, f: F) -> Result<PullReport>
    where
        F: FnOnce(&mut Self, &mut Checkpoint) -> Result<PullReport>,
    {
        let mut checkpoint = Checkpoint {
            sequences: self.sequences,
            kind: kind.to_string(),
            cursor: self.cursors.get(kind).cloned(),
            ledgers: BTreeMap::new(),
        };
        let result = f(self, &mut checkpoint);
        if result.is_err() {
            self.rollback(checkpoint);
        }
        result
    }

    fn with_staged_ledger<F>(
        &mut self,
        checkpoint: &mut Checkpoint,
        local_id: LocalId,
        f: F,
    ) -> Result<Committed>
    where
        F: FnOnce(&mut Ledger) -> Result<Effects>,
    {
        let mut ledger = self.load(local_id)?;
        checkpoint
            .ledgers
            .entry(local_id)
            .or_insert_with(|| ledger.clone());
        let effects = f(&mut ledger)?;
        Ok(self.save(ledger, effects))
    }

    /// Restore the pre-images and drop every row created since the checkpoint.
    fn rollback(&mut self, checkpoint: Checkpoint) {
        let Checkpoint {
            sequences,
            kind,
            cursor,
            ledgers,
        } = checkpoint;

        self.outbox.retain(|id, _| *id <= sequences.change_id);
        self.conflicts.retain(|id, _| *id <= sequences.conflict_id);
        self.diagnostics.retain(|id, _| *id <= sequences.diagnostic_id);
        let created: Vec<LocalId> = self
            .entities
            .range(sequences.local_id + 1..)
            .map(|(id, _)| *id)
            .collect();
        for local_id in created {
            self.unindex(local_id);
            self.entities.remove(&local_id);
        }

        for (local_id, ledger) in ledgers {
            self.unindex(local_id);
            let Ledger {
                entity,
                open,
                conflict,
            } = ledger;
            self.reindex(&entity);
            self.entities.insert(local_id, entity);
            for entry in open {
                self.outbox.insert(entry.id, entry);
            }
            if let Some(conflict) = conflict {
                self.conflicts.insert(conflict.id, conflict);
            }
        }

        match cursor {
            Some(cursor) => {
                self.cursors.insert(kind, cursor);
            }
            None => {
                self.cursors.remove(&kind);
            }
        }
        self.sequences = sequences;
    }

    fn apply_batch(
        &mut self,
        batch: RemoteBatch,
        resolver: &ConflictResolver,
        now: Timestamp,
        checkpoint: &mut Checkpoint,
    ) -> Result<PullReport> {
        let mut report = PullReport::default();
        let RemoteBatch {
            kind,
            changes,
            rejected,
            cursor,
        } = batch;

        for remote in changes {
            let existing = self
                .by_external
                .get(&(kind.clone(), remote.external_id.clone()))
                .copied();
            match existing {
                Some(local_id) => {
                    let committed = self.with_staged_ledger(checkpoint, local_id, |l| {
                        l.observe_remote(remote, resolver, now)
                    })?;
                    report.count(committed.outcome);
                }
                None if remote.deleted => report.stale += 1,
                None => {
                    self.sequences.local_id += 1;
                    let ledger = Ledger::from_remote(self.sequences.local_id, kind.clone(), &remote, now);
                    self.save(ledger, Effects::outcome(Outcome::RemoteApplied));
                    report.created += 1;
                }
            }
        }

        for record in rejected {
            self.sequences.diagnostic_id += 1;
            let id = self.sequences.diagnostic_id;
            self.diagnostics.insert(
                id,
                MappingDiagnostic {
                    id,
                    kind: kind.clone(),
                    external_id: record.external_id,
                    payload: record.payload,
                    error: record.error,
                    detected_at: now,
                },
            );
            report.rejected += 1;
        }

        if let Some(token) = cursor {
            self.cursors.insert(
                kind.clone(),
                SyncCursor {
                    kind,
                    token: Some(token),
                    updated_at: now,
                },
            );
        }
        Ok(report)
    }

    pub fn cursor(&self, kind: &str) -> Option<&SyncCursor> {
        self.cursors.get(kind)
    }

    /// Forget a kind's cursor so the next pull is a full sync.
    pub fn reset_cursor(&mut self, kind: &str) {
        self.cursors.remove(kind);
    }

    pub fn diagnostics(&self) -> Vec<&MappingDiagnostic> {
        self.diagnostics.values().collect()
    }

    // === Admin ===

    pub fn conflicts(&self, status: Option<ConflictStatus>) -> Vec<&ConflictRecord> {
        self.conflicts
            .values()
            .filter(|c| status.map_or(true, |s| c.status == s))
            .collect()
    }

    pub fn conflict(&self, conflict_id: ConflictId) -> Option<&ConflictRecord> {
        self.conflicts.get(&conflict_id)
    }

    pub fn resolve_conflict(
        &mut self,
        conflict_id: ConflictId,
        decision: ConflictDecision,
        now: Timestamp,
    ) -> Result<Committed> {
        let conflict = self
            .conflicts
            .get(&conflict_id)
            .ok_or(Error::ConflictNotFound(conflict_id))?;
        if conflict.status != ConflictStatus::Unresolved {
            return Err(Error::ConflictAlreadyResolved(conflict_id));
        }
        let local_id = conflict.local_id;
        self.with_ledger(local_id, |l| l.resolve_manually(conflict_id, decision, now))
    }

    pub fn failed_changes(&self) -> Vec<&ChangeLogEntry> {
        self.outbox
            .values()
            .filter(|e| e.status == ChangeStatus::FailedPermanent)
            .collect()
    }

    pub fn retry_failed(
        &mut self,
        change_id: ChangeId,
        resolver: &ConflictResolver,
        now: Timestamp,
    ) -> Result<Committed> {
        let local_id = self.entry(change_id)?.local_id;
        self.with_ledger(local_id, |l| l.retry_failed(change_id, resolver, now))
    }

    // === Maintenance ===

    /// Return every in-flight entry to pending. Called once on start.
    pub fn recover(&mut self, resolver: &ConflictResolver, now: Timestamp) -> Result<usize> {
        let interrupted: BTreeSet<LocalId> = self
            .outbox
            .values()
            .filter(|e| e.status == ChangeStatus::InFlight)
            .map(|e| e.local_id)
            .collect();
        for local_id in &interrupted {
            self.with_ledger(*local_id, |l| l.recover(resolver, now))?;
        }
        Ok(interrupted.len())
    }

    /// Drop settled entries older than `retention` milliseconds.
    pub fn collect_garbage(&mut self, retention: u64, now: Timestamp) -> usize {
        let before = self.outbox.len();
        self.outbox.retain(|_, e| {
            !(e.status.is_collectable()
                && e.completed_at
                    .is_some_and(|at| at.saturating_add(retention) <= now))
        });
        before - self.outbox.len()
    }

    // === Persistence ===

    pub fn export_state(&self) -> StoreSnapshot {
        StoreSnapshot {
            sequences: self.sequences,
            entities: self.entities.clone(),
            outbox: self.outbox.clone(),
            conflicts: self.conflicts.clone(),
            cursors: self.cursors.clone(),
            diagnostics: self.diagnostics.clone(),
            ..Default::default()
        }
    }

    /// Replace all state with a snapshot.
    pub fn import_state(&mut self, snapshot: StoreSnapshot) -> Result<()> {
        snapshot.validate()?;

        let by_external = snapshot
            .entities
            .values()
            .filter_map(|e| {
                e.external_id
                    .clone()
                    .map(|ext| ((e.kind.clone(), ext), e.local_id))
            })
            .collect();

        *self = Self {
            entities: snapshot.entities,
            outbox: snapshot.outbox,
            conflicts: snapshot.conflicts,
            cursors: snapshot.cursors,
            diagnostics: snapshot.diagnostics,
            by_external,
            sequences: snapshot.sequences,
        };
        Ok(())
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Result<Self> {
        let mut store = Self::new();
        store.import_state(snapshot)?;
        Ok(store)
    }
}
