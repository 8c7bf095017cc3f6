//! The per-entity unit of transaction.
//!
//! A [`Ledger`] holds one entity, its open change log entries (oldest first)
//! and its unresolved conflict, if any. Every sync state change is a method
//! on the ledger. Storage backends load a ledger, call exactly one method,
//! write the ledger back and persist the returned [`Effects`], all inside one
//! transaction. Both backends share this single implementation of the state
//! machine.
//!
//! # Ordering
//!
//! Only the head entry (lowest id among open entries) may be claimed, and
//! only while the entity is `PendingPush`. This gives at most one in-flight
//! entry per entity and strict enqueue order.

use crate::{
    change::{ChangeDraft, ChangeLogEntry, ChangeOp, ChangeStatus},
    conflict::{
        ConflictDecision, ConflictDraft, ConflictRecord, ConflictResolver, ConflictStatus,
        Resolution, VersionView,
    },
    entity::{RemoteAck, RemoteChange, SyncEvent, SyncIndicator, SyncStatus, SyncableEntity},
    error::Result,
    ChangeId, ConflictId, EntityKind, Error, ExternalId, Fields, LocalId, Timestamp,
};
use serde::{Deserialize, Serialize};

/// What a transition did, for callers and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Written,
    Claimed,
    Confirmed,
    /// The entry was already settled; nothing changed
    Duplicate,
    Rescheduled,
    GaveUp,
    RemoteApplied,
    /// The remote change carried nothing new
    Stale,
    /// Parked until the in-flight or failed push settles
    Deferred,
    AutoResolved,
    ConflictOpened,
    ConflictRefreshed,
    ManuallyResolved,
    Retried,
    Recovered,
}

/// Rows a transition asks storage to insert.
#[derive(Debug, Clone, PartialEq)]
pub struct Effects {
    pub changes: Vec<ChangeDraft>,
    pub conflict: Option<ConflictDraft>,
    pub outcome: Outcome,
}

impl Effects {
    /// Effects that insert nothing.
    pub fn outcome(outcome: Outcome) -> Self {
        Self {
            changes: Vec::new(),
            conflict: None,
            outcome,
        }
    }

    /// Fold effects of a follow-up transition into these, keeping our outcome.
    fn absorb(&mut self, other: Effects) {
        self.changes.extend(other.changes);
        if other.conflict.is_some() {
            self.conflict = other.conflict;
        }
    }
}

/// Everything a worker needs to send one entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushTask {
    pub entry: ChangeLogEntry,
    pub external_id: Option<ExternalId>,
    pub external_version: Option<String>,
    pub extras: Fields,
}

/// One entity with its open entries and unresolved conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct Ledger {
    pub entity: SyncableEntity,
    /// Open entries, ascending by id
    pub open: Vec<ChangeLogEntry>,
    pub conflict: Option<ConflictRecord>,
}

impl Ledger {
    pub fn new(
        entity: SyncableEntity,
        mut open: Vec<ChangeLogEntry>,
        conflict: Option<ConflictRecord>,
    ) -> Self {
        open.sort_by_key(|e| e.id);
        Self {
            entity,
            open,
            conflict,
        }
    }

    /// A locally created entity plus its create entry.
    pub fn create(
        local_id: LocalId,
        kind: impl Into<EntityKind>,
        fields: Fields,
        now: Timestamp,
    ) -> (Self, Effects) {
        let entity = SyncableEntity::new_local(local_id, kind, fields, now);
        let draft = ChangeDraft::new(
            local_id,
            entity.kind.clone(),
            ChangeOp::Create,
            entity.fields.clone(),
            entity.local_version,
            now,
        );
        let ledger = Self::new(entity, Vec::new(), None);
        let effects = Effects {
            changes: vec![draft],
            conflict: None,
            outcome: Outcome::Written,
        };
        (ledger, effects)
    }

    /// An entity first seen on the remote side.
    pub fn from_remote(
        local_id: LocalId,
        kind: impl Into<EntityKind>,
        remote: &RemoteChange,
        now: Timestamp,
    ) -> Self {
        Self::new(
            SyncableEntity::from_remote(local_id, kind, remote, now),
            Vec::new(),
            None,
        )
    }

    pub fn local_id(&self) -> LocalId {
        self.entity.local_id
    }

    /// The oldest open entry.
    pub fn head(&self) -> Option<&ChangeLogEntry> {
        self.open.iter().find(|e| e.status.is_open())
    }

    /// The head entry when it may be claimed at `now`.
    pub fn dispatchable(&self, now: Timestamp) -> Option<&ChangeLogEntry> {
        if self.entity.status != SyncStatus::PendingPush {
            return None;
        }
        self.head().filter(|e| e.is_due(now))
    }

    fn entry_mut(&mut self, change_id: ChangeId) -> Result<&mut ChangeLogEntry> {
        self.open
            .iter_mut()
            .find(|e| e.id == change_id)
            .ok_or(Error::ChangeNotFound(change_id))
    }

    fn has_open_create(&self) -> bool {
        self.open
            .iter()
            .any(|e| e.op == ChangeOp::Create && e.status.is_open())
    }

    fn draft(&self, op: ChangeOp, now: Timestamp) -> ChangeDraft {
        ChangeDraft::new(
            self.entity.local_id,
            self.entity.kind.clone(),
            op,
            self.entity.fields.clone(),
            self.entity.local_version,
            now,
        )
    }

    /// Replace the entity's fields with a local edit.
    pub fn local_update(&mut self, fields: Fields, now: Timestamp) -> Result<Effects> {
        if self.entity.deleted {
            return Err(Error::EntityDeleted(self.entity.local_id));
        }
        self.entity.transition(SyncEvent::LocalWrite)?;
        self.entity.write_fields(fields, now);

        let op = if self.entity.external_id.is_none() && !self.has_open_create() {
            ChangeOp::Create
        } else {
            ChangeOp::Update
        };
        Ok(Effects {
            changes: vec![self.draft(op, now)],
            conflict: None,
            outcome: Outcome::Written,
        })
    }

    /// Tombstone the entity locally.
    pub fn local_delete(&mut self, now: Timestamp) -> Result<Effects> {
        if self.entity.deleted {
            return Err(Error::EntityDeleted(self.entity.local_id));
        }
        self.entity.transition(SyncEvent::LocalWrite)?;
        self.entity.deleted = true;
        self.entity.local_version += 1;
        self.entity.updated_at = now;

        Ok(Effects {
            changes: vec![self.draft(ChangeOp::Delete, now)],
            conflict: None,
            outcome: Outcome::Written,
        })
    }

    /// Mark the head entry in flight.
    pub fn claim(&mut self, change_id: ChangeId, now: Timestamp) -> Result<PushTask> {
        let head = self.head().map(|e| e.id);
        if head != Some(change_id) {
            return Err(Error::OutOfOrder {
                local_id: self.entity.local_id,
                change_id,
                head,
            });
        }
        let status = self.entry_mut(change_id)?.status;
        if status != ChangeStatus::Pending {
            return Err(Error::InvalidChangeState { change_id, status });
        }
        self.entity.transition(SyncEvent::Claim)?;

        let entry = self.entry_mut(change_id)?;
        entry.status = ChangeStatus::InFlight;
        entry.attempts += 1;
        entry.first_attempt_at.get_or_insert(now);
        entry.next_attempt_at = None;
        let entry = entry.clone();

        Ok(PushTask {
            entry,
            external_id: self.entity.external_id.clone(),
            external_version: self.entity.external_version.clone(),
            extras: self.entity.extras.clone(),
        })
    }

    /// Record a successful push.
    ///
    /// Confirming an entry that is not in flight is a no-op, so a replayed
    /// acknowledgement never applies twice.
    pub fn confirm(
        &mut self,
        change_id: ChangeId,
        ack: &RemoteAck,
        now: Timestamp,
        resolver: &ConflictResolver,
    ) -> Result<Effects> {
        let Some(entry) = self
            .open
            .iter_mut()
            .find(|e| e.id == change_id && e.status == ChangeStatus::InFlight)
        else {
            return Ok(Effects::outcome(Outcome::Duplicate));
        };

        entry.status = ChangeStatus::Succeeded;
        entry.completed_at = Some(now);
        entry.last_error = None;
        let op = entry.op;
        let payload = entry.payload.clone();

        let more_pending = self
            .open
            .iter()
            .any(|e| e.id != change_id && e.status.is_open());
        self.entity
            .transition(SyncEvent::PushConfirmed { more_pending })?;

        let entity = &mut self.entity;
        if op != ChangeOp::Delete {
            entity.external_id = Some(ack.external_id.clone());
            entity.base = Some(payload);
        }
        entity.external_version = Some(ack.version.clone());
        entity.remote_edited_at = Some(ack.edited_at);
        entity.last_synced_at = Some(now);

        let mut effects = Effects::outcome(Outcome::Confirmed);
        if let Some(deferred) = self.entity.deferred_remote.take() {
            if deferred.edited_at > ack.edited_at {
                effects.absorb(self.observe_remote(deferred, resolver, now)?);
            }
        }
        Ok(effects)
    }

    /// Put an in-flight entry back in line after a transient failure.
    pub fn reschedule(
        &mut self,
        change_id: ChangeId,
        retry_at: Timestamp,
        error: impl Into<String>,
        now: Timestamp,
        resolver: &ConflictResolver,
    ) -> Result<Effects> {
        let entry = self.entry_mut(change_id)?;
        if entry.status != ChangeStatus::InFlight {
            return Err(Error::InvalidChangeState {
                change_id,
                status: entry.status,
            });
        }
        self.entity.transition(SyncEvent::PushRetry)?;

        let entry = self.entry_mut(change_id)?;
        entry.status = ChangeStatus::Pending;
        entry.next_attempt_at = Some(retry_at);
        entry.last_error = Some(error.into());

        let mut effects = Effects::outcome(Outcome::Rescheduled);
        if let Some(deferred) = self.entity.deferred_remote.take() {
            effects.absorb(self.observe_remote(deferred, resolver, now)?);
        }
        Ok(effects)
    }

    /// Stop retrying an in-flight entry; an operator has to step in.
    pub fn give_up(
        &mut self,
        change_id: ChangeId,
        error: impl Into<String>,
        now: Timestamp,
    ) -> Result<Effects> {
        let entry = self.entry_mut(change_id)?;
        if entry.status != ChangeStatus::InFlight {
            return Err(Error::InvalidChangeState {
                change_id,
                status: entry.status,
            });
        }
        self.entity.transition(SyncEvent::PushGaveUp)?;

        let entry = self.entry_mut(change_id)?;
        entry.status = ChangeStatus::FailedPermanent;
        entry.last_error = Some(error.into());
        entry.completed_at = Some(now);
        Ok(Effects::outcome(Outcome::GaveUp))
    }

    /// Apply a change observed on the remote side.
    pub fn observe_remote(
        &mut self,
        remote: RemoteChange,
        resolver: &ConflictResolver,
        now: Timestamp,
    ) -> Result<Effects> {
        if self.entity.is_stale(&remote) {
            return Ok(Effects::outcome(Outcome::Stale));
        }

        match self.entity.status {
            SyncStatus::Clean | SyncStatus::PendingPull => {
                self.entity.transition(SyncEvent::RemoteObserved)?;
                self.entity.adopt_remote(&remote, now);
                self.entity.transition(SyncEvent::RemoteApplied)?;
                Ok(Effects::outcome(Outcome::RemoteApplied))
            }
            SyncStatus::PendingPush => {
                self.entity.transition(SyncEvent::RemoteObserved)?;
                self.resolve_automatically(remote, resolver, now)
            }
            SyncStatus::Pushing | SyncStatus::Failed => {
                self.entity.transition(SyncEvent::RemoteObserved)?;
                self.defer(remote);
                Ok(Effects::outcome(Outcome::Deferred))
            }
            SyncStatus::Conflicted => {
                let open = self
                    .conflict
                    .as_mut()
                    .filter(|c| c.status == ConflictStatus::Unresolved);
                if let Some(conflict) = open {
                    conflict.remote = remote;
                    return Ok(Effects::outcome(Outcome::ConflictRefreshed));
                }
                self.defer(remote);
                Ok(Effects::outcome(Outcome::Deferred))
            }
        }
    }

    /// A full sync found no remote record for this entity.
    pub fn remote_missing(&mut self, resolver: &ConflictResolver, now: Timestamp) -> Result<Effects> {
        let Some(external_id) = self.entity.external_id.clone() else {
            return Ok(Effects::outcome(Outcome::Stale));
        };
        if self.entity.deleted && !self.entity.status.has_unpushed_changes() {
            return Ok(Effects::outcome(Outcome::Stale));
        }
        let tombstone = RemoteChange {
            external_id,
            version: format!("gone@{now}"),
            edited_at: now.max(self.entity.remote_edited_at.unwrap_or(0)),
            fields: self
                .entity
                .base
                .clone()
                .unwrap_or_else(|| self.entity.fields.clone()),
            extras: self.entity.extras.clone(),
            field_times: Default::default(),
            deleted: true,
        };
        self.observe_remote(tombstone, resolver, now)
    }

    fn defer(&mut self, remote: RemoteChange) {
        let newer = self
            .entity
            .deferred_remote
            .as_ref()
            .map_or(true, |known| remote.edited_at >= known.edited_at);
        if newer {
            self.entity.deferred_remote = Some(remote);
        }
    }

    fn resolve_automatically(
        &mut self,
        remote: RemoteChange,
        resolver: &ConflictResolver,
        now: Timestamp,
    ) -> Result<Effects> {
        let local = VersionView {
            fields: &self.entity.fields,
            updated_at: self.entity.updated_at,
            field_times: &self.entity.field_updated_at,
            deleted: self.entity.deleted,
        };
        let resolution = resolver.resolve(
            &self.entity.kind,
            &local,
            &VersionView::of_remote(&remote),
            self.entity.base.as_ref(),
        );

        let decision = match resolution {
            Resolution::TakeLocal => ConflictDecision::TakeLocal,
            Resolution::TakeRemote => ConflictDecision::TakeRemote,
            Resolution::Merge { fields } => ConflictDecision::Merged(fields),
            Resolution::Unresolvable { fields } => {
                let draft = ConflictDraft {
                    local_id: self.entity.local_id,
                    kind: self.entity.kind.clone(),
                    local: self.entity.fields.clone(),
                    local_deleted: self.entity.deleted,
                    ancestor: self.entity.base.clone(),
                    remote,
                    fields,
                    detected_at: now,
                };
                return Ok(Effects {
                    changes: Vec::new(),
                    conflict: Some(draft),
                    outcome: Outcome::ConflictOpened,
                });
            }
        };

        let changes = self.settle(decision, &remote, now)?;
        Ok(Effects {
            changes,
            conflict: None,
            outcome: Outcome::AutoResolved,
        })
    }

    /// Apply a decision to a conflicted entity.
    fn settle(
        &mut self,
        decision: ConflictDecision,
        remote: &RemoteChange,
        now: Timestamp,
    ) -> Result<Vec<ChangeDraft>> {
        let push_required = !matches!(decision, ConflictDecision::TakeRemote);
        self.entity
            .transition(SyncEvent::Resolved { push_required })?;

        for entry in &mut self.open {
            if entry.status == ChangeStatus::Pending {
                entry.status = ChangeStatus::Superseded;
                entry.completed_at = Some(now);
            }
        }

        match decision {
            ConflictDecision::TakeRemote => {
                self.entity.adopt_remote(remote, now);
                return Ok(Vec::new());
            }
            ConflictDecision::TakeLocal => {
                self.entity.adopt_remote_version(remote, now);
            }
            ConflictDecision::Merged(fields) => {
                self.entity.adopt_remote_version(remote, now);
                self.entity.deleted = false;
                self.entity.write_fields(fields, now);
            }
        }

        let op = if self.entity.deleted {
            ChangeOp::Delete
        } else if remote.deleted {
            ChangeOp::Create
        } else {
            ChangeOp::Update
        };
        Ok(vec![self.draft(op, now)])
    }

    /// Apply an operator's decision to the open conflict.
    pub fn resolve_manually(
        &mut self,
        conflict_id: ConflictId,
        decision: ConflictDecision,
        now: Timestamp,
    ) -> Result<Effects> {
        let Some(conflict) = self.conflict.as_ref().filter(|c| c.id == conflict_id) else {
            return Err(Error::ConflictNotFound(conflict_id));
        };
        if conflict.status != ConflictStatus::Unresolved {
            return Err(Error::ConflictAlreadyResolved(conflict.id));
        }
        let remote = conflict.remote.clone();
        let status = decision.status();

        let changes = self.settle(decision, &remote, now)?;
        if let Some(conflict) = self.conflict.as_mut() {
            conflict.status = status;
            conflict.resolved_at = Some(now);
        }
        Ok(Effects {
            changes,
            conflict: None,
            outcome: Outcome::ManuallyResolved,
        })
    }

    /// Reset a permanently failed entry so it is dispatched again.
    pub fn retry_failed(
        &mut self,
        change_id: ChangeId,
        resolver: &ConflictResolver,
        now: Timestamp,
    ) -> Result<Effects> {
        let entry = self.entry_mut(change_id)?;
        if entry.status != ChangeStatus::FailedPermanent {
            return Err(Error::InvalidChangeState {
                change_id,
                status: entry.status,
            });
        }
        self.entity.transition(SyncEvent::OperatorRetry)?;

        let entry = self.entry_mut(change_id)?;
        entry.status = ChangeStatus::Pending;
        entry.attempts = 0;
        entry.first_attempt_at = None;
        entry.next_attempt_at = None;
        entry.completed_at = None;
        entry.last_error = None;

        let mut effects = Effects::outcome(Outcome::Retried);
        if let Some(deferred) = self.entity.deferred_remote.take() {
            effects.absorb(self.observe_remote(deferred, resolver, now)?);
        }
        Ok(effects)
    }

    /// Return interrupted pushes to pending after a restart.
    pub fn recover(&mut self, resolver: &ConflictResolver, now: Timestamp) -> Result<Effects> {
        let mut interrupted = false;
        for entry in &mut self.open {
            if entry.status == ChangeStatus::InFlight {
                entry.status = ChangeStatus::Pending;
                interrupted = true;
            }
        }
        if !interrupted {
            return Ok(Effects::outcome(Outcome::Stale));
        }

        match self.entity.status {
            SyncStatus::Pushing => self.entity.transition(SyncEvent::Recovered)?,
            SyncStatus::Conflicted if self.conflict.is_none() => {
                self.entity.transition(SyncEvent::PushRetry)?
            }
            _ => {}
        }

        let mut effects = Effects::outcome(Outcome::Recovered);
        if self.entity.status == SyncStatus::PendingPush {
            if let Some(deferred) = self.entity.deferred_remote.take() {
                effects.absorb(self.observe_remote(deferred, resolver, now)?);
            }
        }
        Ok(effects)
    }

    /// The portal's view of this entity.
    pub fn indicator(&self) -> SyncIndicator {
        match self.entity.status {
            SyncStatus::Clean | SyncStatus::PendingPull => SyncIndicator::Synced,
            SyncStatus::PendingPush | SyncStatus::Pushing => {
                let retrying = self
                    .head()
                    .is_some_and(|e| e.attempts > 0 && e.last_error.is_some());
                if retrying {
                    SyncIndicator::RetryingSync
                } else {
                    SyncIndicator::PendingSync
                }
            }
            SyncStatus::Conflicted => {
                if self.conflict.is_some() {
                    SyncIndicator::NeedsReview
                } else {
                    SyncIndicator::PendingSync
                }
            }
            SyncStatus::Failed => SyncIndicator::Failed,
        }
    }
}
