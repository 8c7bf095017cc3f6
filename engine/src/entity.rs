//! Syncable entities and the per-entity sync state machine.

use crate::{error::Result, EntityKind, Error, ExternalId, Fields, LocalId, Timestamp, Version};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Where an entity stands relative to the external store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Local and remote agree as of the last sync
    Clean,
    /// A local change is waiting to be sent
    PendingPush,
    /// A local change is in flight
    Pushing,
    /// A remote change was observed and is being applied
    PendingPull,
    /// Both sides changed; waiting on resolution
    Conflicted,
    /// A push failed permanently; waiting on an operator
    Failed,
}

impl SyncStatus {
    /// Stable lowercase name, also used as the database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Clean => "clean",
            SyncStatus::PendingPush => "pending_push",
            SyncStatus::Pushing => "pushing",
            SyncStatus::PendingPull => "pending_pull",
            SyncStatus::Conflicted => "conflicted",
            SyncStatus::Failed => "failed",
        }
    }

    /// Parse the database representation.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "clean" => Some(SyncStatus::Clean),
            "pending_push" => Some(SyncStatus::PendingPush),
            "pushing" => Some(SyncStatus::Pushing),
            "pending_pull" => Some(SyncStatus::PendingPull),
            "conflicted" => Some(SyncStatus::Conflicted),
            "failed" => Some(SyncStatus::Failed),
            _ => None,
        }
    }

    /// Compute the next status for an event.
    ///
    /// Every status change in the engine goes through here, so an illegal
    /// transition surfaces as [`Error::InvalidTransition`] instead of a
    /// silently inconsistent row.
    pub fn on(self, event: SyncEvent) -> Result<SyncStatus> {
        use SyncEvent as E;
        use SyncStatus as S;

        let next = match (self, event) {
            (S::Clean | S::PendingPush | S::PendingPull, E::LocalWrite) => S::PendingPush,
            (S::Pushing | S::Conflicted | S::Failed, E::LocalWrite) => self,

            (S::PendingPush, E::Claim) => S::Pushing,

            // Conflicted here means a remote change arrived mid-flight.
            (S::Pushing | S::Conflicted, E::PushConfirmed { more_pending: true }) => {
                S::PendingPush
            }
            (S::Pushing | S::Conflicted, E::PushConfirmed { more_pending: false }) => S::Clean,
            (S::Pushing | S::Conflicted, E::PushRetry) => S::PendingPush,
            (S::Pushing | S::Conflicted, E::PushGaveUp) => S::Failed,

            (S::Clean | S::PendingPull, E::RemoteObserved) => S::PendingPull,
            (S::PendingPush | S::Pushing | S::Conflicted, E::RemoteObserved) => S::Conflicted,
            (S::Failed, E::RemoteObserved) => S::Failed,
            (S::PendingPull, E::RemoteApplied) => S::Clean,

            (S::Conflicted, E::Resolved { push_required: true }) => S::PendingPush,
            (S::Conflicted, E::Resolved { push_required: false }) => S::Clean,

            (S::Failed, E::OperatorRetry) => S::PendingPush,
            // Crash recovery puts interrupted pushes back in line.
            (S::Pushing, E::Recovered) => S::PendingPush,

            (from, event) => {
                return Err(Error::InvalidTransition {
                    from,
                    event: event.name(),
                })
            }
        };
        Ok(next)
    }

    /// True when the entity has local changes not yet on the remote side.
    pub fn has_unpushed_changes(&self) -> bool {
        matches!(
            self,
            SyncStatus::PendingPush
                | SyncStatus::Pushing
                | SyncStatus::Conflicted
                | SyncStatus::Failed
        )
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events driving [`SyncStatus`] transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEvent {
    LocalWrite,
    Claim,
    PushConfirmed { more_pending: bool },
    PushRetry,
    PushGaveUp,
    RemoteObserved,
    RemoteApplied,
    Resolved { push_required: bool },
    OperatorRetry,
    Recovered,
}

impl SyncEvent {
    fn name(&self) -> &'static str {
        match self {
            SyncEvent::LocalWrite => "local write",
            SyncEvent::Claim => "claim",
            SyncEvent::PushConfirmed { .. } => "push confirmed",
            SyncEvent::PushRetry => "push retry",
            SyncEvent::PushGaveUp => "push gave up",
            SyncEvent::RemoteObserved => "remote observed",
            SyncEvent::RemoteApplied => "remote applied",
            SyncEvent::Resolved { .. } => "resolved",
            SyncEvent::OperatorRetry => "operator retry",
            SyncEvent::Recovered => "recovered",
        }
    }
}

/// Non-blocking status shown next to a record in the portal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncIndicator {
    Synced,
    /// "pending sync"
    PendingSync,
    /// "sync failed, will retry"
    RetryingSync,
    /// "needs review"
    NeedsReview,
    Failed,
}

/// A remote record after it went through the mapper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteChange {
    pub external_id: ExternalId,
    /// Opaque version/etag
    pub version: String,
    /// Last edit on the remote side (milliseconds since epoch)
    pub edited_at: Timestamp,
    pub fields: Fields,
    /// Unknown external properties
    #[serde(default)]
    pub extras: Fields,
    /// Per-field edit times, when the external store provides them
    #[serde(default)]
    pub field_times: BTreeMap<String, Timestamp>,
    #[serde(default)]
    pub deleted: bool,
}

/// What the external store returned for a successful write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteAck {
    pub external_id: ExternalId,
    pub version: String,
    pub edited_at: Timestamp,
}

/// A local row eligible for synchronization, with its sync state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncableEntity {
    pub local_id: LocalId,
    pub kind: EntityKind,
    /// Set once a create has been confirmed remotely, never cleared
    pub external_id: Option<ExternalId>,
    /// Incremented on every local write
    pub local_version: Version,
    /// Etag of the last known remote state
    pub external_version: Option<String>,
    pub last_synced_at: Option<Timestamp>,
    pub status: SyncStatus,
    pub fields: Fields,
    #[serde(default)]
    pub extras: Fields,
    /// Field values both sides agreed on at the last sync
    pub base: Option<Fields>,
    #[serde(default)]
    pub field_updated_at: BTreeMap<String, Timestamp>,
    pub updated_at: Timestamp,
    pub remote_edited_at: Option<Timestamp>,
    pub deleted: bool,
    pub schema_version: u32,
    /// Remote change seen while a push was in flight or the entity had failed
    pub deferred_remote: Option<RemoteChange>,
}

impl SyncableEntity {
    /// A new locally created entity. It starts pending push.
    pub fn new_local(
        local_id: LocalId,
        kind: impl Into<EntityKind>,
        fields: Fields,
        timestamp: Timestamp,
    ) -> Self {
        let field_updated_at = fields.keys().map(|k| (k.clone(), timestamp)).collect();
        Self {
            local_id,
            kind: kind.into(),
            external_id: None,
            local_version: 1,
            external_version: None,
            last_synced_at: None,
            status: SyncStatus::PendingPush,
            fields,
            extras: Fields::new(),
            base: None,
            field_updated_at,
            updated_at: timestamp,
            remote_edited_at: None,
            deleted: false,
            schema_version: 1,
            deferred_remote: None,
        }
    }

    /// A new entity first seen on the remote side. It starts clean.
    pub fn from_remote(
        local_id: LocalId,
        kind: impl Into<EntityKind>,
        remote: &RemoteChange,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            local_id,
            kind: kind.into(),
            external_id: Some(remote.external_id.clone()),
            local_version: 1,
            external_version: Some(remote.version.clone()),
            last_synced_at: Some(timestamp),
            status: SyncStatus::Clean,
            fields: remote.fields.clone(),
            extras: remote.extras.clone(),
            base: Some(remote.fields.clone()),
            field_updated_at: BTreeMap::new(),
            updated_at: remote.edited_at,
            remote_edited_at: Some(remote.edited_at),
            deleted: remote.deleted,
            schema_version: 1,
            deferred_remote: None,
        }
    }

    /// Move the state machine.
    pub fn transition(&mut self, event: SyncEvent) -> Result<()> {
        self.status = self.status.on(event)?;
        Ok(())
    }

    /// Replace local fields, stamping the ones that changed.
    pub fn write_fields(&mut self, fields: Fields, timestamp: Timestamp) {
        for (key, value) in &fields {
            if self.fields.get(key) != Some(value) {
                self.field_updated_at.insert(key.clone(), timestamp);
            }
        }
        for key in self.fields.keys() {
            if !fields.contains_key(key) {
                self.field_updated_at.insert(key.clone(), timestamp);
            }
        }
        self.fields = fields;
        self.local_version += 1;
        self.updated_at = timestamp;
    }

    /// Take the remote side's state wholesale.
    pub fn adopt_remote(&mut self, remote: &RemoteChange, timestamp: Timestamp) {
        if self.fields != remote.fields || self.deleted != remote.deleted {
            self.local_version += 1;
        }
        self.fields = remote.fields.clone();
        self.deleted = remote.deleted;
        self.updated_at = remote.edited_at;
        self.field_updated_at.clear();
        self.adopt_remote_version(remote, timestamp);
    }

    /// Record the remote version as the new common ancestor without touching
    /// local fields.
    pub fn adopt_remote_version(&mut self, remote: &RemoteChange, timestamp: Timestamp) {
        self.external_id = Some(remote.external_id.clone());
        self.external_version = Some(remote.version.clone());
        self.remote_edited_at = Some(remote.edited_at);
        self.extras = remote.extras.clone();
        self.base = Some(remote.fields.clone());
        self.last_synced_at = Some(timestamp);
    }

    /// True when `remote` carries nothing newer than what we already know.
    pub fn is_stale(&self, remote: &RemoteChange) -> bool {
        if self.external_version.as_deref() == Some(remote.version.as_str()) {
            return true;
        }
        matches!(self.remote_edited_at, Some(known) if remote.edited_at < known)
    }
}
