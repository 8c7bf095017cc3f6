//! Change log (outbox) entries.
//!
//! Every local write produces exactly one entry, committed together with the
//! business row. Entries are the durable source of truth for outbound work;
//! in-memory queues only ever hold their ids.

use crate::{ChangeId, EntityKind, Fields, LocalId, Timestamp, Version};
use serde::{Deserialize, Serialize};

/// The mutation an entry carries to the external store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Create,
    Update,
    Delete,
}

impl ChangeOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOp::Create => "create",
            ChangeOp::Update => "update",
            ChangeOp::Delete => "delete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(ChangeOp::Create),
            "update" => Some(ChangeOp::Update),
            "delete" => Some(ChangeOp::Delete),
            _ => None,
        }
    }
}

/// Lifecycle of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    Pending,
    InFlight,
    Succeeded,
    /// Gave up after the retry policy; waits for an operator
    FailedPermanent,
    /// Replaced by a newer entry carrying a conflict resolution
    Superseded,
}

impl ChangeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeStatus::Pending => "pending",
            ChangeStatus::InFlight => "in_flight",
            ChangeStatus::Succeeded => "succeeded",
            ChangeStatus::FailedPermanent => "failed_permanent",
            ChangeStatus::Superseded => "superseded",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ChangeStatus::Pending),
            "in_flight" => Some(ChangeStatus::InFlight),
            "succeeded" => Some(ChangeStatus::Succeeded),
            "failed_permanent" => Some(ChangeStatus::FailedPermanent),
            "superseded" => Some(ChangeStatus::Superseded),
            _ => None,
        }
    }

    /// Entries that still block later entries of the same entity.
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            ChangeStatus::Pending | ChangeStatus::InFlight | ChangeStatus::FailedPermanent
        )
    }

    /// Entries eligible for garbage collection.
    pub fn is_collectable(&self) -> bool {
        matches!(self, ChangeStatus::Succeeded | ChangeStatus::Superseded)
    }
}

impl std::fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change that has not been assigned an id yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeDraft {
    pub local_id: LocalId,
    pub kind: EntityKind,
    pub op: ChangeOp,
    pub payload: Fields,
    pub local_version: Version,
    pub enqueued_at: Timestamp,
}

impl ChangeDraft {
    pub fn new(
        local_id: LocalId,
        kind: impl Into<EntityKind>,
        op: ChangeOp,
        payload: Fields,
        local_version: Version,
        enqueued_at: Timestamp,
    ) -> Self {
        Self {
            local_id,
            kind: kind.into(),
            op,
            payload,
            local_version,
            enqueued_at,
        }
    }

    /// Materialize the draft once storage assigned an id.
    pub fn into_entry(self, id: ChangeId) -> ChangeLogEntry {
        ChangeLogEntry {
            id,
            local_id: self.local_id,
            kind: self.kind,
            op: self.op,
            payload: self.payload,
            local_version: self.local_version,
            enqueued_at: self.enqueued_at,
            attempts: 0,
            status: ChangeStatus::Pending,
            next_attempt_at: None,
            first_attempt_at: None,
            completed_at: None,
            last_error: None,
        }
    }
}

/// A durable record of one pending mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeLogEntry {
    pub id: ChangeId,
    pub local_id: LocalId,
    pub kind: EntityKind,
    pub op: ChangeOp,
    /// Field snapshot at enqueue time
    pub payload: Fields,
    /// Local version the snapshot represents
    pub local_version: Version,
    pub enqueued_at: Timestamp,
    pub attempts: u32,
    pub status: ChangeStatus,
    /// Earliest time the next attempt may be dispatched
    pub next_attempt_at: Option<Timestamp>,
    pub first_attempt_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub last_error: Option<String>,
}

impl ChangeLogEntry {
    /// Stable token sent with every attempt of this entry.
    ///
    /// Derived only from the entry id, so a retry after a lost response is
    /// recognized by the external store as the same request.
    pub fn idempotency_token(&self) -> String {
        format!("ferry-chg-{}", self.id)
    }

    /// True when the entry may be dispatched at `now`.
    pub fn is_due(&self, now: Timestamp) -> bool {
        self.status == ChangeStatus::Pending && self.next_attempt_at.map_or(true, |at| at <= now)
    }

    /// Time spent since the first attempt.
    pub fn elapsed_since_first_attempt(&self, now: Timestamp) -> u64 {
        self.first_attempt_at
            .map(|first| now.saturating_sub(first))
            .unwrap_or(0)
    }
}
