//! Error types for the Ferry engine.

use crate::{ChangeId, ChangeStatus, ConflictId, EntityKind, ExternalId, LocalId, SyncStatus};
use thiserror::Error;

/// All possible errors from the Ferry engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Lookup errors
    #[error("unknown entity kind: {0}")]
    UnknownKind(EntityKind),

    #[error("entity not found: {0}")]
    EntityNotFound(LocalId),

    #[error("change log entry not found: {0}")]
    ChangeNotFound(ChangeId),

    #[error("conflict not found: {0}")]
    ConflictNotFound(ConflictId),

    // Mapping errors
    #[error("mapping error for {kind}.{field}: {reason}")]
    Mapping {
        kind: EntityKind,
        field: String,
        reason: String,
    },

    #[error("corrupt payload for {kind}: {reason}")]
    CorruptPayload { kind: EntityKind, reason: String },

    // State machine errors
    #[error("invalid transition from {from} on {event}")]
    InvalidTransition {
        from: SyncStatus,
        event: &'static str,
    },

    #[error("change {change_id} is not next for entity {local_id} (head is {head:?})")]
    OutOfOrder {
        local_id: LocalId,
        change_id: ChangeId,
        head: Option<ChangeId>,
    },

    #[error("change {change_id} is {status}")]
    InvalidChangeState {
        change_id: ChangeId,
        status: ChangeStatus,
    },

    #[error("conflict {0} is already resolved")]
    ConflictAlreadyResolved(ConflictId),

    #[error("entity {0} is deleted")]
    EntityDeleted(LocalId),

    #[error("external id {external_id} already belongs to entity {local_id}")]
    ExternalIdTaken {
        external_id: ExternalId,
        local_id: LocalId,
    },

    // State errors
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

impl Error {
    /// True for lookups that found nothing.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::EntityNotFound(_) | Error::ChangeNotFound(_) | Error::ConflictNotFound(_)
        )
    }

    /// True for mapping failures, which are never retried.
    pub fn is_mapping(&self) -> bool {
        matches!(self, Error::Mapping { .. } | Error::CorruptPayload { .. })
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
