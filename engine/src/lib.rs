//! # Ferry Engine
//!
//! Deterministic core of a synchronization engine that keeps a local
//! relational store consistent with a rate-limited, eventually consistent
//! external document store.
//!
//! This crate holds everything that can be decided without IO: the data
//! model, the per-entity sync state machine, the change log, entity mapping,
//! conflict resolution and retry policy. Time is always passed in by the
//! caller, so the same inputs produce the same outputs.
//!
//! ## Design Principles
//!
//! - **No IO**: network, database and clocks live in the server crate
//! - **Deterministic**: callers supply timestamps and jitter samples
//! - **One state machine**: every status change goes through [`SyncStatus::on`]
//!
//! ## Core Concepts
//!
//! ### Entities and the change log
//!
//! A [`SyncableEntity`] is a local row with sync metadata. Every local write
//! appends a [`ChangeLogEntry`] in the same transaction. Entries are pushed
//! strictly in order per entity, with at most one in flight.
//!
//! ### Ledger
//!
//! A [`Ledger`] groups one entity with its open entries and unresolved
//! conflict. Storage backends load a ledger, apply one transition and write
//! it back in a single transaction.
//!
//! ### Mapping and conflicts
//!
//! [`EntityMapper`] translates between local fields and external properties.
//! [`ConflictResolver`] runs a three-way merge against the last agreed
//! ancestor and falls back to last-writer-wins.
//!
//! ## Quick Start
//!
//! ```rust
//! use ferry_engine::{ConflictResolver, RemoteAck, Store, SyncStatus};
//! use serde_json::json;
//!
//! let resolver = ConflictResolver::default();
//! let mut store = Store::new();
//!
//! // 1. A local write creates the entity and its outbox entry together
//! let fields = json!({"status": "open"}).as_object().cloned().unwrap();
//! let receipt = store.create("referrals", fields, 1_706_745_600_000).unwrap();
//!
//! // 2. A worker claims the head entry and pushes it
//! let task = store.claim(receipt.change_id, 1_706_745_600_100).unwrap();
//! assert_eq!(task.entry.attempts, 1);
//!
//! // 3. The external store acknowledges
//! let ack = RemoteAck {
//!     external_id: "rec_1".into(),
//!     version: "v1".into(),
//!     edited_at: 1_706_745_600_200,
//! };
//! store.confirm(receipt.change_id, &ack, &resolver, 1_706_745_600_300).unwrap();
//!
//! let entity = store.entity(receipt.local_id).unwrap();
//! assert_eq!(entity.status, SyncStatus::Clean);
//! assert_eq!(entity.external_id.as_deref(), Some("rec_1"));
//! ```
//!
//! ## Persistence
//!
//! Use [`Store::export_state`] and [`Store::import_state`] with
//! [`StoreSnapshot`]. Snapshots serialize to JSON with deterministic ordering.

pub mod change;
pub mod conflict;
pub mod entity;
pub mod error;
pub mod ledger;
pub mod mapper;
pub mod retry;
pub mod snapshot;
pub mod store;

// Re-export main types at crate root
pub use change::{ChangeDraft, ChangeLogEntry, ChangeOp, ChangeStatus};
pub use conflict::{
    ConflictDecision, ConflictDraft, ConflictRecord, ConflictResolver, ConflictStatus,
    DeploymentMode, Resolution, VersionView,
};
pub use entity::{RemoteAck, RemoteChange, SyncEvent, SyncIndicator, SyncStatus, SyncableEntity};
pub use error::Error;
pub use ledger::{Effects, Ledger, Outcome, PushTask};
pub use mapper::{EntityMapper, FieldDef, FieldType, KindMapping, LocalFields, UNKNOWN_OPTION};
pub use retry::{FailureClass, FailureKind, RetryDecision, RetryPolicy};
pub use snapshot::{Sequences, StoreSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use store::{
    Committed, MappingDiagnostic, PullReport, RejectedRecord, RemoteBatch, Store, SyncCursor,
    WriteReceipt,
};

/// Type aliases for clarity
pub type LocalId = u64;
pub type ExternalId = String;
pub type EntityKind = String;
pub type ChangeId = u64;
pub type ConflictId = u64;
pub type Version = u64;
/// Milliseconds since the Unix epoch
pub type Timestamp = u64;
pub type SchemaVersion = u32;
/// A field set keyed by field name
pub type Fields = serde_json::Map<String, serde_json::Value>;
