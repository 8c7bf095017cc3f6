//! Snapshot types for persisting and restoring store state.
//!
//! Snapshots use BTreeMaps throughout so that serializing the same state
//! always produces the same bytes.

use crate::{
    change::ChangeLogEntry,
    conflict::ConflictRecord,
    entity::SyncableEntity,
    error::Result,
    store::{MappingDiagnostic, SyncCursor},
    ChangeId, ConflictId, EntityKind, Error, LocalId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Id sequences, so a restored store never reuses an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sequences {
    pub local_id: LocalId,
    pub change_id: ChangeId,
    pub conflict_id: ConflictId,
    pub diagnostic_id: u64,
}

/// A point-in-time snapshot of the store state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    pub format_version: u32,
    pub sequences: Sequences,
    pub entities: BTreeMap<LocalId, SyncableEntity>,
    /// Every change log entry not yet garbage collected
    pub outbox: BTreeMap<ChangeId, ChangeLogEntry>,
    pub conflicts: BTreeMap<ConflictId, ConflictRecord>,
    pub cursors: BTreeMap<EntityKind, SyncCursor>,
    pub diagnostics: BTreeMap<u64, MappingDiagnostic>,
}

impl Default for StoreSnapshot {
    fn default() -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            sequences: Sequences::default(),
            entities: BTreeMap::new(),
            outbox: BTreeMap::new(),
            conflicts: BTreeMap::new(),
            cursors: BTreeMap::new(),
            diagnostics: BTreeMap::new(),
        }
    }
}

impl StoreSnapshot {
    /// Count entries that still need to reach the external store.
    pub fn open_change_count(&self) -> usize {
        self.outbox.values().filter(|e| e.status.is_open()).count()
    }

    /// Check internal consistency before importing.
    pub fn validate(&self) -> Result<()> {
        if self.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported format version {}",
                self.format_version
            )));
        }

        for (id, entity) in &self.entities {
            if *id != entity.local_id {
                return Err(Error::InvalidSnapshot(format!(
                    "entity keyed {id} has local id {}",
                    entity.local_id
                )));
            }
            if *id > self.sequences.local_id {
                return Err(Error::InvalidSnapshot(format!(
                    "entity {id} is beyond the local id sequence"
                )));
            }
        }

        for (id, entry) in &self.outbox {
            if *id != entry.id || *id > self.sequences.change_id {
                return Err(Error::InvalidSnapshot(format!("change {id} is inconsistent")));
            }
            if !self.entities.contains_key(&entry.local_id) {
                return Err(Error::InvalidSnapshot(format!(
                    "change {id} references missing entity {}",
                    entry.local_id
                )));
            }
        }

        for (id, conflict) in &self.conflicts {
            if *id != conflict.id || *id > self.sequences.conflict_id {
                return Err(Error::InvalidSnapshot(format!(
                    "conflict {id} is inconsistent"
                )));
            }
            if !self.entities.contains_key(&conflict.local_id) {
                return Err(Error::InvalidSnapshot(format!(
                    "conflict {id} references missing entity {}",
                    conflict.local_id
                )));
            }
        }

        Ok(())
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Serialize to pretty JSON with deterministic ordering.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }
}
