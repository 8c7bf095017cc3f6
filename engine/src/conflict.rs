//! Conflict detection and resolution.
//!
//! The resolver is stateless: given the local state, the remote state and
//! the last agreed ancestor it returns a [`Resolution`]. Identical inputs
//! always produce identical output.
//!
//! # Algorithm
//!
//! 1. Both deleted, or identical fields: take remote (adopt its etag)
//! 2. No ancestor: whole-record last-writer-wins, ties by deployment mode
//! 3. One side deleted: the delete wins only if the other side is unchanged
//! 4. Otherwise a per-field three-way merge against the ancestor
//!
//! Fields configured as local-authoritative always keep the local value.

use crate::{entity::RemoteChange, ConflictId, EntityKind, Fields, LocalId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Placeholder field name reported for delete-vs-edit conflicts.
pub const DELETED_FIELD: &str = "<deleted>";

/// Which store wins ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentMode {
    /// The external store is a fallback; local wins ties (default)
    #[default]
    Fallback,
    /// The external store is primary; remote wins ties
    ExternalFirst,
}

impl DeploymentMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "fallback" => Some(DeploymentMode::Fallback),
            "external_first" => Some(DeploymentMode::ExternalFirst),
            _ => None,
        }
    }
}

/// One side of a conflict, as seen by the resolver.
#[derive(Debug, Clone, Copy)]
pub struct VersionView<'a> {
    pub fields: &'a Fields,
    /// Last write on this side
    pub updated_at: Timestamp,
    /// Per-field write times; may be empty
    pub field_times: &'a BTreeMap<String, Timestamp>,
    pub deleted: bool,
}

impl<'a> VersionView<'a> {
    pub fn of_remote(remote: &'a RemoteChange) -> Self {
        Self {
            fields: &remote.fields,
            updated_at: remote.edited_at,
            field_times: &remote.field_times,
            deleted: remote.deleted,
        }
    }
}

/// Outcome of a resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum Resolution {
    /// Keep local state; it must still be pushed
    TakeLocal,
    /// Adopt remote state; nothing to push
    TakeRemote,
    /// Merged fields; must be written locally and pushed
    Merge { fields: Fields },
    /// Needs a human
    Unresolvable { fields: Vec<String> },
}

/// Stateless resolver configured with authority rules.
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    mode: DeploymentMode,
    local_authoritative: HashMap<EntityKind, BTreeSet<String>>,
}

impl ConflictResolver {
    pub fn new(mode: DeploymentMode) -> Self {
        Self {
            mode,
            local_authoritative: HashMap::new(),
        }
    }

    pub fn mode(&self) -> DeploymentMode {
        self.mode
    }

    /// Mark fields of a kind as always owned by the local store.
    pub fn with_local_authority<I, S>(mut self, kind: impl Into<EntityKind>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.local_authoritative
            .entry(kind.into())
            .or_default()
            .extend(fields.into_iter().map(Into::into));
        self
    }

    fn is_authoritative(&self, kind: &str, field: &str) -> bool {
        self.local_authoritative
            .get(kind)
            .is_some_and(|fields| fields.contains(field))
    }

    fn local_wins(&self, local: Timestamp, remote: Timestamp) -> bool {
        match local.cmp(&remote) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => self.mode == DeploymentMode::Fallback,
        }
    }

    pub fn resolve(
        &self,
        kind: &str,
        local: &VersionView<'_>,
        remote: &VersionView<'_>,
        ancestor: Option<&Fields>,
    ) -> Resolution {
        if local.deleted && remote.deleted {
            return Resolution::TakeRemote;
        }
        if !local.deleted && !remote.deleted && local.fields == remote.fields {
            return Resolution::TakeRemote;
        }

        let Some(ancestor) = ancestor else {
            return self.resolve_by_record(kind, local, remote);
        };

        if local.deleted || remote.deleted {
            let survivor = if local.deleted { remote } else { local };
            if survivor.fields != ancestor {
                return Resolution::Unresolvable {
                    fields: vec![DELETED_FIELD.to_string()],
                };
            }
            return if local.deleted {
                Resolution::TakeLocal
            } else {
                Resolution::TakeRemote
            };
        }

        self.merge_fields(kind, local, remote, ancestor)
    }

    fn resolve_by_record(
        &self,
        kind: &str,
        local: &VersionView<'_>,
        remote: &VersionView<'_>,
    ) -> Resolution {
        if self.local_wins(local.updated_at, remote.updated_at) {
            return Resolution::TakeLocal;
        }
        if local.deleted || remote.deleted {
            return Resolution::TakeRemote;
        }

        let mut merged = remote.fields.clone();
        for (key, value) in local.fields {
            if self.is_authoritative(kind, key) {
                merged.insert(key.clone(), value.clone());
            }
        }
        classify(merged, local.fields, remote.fields)
    }

    fn merge_fields(
        &self,
        kind: &str,
        local: &VersionView<'_>,
        remote: &VersionView<'_>,
        ancestor: &Fields,
    ) -> Resolution {
        let keys: BTreeSet<&String> = local
            .fields
            .keys()
            .chain(remote.fields.keys())
            .chain(ancestor.keys())
            .collect();

        let mut merged = Fields::new();
        let mut conflicting = Vec::new();

        for key in keys {
            let base = ancestor.get(key);
            let ours = local.fields.get(key);
            let theirs = remote.fields.get(key);

            let chosen: Option<&Value> = if self.is_authoritative(kind, key) || ours == theirs {
                ours
            } else if ours == base {
                theirs
            } else if theirs == base {
                ours
            } else {
                match (local.field_times.get(key), remote.field_times.get(key)) {
                    (Some(&ours_at), Some(&theirs_at)) => {
                        if self.local_wins(ours_at, theirs_at) {
                            ours
                        } else {
                            theirs
                        }
                    }
                    _ => {
                        conflicting.push(key.clone());
                        continue;
                    }
                }
            };

            if let Some(value) = chosen {
                merged.insert(key.clone(), value.clone());
            }
        }

        if !conflicting.is_empty() {
            return Resolution::Unresolvable {
                fields: conflicting,
            };
        }
        classify(merged, local.fields, remote.fields)
    }
}

fn classify(merged: Fields, local: &Fields, remote: &Fields) -> Resolution {
    if &merged == local {
        Resolution::TakeLocal
    } else if &merged == remote {
        Resolution::TakeRemote
    } else {
        Resolution::Merge { fields: merged }
    }
}

/// Lifecycle of a conflict record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Unresolved,
    ResolvedLocal,
    ResolvedRemote,
    ResolvedMerged,
}

impl ConflictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStatus::Unresolved => "unresolved",
            ConflictStatus::ResolvedLocal => "resolved_local",
            ConflictStatus::ResolvedRemote => "resolved_remote",
            ConflictStatus::ResolvedMerged => "resolved_merged",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "unresolved" => Some(ConflictStatus::Unresolved),
            "resolved_local" => Some(ConflictStatus::ResolvedLocal),
            "resolved_remote" => Some(ConflictStatus::ResolvedRemote),
            "resolved_merged" => Some(ConflictStatus::ResolvedMerged),
            _ => None,
        }
    }
}

/// An operator's decision on an unresolved conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "decision", content = "fields")]
pub enum ConflictDecision {
    TakeLocal,
    TakeRemote,
    Merged(Fields),
}

impl ConflictDecision {
    pub fn status(&self) -> ConflictStatus {
        match self {
            ConflictDecision::TakeLocal => ConflictStatus::ResolvedLocal,
            ConflictDecision::TakeRemote => ConflictStatus::ResolvedRemote,
            ConflictDecision::Merged(_) => ConflictStatus::ResolvedMerged,
        }
    }
}

/// A conflict that needs a human, before storage assigned it an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictDraft {
    pub local_id: LocalId,
    pub kind: EntityKind,
    pub local: Fields,
    pub local_deleted: bool,
    pub remote: RemoteChange,
    pub ancestor: Option<Fields>,
    pub fields: Vec<String>,
    pub detected_at: Timestamp,
}

impl ConflictDraft {
    pub fn into_record(self, id: ConflictId) -> ConflictRecord {
        ConflictRecord {
            id,
            local_id: self.local_id,
            kind: self.kind,
            local: self.local,
            local_deleted: self.local_deleted,
            remote: self.remote,
            ancestor: self.ancestor,
            fields: self.fields,
            detected_at: self.detected_at,
            status: ConflictStatus::Unresolved,
            resolved_at: None,
        }
    }
}

/// A conflict surfaced for manual review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub id: ConflictId,
    pub local_id: LocalId,
    pub kind: EntityKind,
    /// Local field snapshot at detection
    pub local: Fields,
    pub local_deleted: bool,
    /// Latest remote state seen for the entity
    pub remote: RemoteChange,
    pub ancestor: Option<Fields>,
    /// Names of the conflicting fields
    pub fields: Vec<String>,
    pub detected_at: Timestamp,
    pub status: ConflictStatus,
    pub resolved_at: Option<Timestamp>,
}
