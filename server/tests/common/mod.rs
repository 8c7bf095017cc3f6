//! Scriptable in-memory external store and a sync engine wired to it.

#![allow(dead_code)]

use async_trait::async_trait;
use ferry_engine::{
    ConflictResolver, EntityMapper, FailureKind, FieldDef, FieldType, Fields, KindMapping,
    Timestamp,
};
use ferry_server::client::{
    ChangePage, ClientError, ExternalApi, ExternalRecord, ExternalRequest, ExternalResponse,
    RateLimitedClient,
};
use ferry_server::store::MemoryStore;
use ferry_server::sync::{SyncClock, SyncEngine, SyncOptions};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

pub const T0: Timestamp = 1_706_745_600_000;
pub const KIND: &str = "referrals";

pub fn fields(value: Value) -> Fields {
    value.as_object().cloned().unwrap()
}

pub fn mapper() -> EntityMapper {
    EntityMapper::new().with_kind(KindMapping::new(
        KIND,
        1,
        vec![
            FieldDef::new("status", "Status", FieldType::Text),
            FieldDef::new("notes", "Notes", FieldType::Text),
            FieldDef::new("score", "Score", FieldType::Integer),
        ],
    ))
}

#[derive(Debug, Clone)]
pub struct Call {
    pub name: &'static str,
    pub at: Instant,
    pub idempotency_key: Option<String>,
    pub since: Option<String>,
}

struct Stored {
    record: ExternalRecord,
    /// Raw feed payload that replaces the serialized record
    raw: Option<Value>,
    seq: u64,
}

#[derive(Default)]
struct FakeState {
    records: BTreeMap<(String, String), Stored>,
    seq: u64,
    ids: u64,
    replies: HashMap<String, ExternalResponse>,
    failures: VecDeque<(&'static str, FailureKind)>,
    offline: bool,
    failing_writes: Option<FailureKind>,
    lose_next_write: bool,
    expire_cursors: bool,
    applied_creates: usize,
    calls: Vec<Call>,
}

/// An eventually consistent document store with etags, idempotency keys
/// and a sequence-numbered change feed.
pub struct FakeExternalStore {
    state: Mutex<FakeState>,
    clock: SyncClock,
    page_size: usize,
}

impl FakeExternalStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState::default()),
            clock: SyncClock::starting_at(T0),
            page_size: 2,
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    // ========================================================================
    // Remote-side edits
    // ========================================================================

    pub fn seed(&self, id: &str, properties: Value) {
        let mut state = self.state();
        state.seq += 1;
        let seq = state.seq;
        let record = ExternalRecord {
            id: id.to_string(),
            version: format!("v{seq}"),
            edited_at: self.clock.now(),
            properties: fields(properties),
            field_times: BTreeMap::new(),
            deleted: false,
        };
        state.records.insert(
            (KIND.to_string(), id.to_string()),
            Stored {
                record,
                raw: None,
                seq,
            },
        );
    }

    /// A feed entry that does not decode or map.
    pub fn seed_raw(&self, id: &str, raw: Value) {
        self.seed(id, serde_json::json!({}));
        let mut state = self.state();
        if let Some(stored) = state.records.get_mut(&(KIND.to_string(), id.to_string())) {
            stored.raw = Some(raw);
        }
    }

    pub fn edit(&self, id: &str, properties: Value) {
        let now = self.clock.now();
        let mut state = self.state();
        state.seq += 1;
        let seq = state.seq;
        let stored = state
            .records
            .get_mut(&(KIND.to_string(), id.to_string()))
            .expect("edited record exists");
        stored.record.properties.extend(fields(properties));
        stored.record.version = format!("v{seq}");
        stored.record.edited_at = now;
        stored.seq = seq;
    }

    pub fn delete(&self, id: &str) {
        let now = self.clock.now();
        let mut state = self.state();
        state.seq += 1;
        let seq = state.seq;
        let stored = state
            .records
            .get_mut(&(KIND.to_string(), id.to_string()))
            .expect("deleted record exists");
        stored.record.deleted = true;
        stored.record.version = format!("v{seq}");
        stored.record.edited_at = now;
        stored.seq = seq;
    }

    // ========================================================================
    // Fault injection
    // ========================================================================

    pub fn fail_next(&self, request: &'static str, kind: FailureKind) {
        self.state().failures.push_back((request, kind));
    }

    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// Fail every write with `kind` until cleared.
    pub fn fail_writes(&self, kind: Option<FailureKind>) {
        self.state().failing_writes = kind;
    }

    /// Apply the next write but report a timeout.
    pub fn lose_next_write(&self) {
        self.state().lose_next_write = true;
    }

    pub fn expire_cursors(&self) {
        self.state().expire_cursors = true;
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub fn record(&self, id: &str) -> Option<ExternalRecord> {
        self.state()
            .records
            .get(&(KIND.to_string(), id.to_string()))
            .map(|s| s.record.clone())
    }

    pub fn live_records(&self) -> Vec<ExternalRecord> {
        self.state()
            .records
            .values()
            .filter(|s| !s.record.deleted)
            .map(|s| s.record.clone())
            .collect()
    }

    pub fn applied_creates(&self) -> usize {
        self.state().applied_creates
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    /// Names of write requests, in arrival order.
    pub fn writes(&self) -> Vec<&'static str> {
        self.calls()
            .into_iter()
            .map(|c| c.name)
            .filter(|name| matches!(*name, "create" | "update" | "delete"))
            .collect()
    }

    /// Number of first pages requested without a cursor.
    pub fn full_listings(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.name == "query" && c.since.is_none())
            .count()
    }

    // ========================================================================
    // Request handling
    // ========================================================================

    fn handle(&self, state: &mut FakeState, request: ExternalRequest) -> Result<ExternalResponse, ClientError> {
        let now = self.clock.now();
        match request {
            ExternalRequest::Get { kind, id } => match state.records.get(&(kind, id)) {
                Some(stored) if !stored.record.deleted => Ok(ExternalResponse::Record(stored.record.clone())),
                _ => Err(ClientError::new(FailureKind::NotFound, "404 Not Found")),
            },
            ExternalRequest::Create {
                kind,
                properties,
                idempotency_key,
            } => {
                if let Some(reply) = state.replies.get(&idempotency_key) {
                    return Ok(reply.clone());
                }
                state.ids += 1;
                state.seq += 1;
                let record = ExternalRecord {
                    id: format!("rec_{}", state.ids),
                    version: format!("v{}", state.seq),
                    edited_at: now,
                    properties,
                    field_times: BTreeMap::new(),
                    deleted: false,
                };
                let seq = state.seq;
                state.records.insert(
                    (kind, record.id.clone()),
                    Stored {
                        record: record.clone(),
                        raw: None,
                        seq,
                    },
                );
                state.applied_creates += 1;
                let reply = ExternalResponse::Record(record);
                state.replies.insert(idempotency_key, reply.clone());
                Ok(reply)
            }
            ExternalRequest::Update {
                kind,
                id,
                properties,
                expected_version,
                idempotency_key,
            } => {
                if let Some(reply) = state.replies.get(&idempotency_key) {
                    return Ok(reply.clone());
                }
                state.seq += 1;
                let seq = state.seq;
                let stored = live(state, kind, id, expected_version)?;
                stored.record.properties = properties;
                stored.record.version = format!("v{seq}");
                stored.record.edited_at = now;
                stored.seq = seq;
                let reply = ExternalResponse::Record(stored.record.clone());
                state.replies.insert(idempotency_key, reply.clone());
                Ok(reply)
            }
            ExternalRequest::Delete {
                kind,
                id,
                expected_version,
                idempotency_key,
            } => {
                if let Some(reply) = state.replies.get(&idempotency_key) {
                    return Ok(reply.clone());
                }
                state.seq += 1;
                let seq = state.seq;
                let stored = live(state, kind, id, expected_version)?;
                stored.record.deleted = true;
                stored.record.version = format!("v{seq}");
                stored.record.edited_at = now;
                stored.seq = seq;
                state.replies.insert(idempotency_key, ExternalResponse::Deleted);
                Ok(ExternalResponse::Deleted)
            }
            ExternalRequest::Query { kind, since, page } => {
                if since.is_some() && state.expire_cursors {
                    state.expire_cursors = false;
                    return Err(ClientError::new(FailureKind::CursorExpired, "410 Gone"));
                }
                let after: u64 = since.as_deref().and_then(|s| s.parse().ok()).unwrap_or(0);
                let full = since.is_none();

                let mut matching: Vec<&Stored> = state
                    .records
                    .iter()
                    .filter(|((k, _), s)| *k == kind && s.seq > after && !(full && s.record.deleted))
                    .map(|(_, s)| s)
                    .collect();
                matching.sort_by_key(|s| s.seq);

                let offset: usize = page.as_deref().and_then(|p| p.parse().ok()).unwrap_or(0);
                let records = matching
                    .iter()
                    .skip(offset)
                    .take(self.page_size)
                    .map(|s| {
                        s.raw
                            .clone()
                            .unwrap_or_else(|| serde_json::to_value(&s.record).unwrap())
                    })
                    .collect();
                let next_page = (offset + self.page_size < matching.len())
                    .then(|| (offset + self.page_size).to_string());

                Ok(ExternalResponse::Page(ChangePage {
                    records,
                    next_page,
                    cursor: Some(state.seq.to_string()),
                }))
            }
        }
    }
}

fn live(
    state: &mut FakeState,
    kind: String,
    id: String,
    expected_version: Option<String>,
) -> Result<&mut Stored, ClientError> {
    let stored = state
        .records
        .get_mut(&(kind, id))
        .filter(|s| !s.record.deleted)
        .ok_or_else(|| ClientError::new(FailureKind::NotFound, "404 Not Found"))?;
    if let Some(expected) = expected_version {
        if expected != stored.record.version {
            return Err(ClientError::new(
                FailureKind::VersionConflict,
                "412 Precondition Failed",
            ));
        }
    }
    Ok(stored)
}

#[async_trait]
impl ExternalApi for FakeExternalStore {
    async fn send(&self, request: ExternalRequest) -> Result<ExternalResponse, ClientError> {
        let name = request.name();
        let mut state = self.state();
        state.calls.push(Call {
            name,
            at: Instant::now(),
            idempotency_key: match &request {
                ExternalRequest::Create { idempotency_key, .. }
                | ExternalRequest::Update { idempotency_key, .. }
                | ExternalRequest::Delete { idempotency_key, .. } => Some(idempotency_key.clone()),
                _ => None,
            },
            since: match &request {
                ExternalRequest::Query { since, page: None, .. } => since.clone(),
                ExternalRequest::Query { .. } => Some("page".into()),
                _ => None,
            },
        });

        if state.offline {
            return Err(ClientError::new(FailureKind::Connection, "connection refused"));
        }
        if let Some(pos) = state.failures.iter().position(|(r, _)| *r == name) {
            let (_, kind) = state.failures.remove(pos).unwrap();
            return Err(ClientError::new(kind, "scripted failure"));
        }

        let is_write = matches!(name, "create" | "update" | "delete");
        if is_write {
            if let Some(kind) = state.failing_writes.clone() {
                return Err(ClientError::new(kind, "writes failing"));
            }
        }

        let response = self.handle(&mut state, request);
        if is_write && response.is_ok() && state.lose_next_write {
            state.lose_next_write = false;
            return Err(ClientError::new(FailureKind::Timeout, "response lost"));
        }
        response
    }
}

pub struct Harness {
    pub engine: SyncEngine,
    pub store: Arc<MemoryStore>,
    pub remote: Arc<FakeExternalStore>,
}

pub fn options() -> SyncOptions {
    SyncOptions {
        worker_count: 2,
        pull_interval: Duration::from_secs(3600),
        pump_interval: Duration::from_millis(200),
        kinds: vec![KIND.to_string()],
        ..Default::default()
    }
}

pub fn harness_with(store: Arc<MemoryStore>, remote: Arc<FakeExternalStore>, options: SyncOptions) -> Harness {
    let client = RateLimitedClient::per_second(remote.clone(), 3, Duration::from_secs(10));
    let engine = SyncEngine::with_clock(
        store.clone(),
        Arc::new(client),
        mapper(),
        ConflictResolver::default(),
        options,
        SyncClock::starting_at(T0),
    );
    Harness {
        engine,
        store,
        remote,
    }
}

pub fn harness() -> Harness {
    harness_with(Arc::new(MemoryStore::new()), FakeExternalStore::new(), options())
}

/// Let workers and timers run for a while of paused time.
pub async fn run_for(secs: u64) {
    tokio::time::sleep(Duration::from_secs(secs)).await;
}
