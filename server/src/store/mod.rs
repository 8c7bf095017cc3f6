//! Durable local state behind the sync runtime.
//!
//! [`LocalStore`] mirrors the engine's [`Store`] API. Each method is one
//! transaction: load the affected ledger, apply a single engine transition,
//! write the result back. [`MemoryStore`] wraps the engine's in-memory store
//! behind a mutex; [`PgStore`] persists to PostgreSQL.

mod postgres;

pub use postgres::PgStore;

use async_trait::async_trait;
use ferry_engine::{
    ChangeId, ChangeLogEntry, Committed, ConflictDecision, ConflictId, ConflictRecord,
    ConflictResolver, ConflictStatus, Fields, LocalId, MappingDiagnostic, PullReport, PushTask,
    RemoteAck, RemoteBatch, RemoteChange, Store, StoreSnapshot, SyncCursor, SyncIndicator,
    SyncableEntity, Timestamp, WriteReceipt,
};
use tokio::sync::Mutex;

/// Store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Engine(#[from] ferry_engine::Error),

    #[error("Corrupt stored value: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    /// The engine error, if this is one.
    pub fn engine(&self) -> Option<&ferry_engine::Error> {
        match self {
            StoreError::Engine(e) => Some(e),
            _ => None,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait LocalStore: Send + Sync {
    // Local writes, each committed together with its change log entry
    async fn create(&self, kind: &str, fields: Fields, now: Timestamp) -> StoreResult<WriteReceipt>;
    async fn update(&self, local_id: LocalId, fields: Fields, now: Timestamp) -> StoreResult<WriteReceipt>;
    async fn delete(&self, local_id: LocalId, now: Timestamp) -> StoreResult<WriteReceipt>;

    async fn entity(&self, local_id: LocalId) -> StoreResult<Option<SyncableEntity>>;
    async fn sync_indicator(&self, local_id: LocalId) -> StoreResult<SyncIndicator>;
    async fn open_change_count(&self) -> StoreResult<usize>;

    // Push lifecycle
    async fn dispatchable(&self, now: Timestamp, limit: usize) -> StoreResult<Vec<ChangeId>>;
    async fn dispatchable_for(&self, local_id: LocalId, now: Timestamp) -> StoreResult<Option<ChangeId>>;
    async fn claim(&self, change_id: ChangeId, now: Timestamp) -> StoreResult<PushTask>;
    async fn confirm(
        &self,
        change_id: ChangeId,
        ack: &RemoteAck,
        resolver: &ConflictResolver,
        now: Timestamp,
    ) -> StoreResult<Committed>;
    async fn reschedule(
        &self,
        change_id: ChangeId,
        retry_at: Timestamp,
        error: &str,
        resolver: &ConflictResolver,
        now: Timestamp,
    ) -> StoreResult<Committed>;
    async fn give_up(&self, change_id: ChangeId, error: &str, now: Timestamp) -> StoreResult<Committed>;
    async fn observe_remote(
        &self,
        local_id: LocalId,
        remote: RemoteChange,
        resolver: &ConflictResolver,
        now: Timestamp,
    ) -> StoreResult<Committed>;

    // Pull
    async fn apply_remote(
        &self,
        batch: RemoteBatch,
        resolver: &ConflictResolver,
        now: Timestamp,
    ) -> StoreResult<PullReport>;
    async fn apply_full_sync(
        &self,
        batch: RemoteBatch,
        resolver: &ConflictResolver,
        now: Timestamp,
    ) -> StoreResult<PullReport>;
    async fn cursor(&self, kind: &str) -> StoreResult<Option<SyncCursor>>;
    async fn reset_cursor(&self, kind: &str) -> StoreResult<()>;
    async fn diagnostics(&self) -> StoreResult<Vec<MappingDiagnostic>>;

    // Admin
    async fn conflicts(&self, status: Option<ConflictStatus>) -> StoreResult<Vec<ConflictRecord>>;
    async fn resolve_conflict(
        &self,
        conflict_id: ConflictId,
        decision: ConflictDecision,
        now: Timestamp,
    ) -> StoreResult<Committed>;
    async fn failed_changes(&self) -> StoreResult<Vec<ChangeLogEntry>>;
    async fn retry_failed(
        &self,
        change_id: ChangeId,
        resolver: &ConflictResolver,
        now: Timestamp,
    ) -> StoreResult<Committed>;

    // Maintenance
    async fn recover(&self, resolver: &ConflictResolver, now: Timestamp) -> StoreResult<usize>;
    async fn collect_garbage(&self, retention_ms: u64, now: Timestamp) -> StoreResult<usize>;
}

/// The engine's in-memory store behind an async mutex.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Store>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore from a snapshot taken with [`MemoryStore::snapshot`].
    pub fn from_snapshot(snapshot: StoreSnapshot) -> StoreResult<Self> {
        Ok(Self {
            inner: Mutex::new(Store::from_snapshot(snapshot)?),
        })
    }

    pub async fn snapshot(&self) -> StoreSnapshot {
        self.inner.lock().await.export_state()
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn create(&self, kind: &str, fields: Fields, now: Timestamp) -> StoreResult<WriteReceipt> {
        Ok(self.inner.lock().await.create(kind, fields, now)?)
    }

    async fn update(&self, local_id: LocalId, fields: Fields, now: Timestamp) -> StoreResult<WriteReceipt> {
        Ok(self.inner.lock().await.update(local_id, fields, now)?)
    }

    async fn delete(&self, local_id: LocalId, now: Timestamp) -> StoreResult<WriteReceipt> {
        Ok(self.inner.lock().await.delete(local_id, now)?)
    }

    async fn entity(&self, local_id: LocalId) -> StoreResult<Option<SyncableEntity>> {
        Ok(self.inner.lock().await.entity(local_id).cloned())
    }

    async fn sync_indicator(&self, local_id: LocalId) -> StoreResult<SyncIndicator> {
        Ok(self.inner.lock().await.sync_indicator(local_id)?)
    }

    async fn open_change_count(&self) -> StoreResult<usize> {
        Ok(self.inner.lock().await.open_change_count())
    }

    async fn dispatchable(&self, now: Timestamp, limit: usize) -> StoreResult<Vec<ChangeId>> {
        Ok(self.inner.lock().await.dispatchable(now, limit))
    }

    async fn dispatchable_for(&self, local_id: LocalId, now: Timestamp) -> StoreResult<Option<ChangeId>> {
        Ok(self.inner.lock().await.dispatchable_for(local_id, now)?)
    }

    async fn claim(&self, change_id: ChangeId, now: Timestamp) -> StoreResult<PushTask> {
        Ok(self.inner.lock().await.claim(change_id, now)?)
    }

    async fn confirm(
        &self,
        change_id: ChangeId,
        ack: &RemoteAck,
        resolver: &ConflictResolver,
        now: Timestamp,
    ) -> StoreResult<Committed> {
        Ok(self.inner.lock().await.confirm(change_id, ack, resolver, now)?)
    }

    async fn reschedule(
        &self,
        change_id: ChangeId,
        retry_at: Timestamp,
        error: &str,
        resolver: &ConflictResolver,
        now: Timestamp,
    ) -> StoreResult<Committed> {
        Ok(self
            .inner
            .lock()
            .await
            .reschedule(change_id, retry_at, error, resolver, now)?)
    }

    async fn give_up(&self, change_id: ChangeId, error: &str, now: Timestamp) -> StoreResult<Committed> {
        Ok(self.inner.lock().await.give_up(change_id, error, now)?)
    }

    async fn observe_remote(
        &self,
        local_id: LocalId,
        remote: RemoteChange,
        resolver: &ConflictResolver,
        now: Timestamp,
    ) -> StoreResult<Committed> {
        Ok(self
            .inner
            .lock()
            .await
            .observe_remote(local_id, remote, resolver, now)?)
    }

    async fn apply_remote(
        &self,
        batch: RemoteBatch,
        resolver: &ConflictResolver,
        now: Timestamp,
    ) -> StoreResult<PullReport> {
        Ok(self.inner.lock().await.apply_remote(batch, resolver, now)?)
    }

    async fn apply_full_sync(
        &self,
        batch: RemoteBatch,
        resolver: &ConflictResolver,
        now: Timestamp,
    ) -> StoreResult<PullReport> {
        Ok(self.inner.lock().await.apply_full_sync(batch, resolver, now)?)
    }

    async fn cursor(&self, kind: &str) -> StoreResult<Option<SyncCursor>> {
        Ok(self.inner.lock().await.cursor(kind).cloned())
    }

    async fn reset_cursor(&self, kind: &str) -> StoreResult<()> {
        self.inner.lock().await.reset_cursor(kind);
        Ok(())
    }

    async fn diagnostics(&self) -> StoreResult<Vec<MappingDiagnostic>> {
        Ok(self
            .inner
            .lock()
            .await
            .diagnostics()
            .into_iter()
            .cloned()
            .collect())
    }

    async fn conflicts(&self, status: Option<ConflictStatus>) -> StoreResult<Vec<ConflictRecord>> {
        Ok(self
            .inner
            .lock()
            .await
            .conflicts(status)
            .into_iter()
            .cloned()
            .collect())
    }

    async fn resolve_conflict(
        &self,
        conflict_id: ConflictId,
        decision: ConflictDecision,
        now: Timestamp,
    ) -> StoreResult<Committed> {
        Ok(self
            .inner
            .lock()
            .await
            .resolve_conflict(conflict_id, decision, now)?)
    }

    async fn failed_changes(&self) -> StoreResult<Vec<ChangeLogEntry>> {
        Ok(self
            .inner
            .lock()
            .await
            .failed_changes()
            .into_iter()
            .cloned()
            .collect())
    }

    async fn retry_failed(
        &self,
        change_id: ChangeId,
        resolver: &ConflictResolver,
        now: Timestamp,
    ) -> StoreResult<Committed> {
        Ok(self.inner.lock().await.retry_failed(change_id, resolver, now)?)
    }

    async fn recover(&self, resolver: &ConflictResolver, now: Timestamp) -> StoreResult<usize> {
        Ok(self.inner.lock().await.recover(resolver, now)?)
    }

    async fn collect_garbage(&self, retention_ms: u64, now: Timestamp) -> StoreResult<usize> {
        Ok(self.inner.lock().await.collect_garbage(retention_ms, now))
    }
}
