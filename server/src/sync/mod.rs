//! Sync runtime.
//!
//! [`SyncEngine`] owns the worker pool, the request queue and the periodic
//! scheduler. Workers run two kinds of jobs: pushing one change log entry
//! ([`Job::Push`]) and pulling one entity kind ([`Job::Pull`]). All state
//! changes go through the [`LocalStore`], one transaction per transition;
//! the queue only ever holds ids, so nothing is lost when it is dropped.

mod pull;
mod push;

use crate::client::{ClientError, ClientStats, RateLimitedClient};
use crate::queue::{Priority, QueueError, QueueFullPolicy, RequestQueue};
use crate::store::{LocalStore, StoreError};
use dashmap::DashSet;
use ferry_engine::{
    ChangeId, ChangeLogEntry, Committed, ConflictDecision, ConflictId, ConflictRecord,
    ConflictResolver, ConflictStatus, EntityKind, EntityMapper, Error, ExternalId, Fields, LocalId,
    MappingDiagnostic, RetryPolicy, SyncIndicator, SyncStatus, Timestamp, Version, WriteReceipt,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Interval of the outbox garbage collector.
const GC_INTERVAL: Duration = Duration::from_secs(3600);

/// Sync runtime errors.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("External API error: {0}")]
    Client(#[from] ClientError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("unknown entity kind: {0}")]
    UnknownKind(EntityKind),
}

impl From<Error> for SyncError {
    fn from(err: Error) -> Self {
        SyncError::Store(StoreError::Engine(err))
    }
}

/// Runtime tuning.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub queue_full_policy: QueueFullPolicy,
    pub interactive_burst: u32,
    pub pull_interval: Duration,
    pub pump_interval: Duration,
    /// How long settled change log entries are kept
    pub outbox_retention: Duration,
    pub retry: RetryPolicy,
    /// Kinds pulled in the background; all mapped kinds when empty
    pub kinds: Vec<EntityKind>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_capacity: 256,
            queue_full_policy: QueueFullPolicy::Block,
            interactive_burst: 4,
            pull_interval: Duration::from_secs(60),
            pump_interval: Duration::from_secs(1),
            outbox_retention: Duration::from_secs(72 * 3600),
            retry: RetryPolicy::default(),
            kinds: Vec::new(),
        }
    }
}

/// Wall-clock milliseconds that follow tokio's clock.
///
/// The epoch offset is read once; afterwards time advances with
/// [`tokio::time::Instant`], so paused-time tests control it.
#[derive(Debug, Clone, Copy)]
pub struct SyncClock {
    origin_ms: Timestamp,
    origin: Instant,
}

impl SyncClock {
    pub fn system() -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self::starting_at(u64::try_from(now).unwrap_or_default())
    }

    pub fn starting_at(origin_ms: Timestamp) -> Self {
        Self {
            origin_ms,
            origin: Instant::now(),
        }
    }

    pub fn now(&self) -> Timestamp {
        self.origin_ms + self.origin.elapsed().as_millis() as u64
    }
}

/// Unit of work for a queue worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Job {
    Push(ChangeId),
    Pull(EntityKind),
}

/// Answer to an interactive sync request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncTicket {
    pub local_id: LocalId,
    /// Entry queued for push, if one was due
    pub change_id: Option<ChangeId>,
    pub queued: bool,
    pub status: SyncStatus,
    pub indicator: SyncIndicator,
}

/// Sync state of one entity as shown to users.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityStatus {
    pub local_id: LocalId,
    pub kind: EntityKind,
    pub external_id: Option<ExternalId>,
    pub local_version: Version,
    pub status: SyncStatus,
    pub indicator: SyncIndicator,
    pub last_synced_at: Option<Timestamp>,
    pub deleted: bool,
    pub fields: Fields,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub client: ClientStats,
    pub queued_jobs: usize,
    pub open_changes: usize,
    pub pushed: u64,
    pub gave_up: u64,
    pub pulled: u64,
}

struct Inner {
    store: Arc<dyn LocalStore>,
    client: Arc<RateLimitedClient>,
    mapper: EntityMapper,
    resolver: ConflictResolver,
    options: SyncOptions,
    clock: SyncClock,
    queue: Arc<RequestQueue<Job>>,
    /// Jobs waiting in the queue, for deduplication
    queued: DashSet<Job>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
    pushed: AtomicU64,
    gave_up: AtomicU64,
    pulled: AtomicU64,
}

/// Handle to the sync runtime. Cheap to clone.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn LocalStore>,
        client: Arc<RateLimitedClient>,
        mapper: EntityMapper,
        resolver: ConflictResolver,
        options: SyncOptions,
    ) -> Self {
        Self::with_clock(store, client, mapper, resolver, options, SyncClock::system())
    }

    pub fn with_clock(
        store: Arc<dyn LocalStore>,
        client: Arc<RateLimitedClient>,
        mapper: EntityMapper,
        resolver: ConflictResolver,
        options: SyncOptions,
        clock: SyncClock,
    ) -> Self {
        let queue = Arc::new(RequestQueue::new(
            options.queue_capacity,
            options.queue_full_policy,
            options.interactive_burst,
        ));
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                store,
                client,
                mapper,
                resolver,
                options,
                clock,
                queue,
                queued: DashSet::new(),
                tasks: Mutex::new(Vec::new()),
                shutdown,
                started: AtomicBool::new(false),
                pushed: AtomicU64::new(0),
                gave_up: AtomicU64::new(0),
                pulled: AtomicU64::new(0),
            }),
        }
    }

    fn now(&self) -> Timestamp {
        self.inner.clock.now()
    }

    fn store(&self) -> &dyn LocalStore {
        self.inner.store.as_ref()
    }

    fn resolver(&self) -> &ConflictResolver {
        &self.inner.resolver
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Recover interrupted pushes, then start the workers and the scheduler.
    ///
    /// Returns the number of entities whose in-flight entry was recovered.
    pub async fn start(&self) -> Result<usize, SyncError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(0);
        }

        let recovered = self.store().recover(self.resolver(), self.now()).await?;
        if recovered > 0 {
            tracing::info!(recovered, "Recovered interrupted pushes");
        }

        let engine = self.clone();
        let mut handles = self.inner.queue.drain(self.inner.options.worker_count, move |job| {
            let engine = engine.clone();
            async move { engine.run_job(job).await }
        });
        let shutdown = self.inner.shutdown.subscribe();
        handles.push(tokio::spawn(self.clone().schedule(shutdown)));
        self.inner.tasks.lock().await.extend(handles);

        tracing::info!(
            workers = self.inner.options.worker_count,
            "Sync engine started"
        );
        Ok(recovered)
    }

    async fn schedule(self, mut shutdown: watch::Receiver<bool>) {
        let mut pump = tokio::time::interval(self.inner.options.pump_interval);
        let mut pull = tokio::time::interval(self.inner.options.pull_interval);
        let mut gc = tokio::time::interval(GC_INTERVAL);
        for timer in [&mut pump, &mut pull, &mut gc] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = pump.tick() => self.pump().await,
                _ = pull.tick() => {
                    if let Err(e) = self.schedule_background_sync().await {
                        tracing::warn!(error = %e, "Background sync not scheduled");
                    }
                }
                _ = gc.tick() => self.collect_garbage().await,
            }
        }
        tracing::debug!("Sync scheduler stopped");
    }

    /// Stop accepting work and wait for running jobs.
    ///
    /// Queued jobs are dropped; their entries stay in the outbox.
    pub async fn shutdown(&self, timeout: Duration) {
        let _ = self.inner.shutdown.send(true);
        self.inner.queue.close().await;

        let handles: Vec<JoinHandle<()>> = self.inner.tasks.lock().await.drain(..).collect();
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        if tokio::time::timeout(timeout, futures::future::join_all(handles))
            .await
            .is_err()
        {
            tracing::warn!("Sync workers did not stop in time; aborting");
            for abort in aborts {
                abort.abort();
            }
        }
        tracing::info!("Sync engine stopped");
    }

    // ========================================================================
    // Queueing
    // ========================================================================

    /// Queue a job unless an identical one is waiting. Interactive jobs are
    /// always queued; a duplicate push is rejected by `claim`.
    async fn submit(&self, job: Job, priority: Priority, wait: bool) -> Result<bool, QueueError> {
        let fresh = self.inner.queued.insert(job.clone());
        if !fresh && priority == Priority::Background {
            return Ok(false);
        }

        let queue = &self.inner.queue;
        let result = if wait {
            queue.enqueue(job.clone(), priority).await
        } else {
            queue.offer(job.clone(), priority).await
        };
        if result.is_err() && fresh {
            self.inner.queued.remove(&job);
        }
        result.map(|_| true)
    }

    /// Queue the head entry of an entity if it may be pushed now.
    async fn submit_head(&self, local_id: LocalId, priority: Priority) -> Result<Option<ChangeId>, SyncError> {
        let Some(change_id) = self.store().dispatchable_for(local_id, self.now()).await? else {
            return Ok(None);
        };
        match self.submit(Job::Push(change_id), priority, false).await {
            Ok(_) => Ok(Some(change_id)),
            Err(e) => {
                tracing::debug!(local_id, change_id, error = %e, "Push left for the scheduler");
                Ok(None)
            }
        }
    }

    async fn run_job(&self, job: Job) {
        // Dequeued jobs may be queued again; claim rejects a second runner.
        self.inner.queued.remove(&job);
        let result = match &job {
            Job::Push(change_id) => self.push(*change_id).await,
            Job::Pull(kind) => self.pull(kind).await.map(|_| ()),
        };
        if let Err(e) = result {
            tracing::error!(job = ?job, error = %e, "Sync job failed");
        }
    }

    /// Queue every due outbox entry.
    async fn pump(&self) {
        let now = self.now();
        let ids = match self
            .store()
            .dispatchable(now, self.inner.options.queue_capacity)
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                tracing::error!(error = %e, "Outbox scan failed");
                return;
            }
        };

        for change_id in ids {
            match self.submit(Job::Push(change_id), Priority::Background, false).await {
                Ok(_) => {}
                Err(QueueError::Full) => break,
                Err(QueueError::Closed) => return,
            }
        }
    }

    async fn collect_garbage(&self) {
        let retention = self.inner.options.outbox_retention.as_millis() as u64;
        match self.store().collect_garbage(retention, self.now()).await {
            Ok(0) => {}
            Ok(removed) => tracing::debug!(removed, "Collected settled outbox entries"),
            Err(e) => tracing::warn!(error = %e, "Outbox garbage collection failed"),
        }
    }

    // ========================================================================
    // Web layer
    // ========================================================================

    fn check_kind(&self, kind: &str) -> Result<(), SyncError> {
        self.inner
            .mapper
            .mapping(kind)
            .map(|_| ())
            .map_err(|_| SyncError::UnknownKind(kind.to_string()))
    }

    /// Insert an entity; its create entry is committed with it.
    pub async fn record_create(&self, kind: &str, fields: Fields) -> Result<WriteReceipt, SyncError> {
        self.check_kind(kind)?;
        let receipt = self.store().create(kind, fields, self.now()).await?;
        tracing::info!(local_id = receipt.local_id, change_id = receipt.change_id, kind = %kind, "Entity created");
        self.submit_head(receipt.local_id, Priority::Background).await?;
        Ok(receipt)
    }

    pub async fn record_update(&self, local_id: LocalId, fields: Fields) -> Result<WriteReceipt, SyncError> {
        let receipt = self.store().update(local_id, fields, self.now()).await?;
        tracing::info!(local_id, change_id = receipt.change_id, "Entity updated");
        self.submit_head(local_id, Priority::Background).await?;
        Ok(receipt)
    }

    pub async fn record_delete(&self, local_id: LocalId) -> Result<WriteReceipt, SyncError> {
        let receipt = self.store().delete(local_id, self.now()).await?;
        tracing::info!(local_id, change_id = receipt.change_id, "Entity deleted");
        self.submit_head(local_id, Priority::Background).await?;
        Ok(receipt)
    }

    /// Push an entity's pending changes ahead of background work.
    ///
    /// Never fails because of the external store; the ticket reports where
    /// the entity stands.
    pub async fn request_sync(&self, local_id: LocalId, priority: Priority) -> Result<SyncTicket, SyncError> {
        let now = self.now();
        let head = self.store().dispatchable_for(local_id, now).await?;

        let mut queued = false;
        if let Some(change_id) = head {
            match self.submit(Job::Push(change_id), priority, true).await {
                Ok(q) => queued = q,
                Err(e) => tracing::warn!(local_id, change_id, error = %e, "Sync request not queued"),
            }
        }

        let entity = self
            .store()
            .entity(local_id)
            .await?
            .ok_or(Error::EntityNotFound(local_id))?;
        let indicator = self.store().sync_indicator(local_id).await?;
        Ok(SyncTicket {
            local_id,
            change_id: head,
            queued,
            status: entity.status,
            indicator,
        })
    }

    /// Queue a pull of every configured kind and all due pushes.
    ///
    /// Returns the number of pulls queued.
    pub async fn schedule_background_sync(&self) -> Result<usize, SyncError> {
        let kinds: Vec<EntityKind> = if self.inner.options.kinds.is_empty() {
            self.inner.mapper.kinds().cloned().collect()
        } else {
            self.inner.options.kinds.clone()
        };

        let mut scheduled = 0;
        for kind in kinds {
            if self.submit(Job::Pull(kind), Priority::Background, false).await? {
                scheduled += 1;
            }
        }
        self.pump().await;
        Ok(scheduled)
    }

    pub async fn sync_status(&self, local_id: LocalId) -> Result<EntityStatus, SyncError> {
        let entity = self
            .store()
            .entity(local_id)
            .await?
            .ok_or(Error::EntityNotFound(local_id))?;
        let indicator = self.store().sync_indicator(local_id).await?;
        Ok(EntityStatus {
            local_id,
            kind: entity.kind,
            external_id: entity.external_id,
            local_version: entity.local_version,
            status: entity.status,
            indicator,
            last_synced_at: entity.last_synced_at,
            deleted: entity.deleted,
            fields: entity.fields,
        })
    }

    // ========================================================================
    // Admin
    // ========================================================================

    pub async fn list_conflicts(&self, status: Option<ConflictStatus>) -> Result<Vec<ConflictRecord>, SyncError> {
        Ok(self.store().conflicts(status).await?)
    }

    pub async fn resolve_conflict(
        &self,
        conflict_id: ConflictId,
        decision: ConflictDecision,
    ) -> Result<Committed, SyncError> {
        let committed = self
            .store()
            .resolve_conflict(conflict_id, decision, self.now())
            .await?;
        tracing::info!(conflict_id, outcome = ?committed.outcome, "Conflict resolved");

        let conflicts = self.store().conflicts(None).await?;
        if let Some(conflict) = conflicts.iter().find(|c| c.id == conflict_id) {
            self.submit_head(conflict.local_id, Priority::Interactive).await?;
        }
        Ok(committed)
    }

    pub async fn list_failed_operations(&self) -> Result<Vec<ChangeLogEntry>, SyncError> {
        Ok(self.store().failed_changes().await?)
    }

    /// Reset a failed entry's attempts and queue it again.
    pub async fn retry_failed_operation(&self, change_id: ChangeId) -> Result<Committed, SyncError> {
        let failed = self.store().failed_changes().await?;
        let local_id = failed
            .iter()
            .find(|e| e.id == change_id)
            .map(|e| e.local_id);

        let committed = self
            .store()
            .retry_failed(change_id, self.resolver(), self.now())
            .await?;
        tracing::info!(change_id, "Failed operation retried");

        if let Some(local_id) = local_id {
            self.submit_head(local_id, Priority::Interactive).await?;
        }
        Ok(committed)
    }

    pub async fn list_diagnostics(&self) -> Result<Vec<MappingDiagnostic>, SyncError> {
        Ok(self.store().diagnostics().await?)
    }

    pub async fn stats(&self) -> Result<EngineStats, SyncError> {
        Ok(EngineStats {
            client: self.inner.client.stats(),
            queued_jobs: self.inner.queue.len().await,
            open_changes: self.store().open_change_count().await?,
            pushed: self.inner.pushed.load(Ordering::Relaxed),
            gave_up: self.inner.gave_up.load(Ordering::Relaxed),
            pulled: self.inner.pulled.load(Ordering::Relaxed),
        })
    }
}
