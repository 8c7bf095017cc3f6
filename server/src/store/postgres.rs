//! PostgreSQL persistence.
//!
//! Every mutation runs in one transaction that locks the entity row and its
//! open change log entries (`FOR UPDATE`), applies one engine transition and
//! writes the ledger back.

use super::{LocalStore, StoreResult};
use async_trait::async_trait;
use ferry_engine::{
    ChangeId, ChangeLogEntry, ChangeOp, ChangeStatus, Committed, ConflictDecision, ConflictId,
    ConflictRecord, ConflictResolver, ConflictStatus, Effects, Error, ExternalId, Fields, Ledger,
    LocalId, MappingDiagnostic, Outcome, PullReport, PushTask, RemoteAck, RemoteBatch,
    RemoteChange, SyncCursor, SyncIndicator, SyncStatus, SyncableEntity, Timestamp, WriteReceipt,
};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, PgPool, Row};
use std::collections::{BTreeMap, BTreeSet};

const ENTITY_SELECT: &str = r#"
    SELECT local_id, kind, external_id, local_version, external_version, last_synced_at,
           status, fields, extras, sync_state, updated_at, deleted, schema_version
    FROM sync_entities
"#;

const CHANGE_SELECT: &str = r#"
    SELECT id, local_id, kind, op, payload, local_version, enqueued_at, attempts, status,
           next_attempt_at, first_attempt_at, completed_at, last_error
    FROM change_log
"#;

const CONFLICT_SELECT: &str = r#"
    SELECT id, local_id, kind, local, local_deleted, remote, ancestor, fields,
           detected_at, status, resolved_at
    FROM sync_conflicts
"#;

const OPEN_STATUSES: &str = "('pending', 'in_flight', 'failed_permanent')";

fn decode_error(column: &str, value: &str) -> sqlx::Error {
    sqlx::Error::Decode(format!("invalid {column} value: {value}").into())
}

/// Sync metadata kept in one JSONB column.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncState {
    #[serde(default)]
    base: Option<Fields>,
    #[serde(default)]
    field_updated_at: BTreeMap<String, Timestamp>,
    #[serde(default)]
    remote_edited_at: Option<Timestamp>,
    #[serde(default)]
    deferred_remote: Option<RemoteChange>,
}

impl SyncState {
    fn of(entity: &SyncableEntity) -> Self {
        Self {
            base: entity.base.clone(),
            field_updated_at: entity.field_updated_at.clone(),
            remote_edited_at: entity.remote_edited_at,
            deferred_remote: entity.deferred_remote.clone(),
        }
    }
}

struct EntityRow(SyncableEntity);

impl<'r> FromRow<'r, PgRow> for EntityRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let status = SyncStatus::parse(&status).ok_or_else(|| decode_error("status", &status))?;
        let Json(state): Json<SyncState> = row.try_get("sync_state")?;
        let Json(fields): Json<Fields> = row.try_get("fields")?;
        let Json(extras): Json<Fields> = row.try_get("extras")?;

        Ok(EntityRow(SyncableEntity {
            local_id: row.try_get::<i64, _>("local_id")? as LocalId,
            kind: row.try_get("kind")?,
            external_id: row.try_get("external_id")?,
            local_version: row.try_get::<i64, _>("local_version")? as u64,
            external_version: row.try_get("external_version")?,
            last_synced_at: row
                .try_get::<Option<i64>, _>("last_synced_at")?
                .map(|v| v as Timestamp),
            status,
            fields,
            extras,
            base: state.base,
            field_updated_at: state.field_updated_at,
            updated_at: row.try_get::<i64, _>("updated_at")? as Timestamp,
            remote_edited_at: state.remote_edited_at,
            deleted: row.try_get("deleted")?,
            schema_version: row.try_get::<i32, _>("schema_version")? as u32,
            deferred_remote: state.deferred_remote,
        }))
    }
}

struct ChangeRow(ChangeLogEntry);

impl<'r> FromRow<'r, PgRow> for ChangeRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let op: String = row.try_get("op")?;
        let op = ChangeOp::parse(&op).ok_or_else(|| decode_error("op", &op))?;
        let status: String = row.try_get("status")?;
        let status = ChangeStatus::parse(&status).ok_or_else(|| decode_error("status", &status))?;
        let Json(payload): Json<Fields> = row.try_get("payload")?;
        let millis = |column: &str| -> Result<Option<Timestamp>, sqlx::Error> {
            Ok(row.try_get::<Option<i64>, _>(column)?.map(|v| v as Timestamp))
        };

        Ok(ChangeRow(ChangeLogEntry {
            id: row.try_get::<i64, _>("id")? as ChangeId,
            local_id: row.try_get::<i64, _>("local_id")? as LocalId,
            kind: row.try_get("kind")?,
            op,
            payload,
            local_version: row.try_get::<i64, _>("local_version")? as u64,
            enqueued_at: row.try_get::<i64, _>("enqueued_at")? as Timestamp,
            attempts: row.try_get::<i32, _>("attempts")? as u32,
            status,
            next_attempt_at: millis("next_attempt_at")?,
            first_attempt_at: millis("first_attempt_at")?,
            completed_at: millis("completed_at")?,
            last_error: row.try_get("last_error")?,
        }))
    }
}

struct ConflictRow(ConflictRecord);

impl<'r> FromRow<'r, PgRow> for ConflictRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let status =
            ConflictStatus::parse(&status).ok_or_else(|| decode_error("status", &status))?;
        let Json(local): Json<Fields> = row.try_get("local")?;
        let Json(remote): Json<RemoteChange> = row.try_get("remote")?;
        let ancestor: Option<Json<Fields>> = row.try_get("ancestor")?;
        let Json(fields): Json<Vec<String>> = row.try_get("fields")?;

        Ok(ConflictRow(ConflictRecord {
            id: row.try_get::<i64, _>("id")? as ConflictId,
            local_id: row.try_get::<i64, _>("local_id")? as LocalId,
            kind: row.try_get("kind")?,
            local,
            local_deleted: row.try_get("local_deleted")?,
            remote,
            ancestor: ancestor.map(|Json(a)| a),
            fields,
            detected_at: row.try_get::<i64, _>("detected_at")? as Timestamp,
            status,
            resolved_at: row
                .try_get::<Option<i64>, _>("resolved_at")?
                .map(|v| v as Timestamp),
        }))
    }
}

struct CursorRow(SyncCursor);

impl<'r> FromRow<'r, PgRow> for CursorRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(CursorRow(SyncCursor {
            kind: row.try_get("kind")?,
            token: row.try_get("token")?,
            updated_at: row.try_get::<i64, _>("updated_at")? as Timestamp,
        }))
    }
}

struct DiagnosticRow(MappingDiagnostic);

impl<'r> FromRow<'r, PgRow> for DiagnosticRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(DiagnosticRow(MappingDiagnostic {
            id: row.try_get::<i64, _>("id")? as u64,
            kind: row.try_get("kind")?,
            external_id: row.try_get("external_id")?,
            payload: row.try_get("payload")?,
            error: row.try_get("error")?,
            detected_at: row.try_get::<i64, _>("detected_at")? as Timestamp,
        }))
    }
}

// ============================================================================
// Ledger load / save
// ============================================================================

async fn load(conn: &mut PgConnection, local_id: LocalId) -> StoreResult<Ledger> {
    let sql = format!("{ENTITY_SELECT} WHERE local_id = $1 FOR UPDATE");
    let entity = sqlx::query_as::<_, EntityRow>(&sql)
        .bind(local_id as i64)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(Error::EntityNotFound(local_id))?
        .0;

    let sql = format!("{CHANGE_SELECT} WHERE local_id = $1 AND status IN {OPEN_STATUSES} ORDER BY id FOR UPDATE");
    let open = sqlx::query_as::<_, ChangeRow>(&sql)
        .bind(local_id as i64)
        .fetch_all(&mut *conn)
        .await?
        .into_iter()
        .map(|r| r.0)
        .collect();

    let sql = format!("{CONFLICT_SELECT} WHERE local_id = $1 AND status = 'unresolved' FOR UPDATE");
    let conflict = sqlx::query_as::<_, ConflictRow>(&sql)
        .bind(local_id as i64)
        .fetch_optional(&mut *conn)
        .await?
        .map(|r| r.0);

    Ok(Ledger::new(entity, open, conflict))
}

async fn next_local_id(conn: &mut PgConnection) -> StoreResult<LocalId> {
    let id: i64 = sqlx::query_scalar("SELECT nextval(pg_get_serial_sequence('sync_entities', 'local_id'))")
        .fetch_one(&mut *conn)
        .await?;
    Ok(id as LocalId)
}

async fn insert_entity(conn: &mut PgConnection, entity: &SyncableEntity) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO sync_entities (
            local_id, kind, external_id, local_version, external_version, last_synced_at,
            status, fields, extras, sync_state, updated_at, deleted, schema_version
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        "#,
    )
    .bind(entity.local_id as i64)
    .bind(&entity.kind)
    .bind(&entity.external_id)
    .bind(entity.local_version as i64)
    .bind(&entity.external_version)
    .bind(entity.last_synced_at.map(|v| v as i64))
    .bind(entity.status.as_str())
    .bind(Json(&entity.fields))
    .bind(Json(&entity.extras))
    .bind(Json(SyncState::of(entity)))
    .bind(entity.updated_at as i64)
    .bind(entity.deleted)
    .bind(entity.schema_version as i32)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn save(conn: &mut PgConnection, ledger: Ledger, effects: Effects) -> StoreResult<Committed> {
    let Ledger {
        entity,
        open,
        conflict,
    } = ledger;

    sqlx::query(
        r#"
        UPDATE sync_entities SET
            external_id = $2, local_version = $3, external_version = $4, last_synced_at = $5,
            status = $6, fields = $7, extras = $8, sync_state = $9, updated_at = $10,
            deleted = $11, schema_version = $12
        WHERE local_id = $1
        "#,
    )
    .bind(entity.local_id as i64)
    .bind(&entity.external_id)
    .bind(entity.local_version as i64)
    .bind(&entity.external_version)
    .bind(entity.last_synced_at.map(|v| v as i64))
    .bind(entity.status.as_str())
    .bind(Json(&entity.fields))
    .bind(Json(&entity.extras))
    .bind(Json(SyncState::of(&entity)))
    .bind(entity.updated_at as i64)
    .bind(entity.deleted)
    .bind(entity.schema_version as i32)
    .execute(&mut *conn)
    .await?;

    for entry in &open {
        sqlx::query(
            r#"
            UPDATE change_log SET
                attempts = $2, status = $3, next_attempt_at = $4, first_attempt_at = $5,
                completed_at = $6, last_error = $7
            WHERE id = $1
            "#,
        )
        .bind(entry.id as i64)
        .bind(entry.attempts as i32)
        .bind(entry.status.as_str())
        .bind(entry.next_attempt_at.map(|v| v as i64))
        .bind(entry.first_attempt_at.map(|v| v as i64))
        .bind(entry.completed_at.map(|v| v as i64))
        .bind(&entry.last_error)
        .execute(&mut *conn)
        .await?;
    }

    if let Some(conflict) = &conflict {
        sqlx::query("UPDATE sync_conflicts SET remote = $2, status = $3, resolved_at = $4 WHERE id = $1")
            .bind(conflict.id as i64)
            .bind(Json(&conflict.remote))
            .bind(conflict.status.as_str())
            .bind(conflict.resolved_at.map(|v| v as i64))
            .execute(&mut *conn)
            .await?;
    }

    let mut change_ids = Vec::with_capacity(effects.changes.len());
    for draft in effects.changes {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO change_log (local_id, kind, op, payload, local_version, enqueued_at, status)
            VALUES ($1, $2, $3, $4, $5, $6, 'pending')
            RETURNING id
            "#,
        )
        .bind(draft.local_id as i64)
        .bind(&draft.kind)
        .bind(draft.op.as_str())
        .bind(Json(&draft.payload))
        .bind(draft.local_version as i64)
        .bind(draft.enqueued_at as i64)
        .fetch_one(&mut *conn)
        .await?;
        change_ids.push(id as ChangeId);
    }

    let conflict_id = match effects.conflict {
        Some(draft) => {
            let id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO sync_conflicts (
                    local_id, kind, local, local_deleted, remote, ancestor, fields,
                    detected_at, status
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'unresolved')
                RETURNING id
                "#,
            )
            .bind(draft.local_id as i64)
            .bind(&draft.kind)
            .bind(Json(&draft.local))
            .bind(draft.local_deleted)
            .bind(Json(&draft.remote))
            .bind(draft.ancestor.as_ref().map(Json))
            .bind(Json(&draft.fields))
            .bind(draft.detected_at as i64)
            .fetch_one(&mut *conn)
            .await?;
            Some(id as ConflictId)
        }
        None => None,
    };

    Ok(Committed {
        outcome: effects.outcome,
        change_ids,
        conflict_id,
    })
}

/// Owner and status of a change log entry.
/// Drop a pulled copy of the record `local_id` created, so the creating
/// entity can take its external id. A copy with local history stays put.
async fn release_shadow(
    conn: &mut PgConnection,
    kind: &str,
    external_id: &str,
    local_id: LocalId,
) -> StoreResult<()> {
    let owner: Option<i64> = sqlx::query_scalar(
        "SELECT local_id FROM sync_entities WHERE kind = $1 AND external_id = $2 AND local_id <> $3",
    )
    .bind(kind)
    .bind(external_id)
    .bind(local_id as i64)
    .fetch_optional(&mut *conn)
    .await?;
    let Some(owner) = owner else {
        return Ok(());
    };

    let removed = sqlx::query(
        r#"
        DELETE FROM sync_entities e
        WHERE e.local_id = $1 AND e.status = $2
          AND NOT EXISTS (SELECT 1 FROM change_log c WHERE c.local_id = e.local_id)
          AND NOT EXISTS (SELECT 1 FROM sync_conflicts k WHERE k.local_id = e.local_id)
        "#,
    )
    .bind(owner)
    .bind(SyncStatus::Clean.as_str())
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if removed == 0 {
        return Err(Error::ExternalIdTaken {
            external_id: external_id.to_string(),
            local_id: owner as LocalId,
        }
        .into());
    }
    tracing::debug!(local_id, shadow = owner, external_id, "Dropped pulled copy of own create");
    Ok(())
}

async fn entry_state(conn: &mut PgConnection, change_id: ChangeId) -> StoreResult<(LocalId, ChangeStatus)> {
    let row = sqlx::query("SELECT local_id, status FROM change_log WHERE id = $1")
        .bind(change_id as i64)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(Error::ChangeNotFound(change_id))?;
    let status: String = row.try_get("status")?;
    let status = ChangeStatus::parse(&status).ok_or_else(|| decode_error("status", &status))?;
    Ok((row.try_get::<i64, _>("local_id")? as LocalId, status))
}

async fn apply_batch(
    conn: &mut PgConnection,
    batch: RemoteBatch,
    resolver: &ConflictResolver,
    now: Timestamp,
) -> StoreResult<PullReport> {
    let mut report = PullReport::default();
    let RemoteBatch {
        kind,
        changes,
        rejected,
        cursor,
    } = batch;

    for remote in changes {
        let existing: Option<i64> =
            sqlx::query_scalar("SELECT local_id FROM sync_entities WHERE kind = $1 AND external_id = $2")
                .bind(&kind)
                .bind(&remote.external_id)
                .fetch_optional(&mut *conn)
                .await?;
        match existing {
            Some(local_id) => {
                let mut ledger = load(conn, local_id as LocalId).await?;
                let effects = ledger.observe_remote(remote, resolver, now)?;
                let committed = save(conn, ledger, effects).await?;
                report.count(committed.outcome);
            }
            None if remote.deleted => report.stale += 1,
            None => {
                let local_id = next_local_id(conn).await?;
                let ledger = Ledger::from_remote(local_id, kind.clone(), &remote, now);
                insert_entity(conn, &ledger.entity).await?;
                report.created += 1;
            }
        }
    }

    for record in rejected {
        sqlx::query(
            r#"
            INSERT INTO mapping_diagnostics (kind, external_id, payload, error, detected_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&kind)
        .bind(&record.external_id)
        .bind(&record.payload)
        .bind(&record.error)
        .bind(now as i64)
        .execute(&mut *conn)
        .await?;
        report.rejected += 1;
    }

    if let Some(token) = cursor {
        sqlx::query(
            r#"
            INSERT INTO sync_cursors (kind, token, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (kind) DO UPDATE SET
                token = EXCLUDED.token,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&kind)
        .bind(token)
        .bind(now as i64)
        .execute(&mut *conn)
        .await?;
    }

    Ok(report)
}

// ============================================================================
// Store
// ============================================================================

/// PostgreSQL-backed [`LocalStore`].
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run embedded migrations.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn with_ledger<F>(&self, local_id: LocalId, f: F) -> StoreResult<Committed>
    where
        F: FnOnce(&mut Ledger) -> ferry_engine::error::Result<Effects> + Send,
    {
        let mut tx = self.pool.begin().await?;
        let mut ledger = load(&mut tx, local_id).await?;
        let effects = f(&mut ledger)?;
        let committed = save(&mut tx, ledger, effects).await?;
        tx.commit().await?;
        Ok(committed)
    }

    /// Load a ledger for a read-only question.
    async fn read_ledger(&self, local_id: LocalId) -> StoreResult<Ledger> {
        let mut tx = self.pool.begin().await?;
        let ledger = load(&mut tx, local_id).await?;
        tx.rollback().await?;
        Ok(ledger)
    }

    async fn change_owner(&self, change_id: ChangeId) -> StoreResult<(LocalId, ChangeStatus)> {
        let mut conn = self.pool.acquire().await?;
        entry_state(&mut conn, change_id).await
    }
}

fn receipt(local_id: LocalId, committed: Committed) -> WriteReceipt {
    WriteReceipt {
        local_id,
        change_id: committed.change_ids[0],
    }
}

#[async_trait]
impl LocalStore for PgStore {
    async fn create(&self, kind: &str, fields: Fields, now: Timestamp) -> StoreResult<WriteReceipt> {
        let mut tx = self.pool.begin().await?;
        let local_id = next_local_id(&mut tx).await?;
        let (ledger, effects) = Ledger::create(local_id, kind, fields, now);
        insert_entity(&mut tx, &ledger.entity).await?;
        let committed = save(&mut tx, ledger, effects).await?;
        tx.commit().await?;
        Ok(receipt(local_id, committed))
    }

    async fn update(&self, local_id: LocalId, fields: Fields, now: Timestamp) -> StoreResult<WriteReceipt> {
        let committed = self
            .with_ledger(local_id, |l| l.local_update(fields, now))
            .await?;
        Ok(receipt(local_id, committed))
    }

    async fn delete(&self, local_id: LocalId, now: Timestamp) -> StoreResult<WriteReceipt> {
        let committed = self.with_ledger(local_id, |l| l.local_delete(now)).await?;
        Ok(receipt(local_id, committed))
    }

    async fn entity(&self, local_id: LocalId) -> StoreResult<Option<SyncableEntity>> {
        let sql = format!("{ENTITY_SELECT} WHERE local_id = $1");
        let row = sqlx::query_as::<_, EntityRow>(&sql)
            .bind(local_id as i64)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.0))
    }

    async fn sync_indicator(&self, local_id: LocalId) -> StoreResult<SyncIndicator> {
        Ok(self.read_ledger(local_id).await?.indicator())
    }

    async fn open_change_count(&self) -> StoreResult<usize> {
        let sql = format!("SELECT COUNT(*) FROM change_log WHERE status IN {OPEN_STATUSES}");
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count as usize)
    }

    async fn dispatchable(&self, now: Timestamp, limit: usize) -> StoreResult<Vec<ChangeId>> {
        let sql = format!(
            r#"
            SELECT c.id FROM change_log c
            JOIN sync_entities e ON e.local_id = c.local_id
            WHERE e.status = 'pending_push'
              AND c.status = 'pending'
              AND (c.next_attempt_at IS NULL OR c.next_attempt_at <= $1)
              AND c.id = (
                  SELECT MIN(h.id) FROM change_log h
                  WHERE h.local_id = c.local_id AND h.status IN {OPEN_STATUSES}
              )
            ORDER BY c.id
            LIMIT $2
            "#
        );
        let ids: Vec<i64> = sqlx::query_scalar(&sql)
            .bind(now as i64)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().map(|id| id as ChangeId).collect())
    }

    async fn dispatchable_for(&self, local_id: LocalId, now: Timestamp) -> StoreResult<Option<ChangeId>> {
        Ok(self
            .read_ledger(local_id)
            .await?
            .dispatchable(now)
            .map(|e| e.id))
    }

    async fn claim(&self, change_id: ChangeId, now: Timestamp) -> StoreResult<PushTask> {
        let (local_id, status) = self.change_owner(change_id).await?;
        if !status.is_open() {
            return Err(Error::InvalidChangeState { change_id, status }.into());
        }
        let mut tx = self.pool.begin().await?;
        let mut ledger = load(&mut tx, local_id).await?;
        let task = ledger.claim(change_id, now)?;
        save(&mut tx, ledger, Effects::outcome(Outcome::Claimed)).await?;
        tx.commit().await?;
        Ok(task)
    }

    async fn confirm(
        &self,
        change_id: ChangeId,
        ack: &RemoteAck,
        resolver: &ConflictResolver,
        now: Timestamp,
    ) -> StoreResult<Committed> {
        let (local_id, status) = self.change_owner(change_id).await?;
        if status != ChangeStatus::InFlight {
            return Ok(Committed {
                outcome: Outcome::Duplicate,
                change_ids: Vec::new(),
                conflict_id: None,
            });
        }
        let mut tx = self.pool.begin().await?;
        let mut ledger = load(&mut tx, local_id).await?;
        let creates = ledger
            .open
            .iter()
            .any(|e| e.id == change_id && e.op != ChangeOp::Delete);
        if creates {
            release_shadow(&mut tx, &ledger.entity.kind, &ack.external_id, local_id).await?;
        }
        let effects = ledger.confirm(change_id, ack, now, resolver)?;
        let committed = save(&mut tx, ledger, effects).await?;
        tx.commit().await?;
        Ok(committed)
    }

    async fn reschedule(
        &self,
        change_id: ChangeId,
        retry_at: Timestamp,
        error: &str,
        resolver: &ConflictResolver,
        now: Timestamp,
    ) -> StoreResult<Committed> {
        let (local_id, _) = self.change_owner(change_id).await?;
        self.with_ledger(local_id, |l| {
            l.reschedule(change_id, retry_at, error, now, resolver)
        })
        .await
    }

    async fn give_up(&self, change_id: ChangeId, error: &str, now: Timestamp) -> StoreResult<Committed> {
        let (local_id, _) = self.change_owner(change_id).await?;
        self.with_ledger(local_id, |l| l.give_up(change_id, error, now))
            .await
    }

    async fn observe_remote(
        &self,
        local_id: LocalId,
        remote: RemoteChange,
        resolver: &ConflictResolver,
        now: Timestamp,
    ) -> StoreResult<Committed> {
        self.with_ledger(local_id, |l| l.observe_remote(remote, resolver, now))
            .await
    }

    async fn apply_remote(
        &self,
        batch: RemoteBatch,
        resolver: &ConflictResolver,
        now: Timestamp,
    ) -> StoreResult<PullReport> {
        let mut tx = self.pool.begin().await?;
        let report = apply_batch(&mut tx, batch, resolver, now).await?;
        tx.commit().await?;
        Ok(report)
    }

    async fn apply_full_sync(
        &self,
        batch: RemoteBatch,
        resolver: &ConflictResolver,
        now: Timestamp,
    ) -> StoreResult<PullReport> {
        let kind = batch.kind.clone();
        let mut listed: BTreeSet<ExternalId> =
            batch.changes.iter().map(|c| c.external_id.clone()).collect();
        listed.extend(batch.rejected.iter().filter_map(|r| r.external_id.clone()));
        let listed: Vec<ExternalId> = listed.into_iter().collect();

        let mut tx = self.pool.begin().await?;
        let mut report = apply_batch(&mut tx, batch, resolver, now).await?;

        let missing: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT local_id FROM sync_entities
            WHERE kind = $1 AND external_id IS NOT NULL AND NOT (external_id = ANY($2))
            ORDER BY local_id
            "#,
        )
        .bind(&kind)
        .bind(&listed)
        .fetch_all(&mut *tx)
        .await?;

        for local_id in missing {
            let mut ledger = load(&mut tx, local_id as LocalId).await?;
            let effects = ledger.remote_missing(resolver, now)?;
            let committed = save(&mut tx, ledger, effects).await?;
            match committed.outcome {
                Outcome::RemoteApplied => report.tombstoned += 1,
                outcome => report.count(outcome),
            }
        }

        tx.commit().await?;
        Ok(report)
    }

    async fn cursor(&self, kind: &str) -> StoreResult<Option<SyncCursor>> {
        let row = sqlx::query_as::<_, CursorRow>(
            "SELECT kind, token, updated_at FROM sync_cursors WHERE kind = $1",
        )
        .bind(kind)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.0))
    }

    async fn reset_cursor(&self, kind: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM sync_cursors WHERE kind = $1")
            .bind(kind)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn diagnostics(&self) -> StoreResult<Vec<MappingDiagnostic>> {
        let rows = sqlx::query_as::<_, DiagnosticRow>(
            r#"
            SELECT id, kind, external_id, payload, error, detected_at
            FROM mapping_diagnostics
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    async fn conflicts(&self, status: Option<ConflictStatus>) -> StoreResult<Vec<ConflictRecord>> {
        let sql = format!("{CONFLICT_SELECT} WHERE ($1::text IS NULL OR status = $1) ORDER BY id");
        let rows = sqlx::query_as::<_, ConflictRow>(&sql)
            .bind(status.map(|s| s.as_str()))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    async fn resolve_conflict(
        &self,
        conflict_id: ConflictId,
        decision: ConflictDecision,
        now: Timestamp,
    ) -> StoreResult<Committed> {
        let row = sqlx::query("SELECT local_id, status FROM sync_conflicts WHERE id = $1")
            .bind(conflict_id as i64)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(Error::ConflictNotFound(conflict_id))?;
        let status: String = row.try_get("status")?;
        if status != ConflictStatus::Unresolved.as_str() {
            return Err(Error::ConflictAlreadyResolved(conflict_id).into());
        }
        let local_id = row.try_get::<i64, _>("local_id")? as LocalId;
        self.with_ledger(local_id, |l| l.resolve_manually(conflict_id, decision, now))
            .await
    }

    async fn failed_changes(&self) -> StoreResult<Vec<ChangeLogEntry>> {
        let sql = format!("{CHANGE_SELECT} WHERE status = 'failed_permanent' ORDER BY id");
        let rows = sqlx::query_as::<_, ChangeRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    async fn retry_failed(
        &self,
        change_id: ChangeId,
        resolver: &ConflictResolver,
        now: Timestamp,
    ) -> StoreResult<Committed> {
        let (local_id, _) = self.change_owner(change_id).await?;
        self.with_ledger(local_id, |l| l.retry_failed(change_id, resolver, now))
            .await
    }

    async fn recover(&self, resolver: &ConflictResolver, now: Timestamp) -> StoreResult<usize> {
        let interrupted: Vec<i64> = sqlx::query_scalar(
            "SELECT DISTINCT local_id FROM change_log WHERE status = 'in_flight' ORDER BY local_id",
        )
        .fetch_all(&self.pool)
        .await?;
        for local_id in &interrupted {
            self.with_ledger(*local_id as LocalId, |l| l.recover(resolver, now))
                .await?;
        }
        Ok(interrupted.len())
    }

    async fn collect_garbage(&self, retention_ms: u64, now: Timestamp) -> StoreResult<usize> {
        let result = sqlx::query(
            r#"
            DELETE FROM change_log
            WHERE status IN ('succeeded', 'superseded')
              AND completed_at IS NOT NULL
              AND completed_at + $1 <= $2
            "#,
        )
        .bind(retention_ms as i64)
        .bind(now as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }
}
