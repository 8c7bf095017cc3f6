//! Pushing one change log entry to the external store.

use super::{pull::remote_change, SyncEngine, SyncError};
use crate::client::{ClientError, ExternalRequest, ExternalResponse};
use crate::queue::Priority;
use crate::store::StoreError;
use ferry_engine::{
    ChangeId, ChangeOp, Error, FailureKind, PushTask, RemoteAck, RetryDecision, Timestamp,
};
use std::sync::atomic::Ordering;
use std::time::Duration;

impl SyncEngine {
    pub(super) async fn push(&self, change_id: ChangeId) -> Result<(), SyncError> {
        let task = match self.store().claim(change_id, self.now()).await {
            Ok(task) => task,
            Err(StoreError::Engine(e)) if is_claim_race(&e) => {
                tracing::debug!(change_id, reason = %e, "Push skipped");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let local_id = task.entry.local_id;
        tracing::debug!(
            local_id,
            change_id,
            kind = %task.entry.kind,
            op = task.entry.op.as_str(),
            attempt = task.entry.attempts,
            "Pushing change"
        );

        let request = match self.build_request(&task) {
            Ok(request) => request,
            Err(e) => {
                tracing::error!(local_id, change_id, error = %e, "Change cannot be mapped");
                self.give_up(change_id, &e.to_string()).await?;
                return Ok(());
            }
        };

        match request {
            Some(request) => {
                let result = self.inner.client.execute(request).await;
                self.settle(&task, result).await?;
            }
            None => {
                // Deleted before it ever reached the external store
                let ack = RemoteAck {
                    external_id: format!("local-{local_id}"),
                    version: "deleted".to_string(),
                    edited_at: self.now(),
                };
                self.confirm(change_id, &ack).await?;
            }
        }

        self.submit_head(local_id, Priority::Background).await?;
        Ok(())
    }

    /// The request for an entry, or `None` for a delete that needs no call.
    fn build_request(&self, task: &PushTask) -> Result<Option<ExternalRequest>, Error> {
        let entry = &task.entry;
        let kind = entry.kind.clone();
        let idempotency_key = entry.idempotency_token();

        let request = match (entry.op, &task.external_id) {
            (ChangeOp::Delete, None) => return Ok(None),
            (ChangeOp::Delete, Some(id)) => ExternalRequest::Delete {
                kind,
                id: id.clone(),
                expected_version: task.external_version.clone(),
                idempotency_key,
            },
            // A create is emitted again only when the remote record is gone,
            // so a known external id is stale here
            (ChangeOp::Create, _) | (ChangeOp::Update, None) => ExternalRequest::Create {
                properties: self
                    .inner
                    .mapper
                    .to_external(&kind, &entry.payload, &task.extras)?,
                kind,
                idempotency_key,
            },
            (ChangeOp::Update, Some(id)) => ExternalRequest::Update {
                properties: self
                    .inner
                    .mapper
                    .to_external(&kind, &entry.payload, &task.extras)?,
                kind,
                id: id.clone(),
                expected_version: task.external_version.clone(),
                idempotency_key,
            },
        };
        Ok(Some(request))
    }

    async fn settle(
        &self,
        task: &PushTask,
        result: Result<ExternalResponse, ClientError>,
    ) -> Result<(), SyncError> {
        let change_id = task.entry.id;
        let is_delete = task.entry.op == ChangeOp::Delete;

        let failure = match result {
            Ok(ExternalResponse::Record(record)) => {
                let ack = RemoteAck {
                    external_id: record.id,
                    version: record.version,
                    edited_at: record.edited_at,
                };
                return self.confirm(change_id, &ack).await;
            }
            Ok(ExternalResponse::Deleted) if is_delete => {
                return self.confirm(change_id, &self.delete_ack(task)).await;
            }
            Ok(other) => ClientError::unexpected(task.entry.op.as_str(), &other),
            Err(e) => e,
        };

        match failure.kind {
            FailureKind::NotFound if is_delete => {
                tracing::debug!(change_id, "Record already gone remotely");
                self.confirm(change_id, &self.delete_ack(task)).await
            }
            FailureKind::VersionConflict => self.reconcile_version(task, &failure).await,
            _ => self.retry_or_give_up(task, &failure).await,
        }
    }

    fn delete_ack(&self, task: &PushTask) -> RemoteAck {
        RemoteAck {
            external_id: task.external_id.clone().unwrap_or_default(),
            version: task
                .external_version
                .clone()
                .unwrap_or_else(|| "deleted".to_string()),
            edited_at: self.now(),
        }
    }

    /// The remote record moved on: fetch it and run it through conflict
    /// resolution, which decides what (if anything) is pushed next.
    async fn reconcile_version(&self, task: &PushTask, failure: &ClientError) -> Result<(), SyncError> {
        let change_id = task.entry.id;
        let local_id = task.entry.local_id;
        let kind = &task.entry.kind;

        if task.entry.attempts >= self.inner.options.retry.max_attempts {
            return self.give_up(change_id, &failure.to_string()).await;
        }
        let Some(external_id) = task.external_id.clone() else {
            return self.give_up(change_id, &failure.to_string()).await;
        };

        let get = ExternalRequest::Get {
            kind: kind.clone(),
            id: external_id,
        };
        let record = match self.inner.client.execute(get).await {
            Ok(ExternalResponse::Record(record)) => record,
            Ok(other) => return self.give_up(change_id, &ClientError::unexpected("get", &other).to_string()).await,
            Err(e) if e.kind == FailureKind::NotFound => {
                return self.give_up(change_id, "record deleted remotely").await;
            }
            Err(e) => return self.retry_or_give_up(task, &e).await,
        };

        let remote = match remote_change(&self.inner.mapper, kind, &record) {
            Ok(remote) => remote,
            Err(e) => return self.give_up(change_id, &e.to_string()).await,
        };

        let now = self.now();
        self.store()
            .reschedule(change_id, now, &failure.to_string(), self.resolver(), now)
            .await?;
        let committed = self
            .store()
            .observe_remote(local_id, remote, self.resolver(), now)
            .await?;
        tracing::info!(local_id, change_id, outcome = ?committed.outcome, "Version conflict reconciled");
        Ok(())
    }

    async fn retry_or_give_up(&self, task: &PushTask, failure: &ClientError) -> Result<(), SyncError> {
        let change_id = task.entry.id;
        let now = self.now();
        let elapsed = Duration::from_millis(task.entry.elapsed_since_first_attempt(now));
        let decision = self.inner.options.retry.decide(
            &failure.kind,
            task.entry.attempts,
            elapsed,
            rand::random::<f64>(),
        );

        match decision {
            RetryDecision::RetryAfter(delay) => {
                let retry_at: Timestamp = now + delay.as_millis() as u64;
                tracing::warn!(
                    local_id = task.entry.local_id,
                    change_id,
                    attempt = task.entry.attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %failure,
                    "Push failed, will retry"
                );
                self.store()
                    .reschedule(change_id, retry_at, &failure.to_string(), self.resolver(), now)
                    .await?;
                Ok(())
            }
            RetryDecision::GiveUp => self.give_up(change_id, &failure.to_string()).await,
        }
    }

    async fn confirm(&self, change_id: ChangeId, ack: &RemoteAck) -> Result<(), SyncError> {
        let committed = match self
            .store()
            .confirm(change_id, ack, self.resolver(), self.now())
            .await
        {
            Ok(committed) => committed,
            Err(StoreError::Engine(e @ Error::ExternalIdTaken { .. })) => {
                return self.give_up(change_id, &e.to_string()).await;
            }
            Err(e) => return Err(e.into()),
        };
        self.inner.pushed.fetch_add(1, Ordering::Relaxed);
        tracing::info!(change_id, external_id = %ack.external_id, outcome = ?committed.outcome, "Push confirmed");
        Ok(())
    }

    async fn give_up(&self, change_id: ChangeId, error: &str) -> Result<(), SyncError> {
        self.store().give_up(change_id, error, self.now()).await?;
        self.inner.gave_up.fetch_add(1, Ordering::Relaxed);
        tracing::error!(change_id, error = %error, "Push failed permanently");
        Ok(())
    }
}

/// Claim failures that only mean another worker got there first or the
/// entry was settled meanwhile.
fn is_claim_race(err: &Error) -> bool {
    matches!(
        err,
        Error::OutOfOrder { .. }
            | Error::InvalidChangeState { .. }
            | Error::ChangeNotFound(_)
            | Error::InvalidTransition { .. }
    )
}
