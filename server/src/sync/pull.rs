//! Incremental pulls and full syncs of one entity kind.

use super::{SyncEngine, SyncError};
use crate::client::{ChangePage, ClientError, ExternalRecord, ExternalRequest, ExternalResponse};
use ferry_engine::{
    EntityMapper, Error, FailureKind, Fields, PullReport, RejectedRecord, RemoteBatch,
    RemoteChange,
};
use serde_json::Value;
use std::sync::atomic::Ordering;

impl SyncEngine {
    /// Pull a kind from its cursor, or list it completely when there is
    /// no usable cursor.
    pub(super) async fn pull(&self, kind: &str) -> Result<PullReport, SyncError> {
        let token = self
            .store()
            .cursor(kind)
            .await?
            .and_then(|cursor| cursor.token);

        let report = match token {
            None => self.full_sync(kind).await?,
            Some(token) => match self.incremental_sync(kind, token).await {
                Err(SyncError::Client(e)) if e.kind == FailureKind::CursorExpired => {
                    tracing::warn!(kind = %kind, "Cursor expired, falling back to full sync");
                    self.store().reset_cursor(kind).await?;
                    self.full_sync(kind).await?
                }
                other => other?,
            },
        };

        let pulled = report.created + report.applied + report.tombstoned;
        self.inner.pulled.fetch_add(pulled as u64, Ordering::Relaxed);
        tracing::info!(
            kind = %kind,
            created = report.created,
            applied = report.applied,
            conflicts = report.conflicts,
            rejected = report.rejected,
            tombstoned = report.tombstoned,
            "Pull finished"
        );
        Ok(report)
    }

    /// Apply the feed after `token`, one atomic batch per page.
    async fn incremental_sync(&self, kind: &str, token: String) -> Result<PullReport, SyncError> {
        let mut report = PullReport::default();
        let mut page_token = None;

        loop {
            let page = self.fetch_page(kind, Some(token.clone()), page_token).await?;
            let mut batch = self.build_batch(kind, &page.records);
            batch.cursor = page.cursor.clone();

            let applied = self
                .store()
                .apply_remote(batch, self.resolver(), self.now())
                .await?;
            report.merge(applied);

            match page.next_page {
                Some(next) => page_token = Some(next),
                None => return Ok(report),
            }
        }
    }

    /// List every remote record of a kind and apply the listing as one batch.
    pub(super) async fn full_sync(&self, kind: &str) -> Result<PullReport, SyncError> {
        tracing::info!(kind = %kind, "Starting full sync");
        let mut batch = RemoteBatch::new(kind);
        let mut page_token = None;

        loop {
            let page = self.fetch_page(kind, None, page_token).await?;
            let mapped = self.build_batch(kind, &page.records);
            batch.changes.extend(mapped.changes);
            batch.rejected.extend(mapped.rejected);
            if page.cursor.is_some() {
                batch.cursor = page.cursor;
            }

            match page.next_page {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        Ok(self
            .store()
            .apply_full_sync(batch, self.resolver(), self.now())
            .await?)
    }

    async fn fetch_page(
        &self,
        kind: &str,
        since: Option<String>,
        page: Option<String>,
    ) -> Result<ChangePage, SyncError> {
        let request = ExternalRequest::Query {
            kind: kind.to_string(),
            since,
            page,
        };
        match self.inner.client.execute(request).await? {
            ExternalResponse::Page(page) => Ok(page),
            other => Err(ClientError::unexpected("query", &other).into()),
        }
    }

    /// Map raw feed records. Records that fail to map are kept for the
    /// diagnostics table, never dropped.
    fn build_batch(&self, kind: &str, records: &[Value]) -> RemoteBatch {
        let mut batch = RemoteBatch::new(kind);

        for raw in records {
            let mapped = ExternalRecord::from_value(raw)
                .map_err(|e| e.to_string())
                .and_then(|record| {
                    remote_change(&self.inner.mapper, kind, &record).map_err(|e| e.to_string())
                });

            match mapped {
                Ok(change) => batch.changes.push(change),
                Err(error) => {
                    let external_id = raw.get("id").and_then(Value::as_str).map(str::to_string);
                    tracing::error!(
                        kind = %kind,
                        external_id = external_id.as_deref().unwrap_or("?"),
                        error = %error,
                        payload = %raw,
                        "Remote record rejected by mapper"
                    );
                    batch.rejected.push(RejectedRecord {
                        external_id,
                        payload: raw.clone(),
                        error,
                    });
                }
            }
        }
        batch
    }
}

/// Translate an external record into a change the store can apply.
///
/// A tombstone whose properties no longer map is still applied, with empty
/// fields, so that the deletion is not lost.
pub(super) fn remote_change(
    mapper: &EntityMapper,
    kind: &str,
    record: &ExternalRecord,
) -> Result<RemoteChange, Error> {
    let mapping = mapper.mapping(kind)?;
    let properties = Value::Object(record.properties.clone());
    let (fields, extras) = match mapper.to_local(kind, &properties) {
        Ok(local) => (local.fields, local.extras),
        Err(_) if record.deleted => (Fields::new(), Fields::new()),
        Err(e) => return Err(e),
    };

    let field_times = record
        .field_times
        .iter()
        .filter_map(|(external, at)| mapping.local_name(external).map(|local| (local.to_string(), *at)))
        .collect();

    Ok(RemoteChange {
        external_id: record.id.clone(),
        version: record.version.clone(),
        edited_at: record.edited_at,
        fields,
        extras,
        field_times,
        deleted: record.deleted,
    })
}
