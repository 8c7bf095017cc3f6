//! Access to the external document store.
//!
//! [`ExternalApi`] is the transport seam: the HTTP implementation lives in
//! [`http`], tests plug in scripted fakes. Every call from the sync runtime
//! goes through one shared [`RateLimitedClient`], which enforces the global
//! request budget.

pub mod http;

pub use http::{HttpExternalApi, SetupError};

use async_trait::async_trait;
use ferry_engine::{mapper::parse_instant, FailureKind, Fields, Timestamp};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// A record as the external store returns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalRecord {
    pub id: String,
    /// Opaque etag
    pub version: String,
    #[serde(deserialize_with = "instant_millis")]
    pub edited_at: Timestamp,
    #[serde(default)]
    pub properties: Fields,
    /// Per-property edit times, when the store reports them
    #[serde(default)]
    pub field_times: BTreeMap<String, Timestamp>,
    #[serde(default)]
    pub deleted: bool,
}

impl ExternalRecord {
    /// Decode one raw record of a change feed page.
    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(value)
    }
}

/// Accept epoch milliseconds or any instant the mapper understands.
fn instant_millis<'de, D>(deserializer: D) -> Result<Timestamp, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| serde::de::Error::custom("editedAt must be a positive integer")),
        Value::String(s) => parse_instant(&s)
            .and_then(|at| u64::try_from(at.timestamp_millis()).ok())
            .ok_or_else(|| serde::de::Error::custom(format!("invalid editedAt: {s}"))),
        other => Err(serde::de::Error::custom(format!(
            "editedAt must be a number or string, got {other}"
        ))),
    }
}

/// One operation against the external store.
#[derive(Debug, Clone, PartialEq)]
pub enum ExternalRequest {
    Get {
        kind: String,
        id: String,
    },
    Create {
        kind: String,
        properties: Fields,
        idempotency_key: String,
    },
    Update {
        kind: String,
        id: String,
        properties: Fields,
        expected_version: Option<String>,
        idempotency_key: String,
    },
    Delete {
        kind: String,
        id: String,
        expected_version: Option<String>,
        idempotency_key: String,
    },
    /// One page of the change feed
    Query {
        kind: String,
        since: Option<String>,
        page: Option<String>,
    },
}

impl ExternalRequest {
    pub fn kind(&self) -> &str {
        match self {
            ExternalRequest::Get { kind, .. }
            | ExternalRequest::Create { kind, .. }
            | ExternalRequest::Update { kind, .. }
            | ExternalRequest::Delete { kind, .. }
            | ExternalRequest::Query { kind, .. } => kind,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExternalRequest::Get { .. } => "get",
            ExternalRequest::Create { .. } => "create",
            ExternalRequest::Update { .. } => "update",
            ExternalRequest::Delete { .. } => "delete",
            ExternalRequest::Query { .. } => "query",
        }
    }
}

/// A page of the change feed. Records stay raw so that an undecodable one
/// can be reported with its full payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePage {
    #[serde(default)]
    pub records: Vec<Value>,
    pub next_page: Option<String>,
    /// Watermark to resume from once the feed is exhausted
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExternalResponse {
    Record(ExternalRecord),
    Deleted,
    Page(ChangePage),
}

/// A classified failure of one external call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ClientError {
    pub kind: FailureKind,
    pub message: String,
}

impl ClientError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// A response of the wrong shape for the request.
    pub fn unexpected(request: &str, response: &ExternalResponse) -> Self {
        Self::new(
            FailureKind::Protocol,
            format!("unexpected response to {request}: {response:?}"),
        )
    }
}

/// Transport to the external store.
#[async_trait]
pub trait ExternalApi: Send + Sync {
    async fn send(&self, request: ExternalRequest) -> Result<ExternalResponse, ClientError>;
}

/// Counters exposed on the health endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStats {
    /// Requests dispatched to the external store
    pub executed: u64,
    /// Requests that had to wait for budget
    pub throttled: u64,
    pub timed_out: u64,
}

/// Rolling-window rate limiter in front of an [`ExternalApi`].
///
/// At most `limit` requests are dispatched in any `window`. Callers over
/// budget wait; they are never rejected. The dispatch log sits behind a
/// tokio mutex, whose waiters are served in arrival order, and the lock is
/// held while a caller waits for budget, so admission is FIFO.
pub struct RateLimitedClient {
    api: Arc<dyn ExternalApi>,
    limit: usize,
    window: Duration,
    timeout: Duration,
    dispatched: Mutex<VecDeque<Instant>>,
    executed: AtomicU64,
    throttled: AtomicU64,
    timed_out: AtomicU64,
}

impl RateLimitedClient {
    pub fn new(api: Arc<dyn ExternalApi>, limit: usize, window: Duration, timeout: Duration) -> Self {
        Self {
            api,
            limit: limit.max(1),
            window,
            timeout,
            dispatched: Mutex::new(VecDeque::with_capacity(limit)),
            executed: AtomicU64::new(0),
            throttled: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
        }
    }

    /// `requests_per_second` over a one second window.
    pub fn per_second(api: Arc<dyn ExternalApi>, requests_per_second: u32, timeout: Duration) -> Self {
        Self::new(api, requests_per_second as usize, Duration::from_secs(1), timeout)
    }

    async fn admit(&self) {
        let arrived = Instant::now();
        let mut dispatched = self.dispatched.lock().await;
        loop {
            let now = Instant::now();
            while dispatched
                .front()
                .is_some_and(|at| *at + self.window <= now)
            {
                dispatched.pop_front();
            }
            if dispatched.len() < self.limit {
                dispatched.push_back(now);
                if now > arrived {
                    self.throttled.fetch_add(1, Ordering::Relaxed);
                }
                break;
            }
            if let Some(oldest) = dispatched.front().copied() {
                tokio::time::sleep_until(oldest + self.window).await;
            }
        }
    }

    /// Wait for budget, then perform one request with the request timeout.
    pub async fn execute(&self, request: ExternalRequest) -> Result<ExternalResponse, ClientError> {
        self.admit().await;
        self.executed.fetch_add(1, Ordering::Relaxed);

        let name = request.name();
        let kind = request.kind().to_string();
        match tokio::time::timeout(self.timeout, self.api.send(request)).await {
            Ok(result) => {
                if let Err(e) = &result {
                    tracing::debug!(kind = %kind, request = name, error = %e, "External call failed");
                }
                result
            }
            Err(_) => {
                self.timed_out.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(kind = %kind, request = name, "External call timed out");
                Err(ClientError::new(
                    FailureKind::Timeout,
                    format!("no response within {}ms", self.timeout.as_millis()),
                ))
            }
        }
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            executed: self.executed.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
        }
    }
}
