//! REST transport to the external store over reqwest.

use super::{ChangePage, ClientError, ExternalApi, ExternalRecord, ExternalRequest, ExternalResponse};
use async_trait::async_trait;
use ferry_engine::FailureKind;
use reqwest::header::{HeaderMap, IF_MATCH, RETRY_AFTER};
use reqwest::{RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use std::time::Duration;

const IDEMPOTENCY_KEY: &str = "Idempotency-Key";

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("invalid external API URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error(transparent)]
    Client(#[from] reqwest::Error),
}

/// HTTP client for the external store's REST API.
pub struct HttpExternalApi {
    client: reqwest::Client,
    base_url: Url,
    token: Option<String>,
}

impl HttpExternalApi {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, SetupError> {
        let invalid = |reason: String| SetupError::InvalidUrl {
            url: base_url.to_string(),
            reason,
        };
        let base_url = Url::parse(base_url).map_err(|e| invalid(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(invalid("not a base URL".to_string()));
        }

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    fn auth(&self, mut req: RequestBuilder) -> RequestBuilder {
        if let Some(token) = self.token.as_deref().filter(|t| !t.trim().is_empty()) {
            req = req.bearer_auth(token);
        }
        req
    }

    /// Base URL plus path segments, each percent-encoded on its own.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        // Checked in `new`: a base URL always has path segments
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn records_url(&self, kind: &str) -> Url {
        self.endpoint(&[kind, "records"])
    }

    fn record_url(&self, kind: &str, id: &str) -> Url {
        self.endpoint(&[kind, "records", id])
    }

    fn changes_url(&self, kind: &str) -> Url {
        self.endpoint(&[kind, "changes"])
    }
}

fn transport_error(err: reqwest::Error) -> ClientError {
    let kind = if err.is_timeout() {
        FailureKind::Timeout
    } else if err.is_decode() {
        FailureKind::Protocol
    } else {
        FailureKind::Connection
    };
    ClientError::new(kind, err.to_string())
}

/// Seconds form of `Retry-After`; the date form is ignored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

async fn check(resp: Response) -> Result<Response, ClientError> {
    let status = resp.status().as_u16();
    let hint = retry_after(resp.headers());
    match FailureKind::from_status(status, hint) {
        None => Ok(resp),
        Some(kind) => {
            let body = resp.text().await.unwrap_or_default();
            Err(ClientError::new(kind, format!("{status} - {body}")))
        }
    }
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, ClientError> {
    let resp = check(resp).await?;
    resp.json::<T>()
        .await
        .map_err(|e| ClientError::new(FailureKind::Protocol, e.to_string()))
}

#[async_trait]
impl ExternalApi for HttpExternalApi {
    async fn send(&self, request: ExternalRequest) -> Result<ExternalResponse, ClientError> {
        match request {
            ExternalRequest::Get { kind, id } => {
                let req = self.auth(self.client.get(self.record_url(&kind, &id)));
                let resp = req.send().await.map_err(transport_error)?;
                decode::<ExternalRecord>(resp).await.map(ExternalResponse::Record)
            }
            ExternalRequest::Create {
                kind,
                properties,
                idempotency_key,
            } => {
                let req = self
                    .client
                    .post(self.records_url(&kind))
                    .header(IDEMPOTENCY_KEY, idempotency_key)
                    .json(&serde_json::json!({ "properties": properties }));
                let resp = self.auth(req).send().await.map_err(transport_error)?;
                decode::<ExternalRecord>(resp).await.map(ExternalResponse::Record)
            }
            ExternalRequest::Update {
                kind,
                id,
                properties,
                expected_version,
                idempotency_key,
            } => {
                let mut req = self
                    .client
                    .patch(self.record_url(&kind, &id))
                    .header(IDEMPOTENCY_KEY, idempotency_key)
                    .json(&serde_json::json!({ "properties": properties }));
                if let Some(version) = expected_version {
                    req = req.header(IF_MATCH, version);
                }
                let resp = self.auth(req).send().await.map_err(transport_error)?;
                decode::<ExternalRecord>(resp).await.map(ExternalResponse::Record)
            }
            ExternalRequest::Delete {
                kind,
                id,
                expected_version,
                idempotency_key,
            } => {
                let mut req = self
                    .client
                    .delete(self.record_url(&kind, &id))
                    .header(IDEMPOTENCY_KEY, idempotency_key);
                if let Some(version) = expected_version {
                    req = req.header(IF_MATCH, version);
                }
                let resp = self.auth(req).send().await.map_err(transport_error)?;
                check(resp).await?;
                Ok(ExternalResponse::Deleted)
            }
            ExternalRequest::Query { kind, since, page } => {
                let mut query = Vec::new();
                if let Some(since) = since {
                    query.push(("since", since));
                }
                if let Some(page) = page {
                    query.push(("page", page));
                }
                let req = self.client.get(self.changes_url(&kind)).query(&query);
                let resp = self.auth(req).send().await.map_err(transport_error)?;
                decode::<ChangePage>(resp).await.map(ExternalResponse::Page)
            }
        }
    }
}
