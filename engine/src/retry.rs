//! Failure classification and retry decisions.
//!
//! The policy is deterministic: the caller supplies attempt counts, elapsed
//! time and the jitter sample.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a failure should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Retrying cannot help
    Permanent,
    /// Retry with backoff
    Transient,
    /// The remote record moved on; reconcile before pushing again
    Conflict,
}

/// A classified failure from the external store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    BadRequest,
    Unauthorized,
    NotFound,
    VersionConflict,
    CursorExpired,
    RateLimited { retry_after: Option<Duration> },
    ServerError(u16),
    Timeout,
    Connection,
    Protocol,
}

impl FailureKind {
    pub fn class(&self) -> FailureClass {
        match self {
            FailureKind::RateLimited { .. }
            | FailureKind::ServerError(_)
            | FailureKind::Timeout
            | FailureKind::Connection => FailureClass::Transient,
            FailureKind::VersionConflict => FailureClass::Conflict,
            FailureKind::BadRequest
            | FailureKind::Unauthorized
            | FailureKind::NotFound
            | FailureKind::CursorExpired
            | FailureKind::Protocol => FailureClass::Permanent,
        }
    }

    /// Map an HTTP status code. `None` for success codes.
    pub fn from_status(status: u16, retry_after: Option<Duration>) -> Option<Self> {
        let kind = match status {
            200..=299 => return None,
            400 | 422 => FailureKind::BadRequest,
            401 | 403 => FailureKind::Unauthorized,
            404 => FailureKind::NotFound,
            409 | 412 => FailureKind::VersionConflict,
            410 => FailureKind::CursorExpired,
            429 => FailureKind::RateLimited { retry_after },
            500..=599 => FailureKind::ServerError(status),
            _ => FailureKind::Protocol,
        };
        Some(kind)
    }

    pub fn is_transient(&self) -> bool {
        self.class() == FailureClass::Transient
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::BadRequest => write!(f, "bad request"),
            FailureKind::Unauthorized => write!(f, "unauthorized"),
            FailureKind::NotFound => write!(f, "not found"),
            FailureKind::VersionConflict => write!(f, "version conflict"),
            FailureKind::CursorExpired => write!(f, "cursor expired"),
            FailureKind::RateLimited {
                retry_after: Some(after),
            } => write!(f, "rate limited (retry after {}ms)", after.as_millis()),
            FailureKind::RateLimited { retry_after: None } => write!(f, "rate limited"),
            FailureKind::ServerError(code) => write!(f, "server error {code}"),
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::Connection => write!(f, "connection failure"),
            FailureKind::Protocol => write!(f, "protocol error"),
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// Exponential backoff with jitter, bounded by attempts and elapsed time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub max_elapsed: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the delay added at most as jitter
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            max_elapsed: Duration::from_secs(600),
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = max_elapsed;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Backoff before attempt `attempts + 1`, without jitter.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(63) as i32;
        let millis = self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Decide after `attempts` attempts (the failed one included).
    ///
    /// `jitter_sample` is expected in `[0, 1)`.
    pub fn decide(
        &self,
        failure: &FailureKind,
        attempts: u32,
        elapsed: Duration,
        jitter_sample: f64,
    ) -> RetryDecision {
        if !failure.is_transient() {
            return RetryDecision::GiveUp;
        }
        if attempts >= self.max_attempts || elapsed >= self.max_elapsed {
            return RetryDecision::GiveUp;
        }

        if let FailureKind::RateLimited {
            retry_after: Some(after),
        } = failure
        {
            return RetryDecision::RetryAfter(*after);
        }

        let delay = self.backoff(attempts);
        let sample = jitter_sample.clamp(0.0, 1.0);
        let extra = delay.as_millis() as f64 * self.jitter * sample;
        RetryDecision::RetryAfter(delay + Duration::from_millis(extra as u64))
    }
}
