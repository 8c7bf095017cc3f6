//! Configuration management for the server.

use crate::queue::QueueFullPolicy;
use crate::sync::SyncOptions;
use ferry_engine::{ConflictResolver, DeploymentMode, EntityMapper, KindMapping, RetryPolicy};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// PostgreSQL connection URL; the in-memory store is used without it
    pub database_url: Option<String>,
    /// Base URL of the external store's REST API
    pub external_api_url: String,
    /// Bearer token for the external store
    pub external_api_token: Option<String>,
    /// Entity mapping definitions (JSON)
    pub mappings_path: Option<PathBuf>,
    pub rate_limit_per_second: u32,
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub queue_full_policy: QueueFullPolicy,
    pub interactive_burst: u32,
    pub request_timeout: Duration,
    pub pull_interval: Duration,
    pub pump_interval: Duration,
    pub retry_max_attempts: u32,
    pub retry_max_elapsed: Duration,
    pub deployment_mode: DeploymentMode,
    pub outbox_retention: Duration,
    /// Kinds pulled by the background scheduler
    pub entity_kinds: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port = parse_or(&lookup, "PORT", 3000)?;
        let database_url = lookup("DATABASE_URL").filter(|v| !v.is_empty());
        let external_api_url = lookup("EXTERNAL_API_URL").ok_or(ConfigError::MissingExternalApiUrl)?;
        let external_api_token = lookup("EXTERNAL_API_TOKEN").filter(|v| !v.is_empty());
        let mappings_path = lookup("MAPPINGS_PATH").map(PathBuf::from);

        let queue_full_policy = match lookup("QUEUE_FULL_POLICY").as_deref() {
            None | Some("block") => QueueFullPolicy::Block,
            Some("reject") => QueueFullPolicy::Reject,
            Some(other) => return Err(invalid("QUEUE_FULL_POLICY", other)),
        };

        let deployment_mode = match lookup("DEPLOYMENT_MODE") {
            None => DeploymentMode::default(),
            Some(value) => {
                DeploymentMode::parse(&value).ok_or_else(|| invalid("DEPLOYMENT_MODE", &value))?
            }
        };

        let entity_kinds = lookup("ENTITY_KINDS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|k| !k.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let rate_limit_per_second: u32 = parse_or(&lookup, "RATE_LIMIT_PER_SECOND", 3)?;
        if rate_limit_per_second == 0 {
            return Err(invalid("RATE_LIMIT_PER_SECOND", "0"));
        }
        let worker_count: usize = parse_or(&lookup, "WORKER_COUNT", 4)?;
        if worker_count == 0 {
            return Err(invalid("WORKER_COUNT", "0"));
        }

        Ok(Self {
            host,
            port,
            database_url,
            external_api_url,
            external_api_token,
            mappings_path,
            rate_limit_per_second,
            worker_count,
            queue_capacity: parse_or(&lookup, "QUEUE_CAPACITY", 256)?,
            queue_full_policy,
            interactive_burst: parse_or(&lookup, "INTERACTIVE_BURST", 4)?,
            request_timeout: Duration::from_millis(parse_or(&lookup, "REQUEST_TIMEOUT_MS", 10_000)?),
            pull_interval: Duration::from_secs(parse_or(&lookup, "PULL_INTERVAL_SECS", 60)?),
            pump_interval: Duration::from_millis(parse_or(&lookup, "PUMP_INTERVAL_MS", 1_000)?),
            retry_max_attempts: parse_or(&lookup, "RETRY_MAX_ATTEMPTS", 6)?,
            retry_max_elapsed: Duration::from_secs(parse_or(&lookup, "RETRY_MAX_ELAPSED_SECS", 600)?),
            deployment_mode,
            outbox_retention: Duration::from_secs(
                parse_or::<u64, _>(&lookup, "OUTBOX_RETENTION_HOURS", 72)? * 3600,
            ),
            entity_kinds,
        })
    }

    /// Runtime options for the sync engine.
    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            worker_count: self.worker_count,
            queue_capacity: self.queue_capacity,
            queue_full_policy: self.queue_full_policy,
            interactive_burst: self.interactive_burst,
            pull_interval: self.pull_interval,
            pump_interval: self.pump_interval,
            outbox_retention: self.outbox_retention,
            retry: RetryPolicy::default()
                .with_max_attempts(self.retry_max_attempts)
                .with_max_elapsed(self.retry_max_elapsed),
            kinds: self.entity_kinds.clone(),
        }
    }

    /// Read the mapping file, if one is configured.
    pub fn load_mappings(&self) -> Result<MappingFile, ConfigError> {
        let Some(path) = &self.mappings_path else {
            return Ok(MappingFile::default());
        };
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Mappings {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&raw).map_err(|e| ConfigError::Mappings {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }
}

/// Entity mapping definitions plus field authority rules.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingFile {
    #[serde(default)]
    pub kinds: Vec<KindMapping>,
    /// Fields per kind that always keep the local value
    #[serde(default)]
    pub local_authoritative: BTreeMap<String, Vec<String>>,
}

impl MappingFile {
    pub fn mapper(&self) -> EntityMapper {
        self.kinds
            .iter()
            .cloned()
            .fold(EntityMapper::new(), EntityMapper::with_kind)
    }

    pub fn resolver(&self, mode: DeploymentMode) -> ConflictResolver {
        self.local_authoritative
            .iter()
            .fold(ConflictResolver::new(mode), |resolver, (kind, fields)| {
                resolver.with_local_authority(kind.clone(), fields.iter().cloned())
            })
    }
}

fn parse_or<T, F>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| invalid(name, &value)),
    }
}

fn invalid(name: &'static str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        name,
        value: value.to_string(),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("EXTERNAL_API_URL environment variable is required")]
    MissingExternalApiUrl,

    #[error("Invalid {name} value: {value}")]
    Invalid { name: &'static str, value: String },

    #[error("Cannot load mappings from {path}: {reason}")]
    Mappings { path: String, reason: String },
}
