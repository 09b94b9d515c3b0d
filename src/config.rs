//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::stage::rules::PhraseLists;
use crate::store::keys::DEFAULT_ROUTING_SUFFIX;
use crate::store::traits::DEFAULT_BATCH_LIMIT;

/// Stage engine configuration.
#[derive(Debug, Clone)]
pub struct StageConfig {
    /// Path of the libSQL database file.
    pub db_path: PathBuf,
    /// JSON file with the phrase lists. `None` uses the built-in lists.
    pub phrases_path: Option<PathBuf>,
    /// Routing-domain suffix appended to bare numeric conversation ids.
    pub routing_suffix: String,
    /// Maximum distinct ids per batched read.
    pub batch_limit: usize,
    /// Budget for fetching messages and classifying inline with a request.
    pub classify_timeout: Duration,
    /// Budget for a single store operation.
    pub store_timeout: Duration,
    /// How long a freshly computed stage is reused instead of re-fetching
    /// messages. Zero disables reuse.
    pub memo_ttl: Duration,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/lead-stage.db"),
            phrases_path: None,
            routing_suffix: DEFAULT_ROUTING_SUFFIX.to_string(),
            batch_limit: DEFAULT_BATCH_LIMIT,
            classify_timeout: Duration::from_millis(3500),
            store_timeout: Duration::from_secs(2),
            memo_ttl: Duration::ZERO,
        }
    }
}

impl StageConfig {
    /// Build from `LEAD_STAGE_*` environment variables, defaulting anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (environment, settings table, tests).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let routing_suffix = get("LEAD_STAGE_ROUTING_SUFFIX").unwrap_or(defaults.routing_suffix);
        if !routing_suffix.starts_with('@') {
            return Err(ConfigError::InvalidValue {
                key: "LEAD_STAGE_ROUTING_SUFFIX".into(),
                message: format!("must start with '@', got {routing_suffix:?}"),
            });
        }

        let batch_limit: usize = parse_or(&get, "LEAD_STAGE_BATCH_LIMIT", defaults.batch_limit)?;
        if batch_limit == 0 {
            return Err(ConfigError::InvalidValue {
                key: "LEAD_STAGE_BATCH_LIMIT".into(),
                message: "must be at least 1".into(),
            });
        }

        Ok(Self {
            db_path: get("LEAD_STAGE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            phrases_path: get("LEAD_STAGE_PHRASES_PATH").map(PathBuf::from),
            routing_suffix,
            batch_limit,
            classify_timeout: Duration::from_millis(parse_or(
                &get,
                "LEAD_STAGE_CLASSIFY_TIMEOUT_MS",
                defaults.classify_timeout.as_millis() as u64,
            )?),
            store_timeout: Duration::from_millis(parse_or(
                &get,
                "LEAD_STAGE_STORE_TIMEOUT_MS",
                defaults.store_timeout.as_millis() as u64,
            )?),
            memo_ttl: Duration::from_secs(parse_or(
                &get,
                "LEAD_STAGE_MEMO_TTL_SECS",
                defaults.memo_ttl.as_secs(),
            )?),
        })
    }

    /// Phrase lists from `phrases_path`, or the built-in lists when unset.
    pub fn load_phrases(&self) -> Result<PhraseLists, ConfigError> {
        match &self.phrases_path {
            Some(path) => PhraseLists::load(path),
            None => Ok(PhraseLists::default()),
        }
    }
}

fn parse_or<T>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}
