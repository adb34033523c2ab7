//! Configuration loading from the environment.
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `DATABASE_URL` | unset | Postgres connection string; unset means in-memory stores |
//! | `REDIS_URL` | unset | Redis for the worker's `publish` tasks (feature `redis`); unset disables them |
//! | `STRATA_POLL_INTERVAL_MS` | 1000 | Queue poll interval |
//! | `STRATA_MAX_ATTEMPTS` | 3 | Default attempt budget per task |
//! | `STRATA_BACKOFF_BASE_MS` | 1000 | First retry delay |
//! | `STRATA_MAX_BACKOFF_MS` | 300000 | Retry delay cap |
//! | `STRATA_BACKOFF_JITTER` | 0.0 | Jitter factor in `[0, 1]` |
//! | `STRATA_TASK_TIMEOUT_MS` | unset | Per-execution handler timeout |
//! | `STRATA_CLAIM_TIMEOUT_MS` | 900000 | Age at which an unreported claim is released |

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::jobs::QueueConfig;

pub const DATABASE_URL: &str = "DATABASE_URL";
pub const REDIS_URL: &str = "REDIS_URL";
pub const POLL_INTERVAL_MS: &str = "STRATA_POLL_INTERVAL_MS";
pub const MAX_ATTEMPTS: &str = "STRATA_MAX_ATTEMPTS";
pub const BACKOFF_BASE_MS: &str = "STRATA_BACKOFF_BASE_MS";
pub const MAX_BACKOFF_MS: &str = "STRATA_MAX_BACKOFF_MS";
pub const BACKOFF_JITTER: &str = "STRATA_BACKOFF_JITTER";
pub const TASK_TIMEOUT_MS: &str = "STRATA_TASK_TIMEOUT_MS";
pub const CLAIM_TIMEOUT_MS: &str = "STRATA_CLAIM_TIMEOUT_MS";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: '{value}' ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Process configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StrataConfig {
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub queue: QueueConfig,
}

impl StrataConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = QueueConfig::default();

        let poll_interval = parse_var::<u64>(&get, POLL_INTERVAL_MS)?
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_interval);

        let default_max_attempts = match parse_var::<u32>(&get, MAX_ATTEMPTS)? {
            Some(0) => return Err(invalid(MAX_ATTEMPTS, "0", "must be at least 1")),
            Some(n) => n,
            None => defaults.default_max_attempts,
        };

        let backoff_base = parse_var::<u64>(&get, BACKOFF_BASE_MS)?
            .map(Duration::from_millis)
            .unwrap_or(defaults.backoff_base);
        let max_backoff = parse_var::<u64>(&get, MAX_BACKOFF_MS)?
            .map(Duration::from_millis)
            .unwrap_or(defaults.max_backoff);

        let backoff_jitter = match parse_var::<f64>(&get, BACKOFF_JITTER)? {
            Some(j) if !(0.0..=1.0).contains(&j) => {
                return Err(invalid(BACKOFF_JITTER, &j.to_string(), "must be within 0..=1"));
            }
            Some(j) => j,
            None => defaults.backoff_jitter,
        };

        let task_timeout = parse_var::<u64>(&get, TASK_TIMEOUT_MS)?.map(Duration::from_millis);

        let claim_timeout = match parse_var::<u64>(&get, CLAIM_TIMEOUT_MS)? {
            Some(0) => return Err(invalid(CLAIM_TIMEOUT_MS, "0", "must be positive")),
            Some(ms) => Duration::from_millis(ms),
            None => defaults.claim_timeout,
        };

        Ok(Self {
            database_url: get(DATABASE_URL),
            redis_url: get(REDIS_URL),
            queue: QueueConfig {
                poll_interval,
                default_max_attempts,
                backoff_base,
                max_backoff,
                backoff_jitter,
                task_timeout,
                claim_timeout,
            },
        })
    }
}

fn parse_var<T>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get(var)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| invalid(var, &raw, &e.to_string()))
        })
        .transpose()
}

fn invalid(var: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
