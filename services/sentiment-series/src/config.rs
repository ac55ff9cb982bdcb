//! Engine configuration loaded from environment variables.
//!
//! Every variable is optional; unset or empty values keep the default.
//! - `SENTIMENT_RETRY_MAX_ATTEMPTS`: attempts per store operation
//! - `SENTIMENT_RETRY_INITIAL_BACKOFF_MS` / `SENTIMENT_RETRY_MAX_BACKOFF_MS`
//! - `SENTIMENT_WRITE_TIMEOUT_MS`: deadline for a single store attempt
//! - `SENTIMENT_RETENTION_<RES>_SECS`: retention override per resolution,
//!   e.g. `SENTIMENT_RETENTION_1M_SECS`, `SENTIMENT_RETENTION_24H_SECS`

use std::collections::BTreeMap;
use std::time::Duration as StdDuration;

use chrono::Duration;
use types::resolution::Resolution;

use crate::retry::RetryPolicy;

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

/// Tunables shared by the fanout writer and the query service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    /// Retention per resolution
    pub retention: BTreeMap<Resolution, Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            retention: Resolution::ALL
                .iter()
                .map(|r| (*r, r.default_retention()))
                .collect(),
        }
    }
}

impl EngineConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(raw) = var("SENTIMENT_RETRY_MAX_ATTEMPTS") {
            config.retry.max_attempts = parse("SENTIMENT_RETRY_MAX_ATTEMPTS", &raw)?;
        }
        if let Some(raw) = var("SENTIMENT_RETRY_INITIAL_BACKOFF_MS") {
            config.retry.initial_backoff =
                StdDuration::from_millis(parse("SENTIMENT_RETRY_INITIAL_BACKOFF_MS", &raw)?);
        }
        if let Some(raw) = var("SENTIMENT_RETRY_MAX_BACKOFF_MS") {
            config.retry.max_backoff =
                StdDuration::from_millis(parse("SENTIMENT_RETRY_MAX_BACKOFF_MS", &raw)?);
        }
        if let Some(raw) = var("SENTIMENT_WRITE_TIMEOUT_MS") {
            config.retry.attempt_timeout =
                StdDuration::from_millis(parse("SENTIMENT_WRITE_TIMEOUT_MS", &raw)?);
        }
        for r in Resolution::ALL {
            let key = retention_key(r);
            if let Some(raw) = var(key.as_str()) {
                let secs: i64 = parse(&key, &raw)?;
                let ttl = Duration::try_seconds(secs)
                    .ok_or_else(|| invalid(&key, &raw, "out of range"))?;
                config.retention.insert(r, ttl);
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(invalid("SENTIMENT_RETRY_MAX_ATTEMPTS", "0", "must be at least 1"));
        }
        if self.retry.attempt_timeout.is_zero() {
            return Err(invalid("SENTIMENT_WRITE_TIMEOUT_MS", "0", "must be positive"));
        }
        if self.retry.max_backoff < self.retry.initial_backoff {
            return Err(invalid(
                "SENTIMENT_RETRY_MAX_BACKOFF_MS",
                &self.retry.max_backoff.as_millis().to_string(),
                "must not be below the initial backoff",
            ));
        }
        for (r, ttl) in &self.retention {
            if *ttl <= Duration::zero() {
                return Err(invalid(
                    &retention_key(*r),
                    &ttl.num_seconds().to_string(),
                    "must be positive",
                ));
            }
        }
        Ok(())
    }

    /// Retention for `resolution`, falling back to its static default.
    pub fn retention_for(&self, resolution: Resolution) -> Duration {
        self.retention
            .get(&resolution)
            .copied()
            .unwrap_or_else(|| resolution.default_retention())
    }
}

fn retention_key(resolution: Resolution) -> String {
    format!("SENTIMENT_RETENTION_{}_SECS", resolution.as_str().to_uppercase())
}

fn parse<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| invalid(key, raw, &e.to_string()))
}

fn invalid(key: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
