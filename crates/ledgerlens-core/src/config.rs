use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::retry::RetryConfig;
use crate::CoreError;

const MEGABYTE: u64 = 1024 * 1024;

/// Tuning for the ingestion pipeline.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Rows per batch write.
    pub batch_size: usize,
    /// Batches written concurrently.
    pub workers: usize,
    /// Retry policy for each batch.
    pub retry: RetryConfig,
    /// Caller-imposed limit on one batch attempt. An overrunning attempt is
    /// logged and awaited before any retry starts.
    pub attempt_timeout: Duration,
    /// Uploads above this size are rejected before parsing.
    pub max_upload_bytes: u64,
    /// Retries of the post-load aggregate refresh.
    pub aggregate_refresh_retries: u32,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: 1_000,
            workers: 4,
            retry: RetryConfig::default(),
            attempt_timeout: Duration::from_secs(30),
            max_upload_bytes: 20 * MEGABYTE,
            aggregate_refresh_retries: 3,
        }
    }
}

impl IngestConfig {
    /// Defaults overridden by `LEDGERLENS_BATCH_SIZE`, `LEDGERLENS_WORKERS`,
    /// `LEDGERLENS_MAX_ATTEMPTS`, and `LEDGERLENS_MAX_UPLOAD_MB`.
    pub fn from_env() -> Result<Self, CoreError> {
        let mut config = Self::default();
        if let Some(batch_size) = env_value::<usize>("LEDGERLENS_BATCH_SIZE")? {
            config.batch_size = batch_size;
        }
        if let Some(workers) = env_value::<usize>("LEDGERLENS_WORKERS")? {
            config.workers = workers;
        }
        if let Some(attempts) = env_value::<u32>("LEDGERLENS_MAX_ATTEMPTS")? {
            config = config.with_max_attempts(attempts);
        }
        if let Some(megabytes) = env_value::<u64>("LEDGERLENS_MAX_UPLOAD_MB")? {
            config.max_upload_bytes = megabytes.saturating_mul(MEGABYTE);
        }
        config.validate()?;
        Ok(config)
    }

    /// Set the total number of attempts per batch (at least one).
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        let attempts = attempts.max(1);
        self.retry.enabled = attempts > 1;
        self.retry.max_retries = attempts - 1;
        self
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.batch_size == 0 {
            return Err(CoreError::Config(String::from("batch size must be greater than zero")));
        }
        if self.workers == 0 {
            return Err(CoreError::Config(String::from("worker count must be greater than zero")));
        }
        if self.attempt_timeout.is_zero() {
            return Err(CoreError::Config(String::from("attempt timeout must be greater than zero")));
        }
        Ok(())
    }

    /// Retry policy for the aggregate refresh, sharing the batch backoff.
    pub fn aggregate_retry(&self) -> RetryConfig {
        RetryConfig {
            enabled: self.aggregate_refresh_retries > 0,
            max_retries: self.aggregate_refresh_retries,
            backoff: self.retry.backoff,
        }
    }
}

fn env_value<T: FromStr>(name: &str) -> Result<Option<T>, CoreError> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| CoreError::Config(format!("{name} has invalid value '{value}'"))),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = IngestConfig::default();
        assert_eq!(config.batch_size, 1_000);
        assert_eq!(config.workers, 4);
        assert_eq!(config.retry.max_attempts(), 5);
        assert_eq!(config.attempt_timeout, Duration::from_secs(30));
        assert_eq!(config.max_upload_bytes, 20 * 1024 * 1024);
        assert_eq!(config.aggregate_retry().max_attempts(), 4);
    }

    #[test]
    fn max_attempts_of_one_disables_retries() {
        let config = IngestConfig::default().with_max_attempts(1);
        assert!(!config.retry.enabled);
        assert_eq!(config.retry.max_attempts(), 1);
    }

    #[test]
    fn zero_workers_is_rejected() {
        let config = IngestConfig {
            workers: 0,
            ..IngestConfig::default()
        };
        assert!(matches!(config.validate(), Err(CoreError::Config(_))));
    }
}
