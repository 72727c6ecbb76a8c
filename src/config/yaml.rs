//! YAML configuration parsing.
//!
//! Parses the global configuration file and validates it before anything is
//! started.

use std::collections::HashSet;
use std::path::Path;

use super::error::ConfigError;
use super::types::{GlobalConfig, StorageConfig};
use crate::core::schedule::CronExpr;
use crate::demo::MAX_RETENTION_DAYS;

const DAY_SECS: u64 = 24 * 60 * 60;
const MAX_POLL_INTERVAL_MS: u64 = 60 * 60 * 1000;
const MAX_LEASE_SECS: u64 = DAY_SECS;
const MAX_HANDLER_TIMEOUT_SECS: u64 = 7 * DAY_SECS;
const MAX_RETENTION_SECS: u64 = 3650 * DAY_SECS;
const MAX_SHUTDOWN_TIMEOUT_SECS: u64 = DAY_SECS;
const MAX_RETRY_DELAY_SECS: u64 = 30 * DAY_SECS;

/// Loader for YAML configuration files.
pub struct YamlLoader;

impl YamlLoader {
    /// Load global configuration from a file.
    pub fn load_global_config(path: impl AsRef<Path>) -> Result<GlobalConfig, ConfigError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|source| ConfigError::FileReadError {
                path: path.to_path_buf(),
                source,
            })?;
        let config: GlobalConfig =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::YamlFileError {
                path: path.to_path_buf(),
                source,
            })?;
        Self::validate_global_config(&config)?;
        Ok(config)
    }

    /// Parse global configuration from a YAML string.
    pub fn parse_global_config(yaml: &str) -> Result<GlobalConfig, ConfigError> {
        let config: GlobalConfig = serde_yaml::from_str(yaml)?;
        Self::validate_global_config(&config)?;
        Ok(config)
    }

    /// Validate a global configuration.
    fn validate_global_config(config: &GlobalConfig) -> Result<(), ConfigError> {
        let dispatcher = &config.dispatcher;
        if dispatcher.workers == 0 {
            return Err(ConfigError::InvalidConfig(
                "dispatcher.workers must be at least 1".into(),
            ));
        }
        check_range(
            "dispatcher.poll_interval_ms",
            dispatcher.poll_interval_ms,
            1,
            MAX_POLL_INTERVAL_MS,
        )?;
        check_range("dispatcher.lease_secs", dispatcher.lease_secs, 1, MAX_LEASE_SECS)?;
        check_range(
            "dispatcher.handler_timeout_secs",
            dispatcher.handler_timeout_secs,
            1,
            MAX_HANDLER_TIMEOUT_SECS,
        )?;
        check_range(
            "dispatcher.retention_secs",
            dispatcher.retention_secs,
            0,
            MAX_RETENTION_SECS,
        )?;
        check_range(
            "dispatcher.shutdown_timeout_secs",
            dispatcher.shutdown_timeout_secs,
            0,
            MAX_SHUTDOWN_TIMEOUT_SECS,
        )?;
        if dispatcher.fetch_batch == 0 {
            return Err(ConfigError::InvalidConfig(
                "dispatcher.fetch_batch cannot be zero".into(),
            ));
        }

        let retry = &config.retry;
        check_range(
            "retry.max_delay",
            retry.max_delay.as_secs(),
            0,
            MAX_RETRY_DELAY_SECS,
        )?;
        if retry.base_delay > retry.max_delay {
            return Err(ConfigError::InvalidConfig(
                "retry.base_delay cannot exceed retry.max_delay".into(),
            ));
        }
        if !(0.0..=1.0).contains(&retry.jitter) {
            return Err(ConfigError::InvalidConfig(
                "retry.jitter must be between 0 and 1".into(),
            ));
        }

        if matches!(&config.storage, StorageConfig::Sqlite { path } if path.is_empty()) {
            return Err(ConfigError::MissingField("storage.path".into()));
        }

        if !(0.0..=1.0).contains(&config.demo.failure_probability) {
            return Err(ConfigError::InvalidConfig(
                "demo.failure_probability must be between 0 and 1".into(),
            ));
        }
        if !(0..=MAX_RETENTION_DAYS).contains(&config.demo.retention_days) {
            return Err(ConfigError::InvalidConfig(format!(
                "demo.retention_days must be between 0 and {}",
                MAX_RETENTION_DAYS
            )));
        }

        let mut keys = HashSet::new();
        for entry in &config.recurring {
            if entry.key.is_empty() {
                return Err(ConfigError::MissingField("recurring.key".into()));
            }
            if entry.handler.is_empty() {
                return Err(ConfigError::MissingField(format!(
                    "recurring '{}': handler",
                    entry.key
                )));
            }
            if !keys.insert(entry.key.as_str()) {
                return Err(ConfigError::InvalidConfig(format!(
                    "duplicate recurring key: {}",
                    entry.key
                )));
            }
            if entry.max_attempts == Some(0) {
                return Err(ConfigError::InvalidConfig(format!(
                    "recurring '{}': max_attempts cannot be zero",
                    entry.key
                )));
            }
            CronExpr::parse(&entry.cron, &entry.timezone).map_err(|e| {
                ConfigError::InvalidConfig(format!("recurring '{}': {}", entry.key, e))
            })?;
        }

        Ok(())
    }
}

fn check_range(field: &str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::InvalidConfig(format!(
            "{} must be between {} and {}, got {}",
            field, min, max, value
        )))
    }
}
