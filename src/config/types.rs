//! Configuration types.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::api::ApiConfig;
use crate::core::retry::RetryPolicy;
use crate::demo::DemoConfig;
use crate::dispatcher::DispatcherConfig;

/// Global configuration (tardy.yaml).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// HTTP server settings.
    pub server: ApiConfig,
    /// Worker pool and maintenance settings.
    pub dispatcher: DispatcherSettings,
    /// Backoff applied to retryable failures.
    pub retry: RetryPolicy,
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Demo workloads.
    pub demo: DemoConfig,
    /// Recurring schedules registered at startup.
    pub recurring: Vec<RecurringConfig>,
}

/// Storage configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    /// In-memory storage (default, non-persistent).
    #[serde(rename = "memory")]
    #[default]
    Memory,
    /// SQLite storage.
    #[serde(rename = "sqlite")]
    Sqlite {
        /// Path to the database file.
        path: String,
    },
}

/// Dispatcher section of the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherSettings {
    /// Number of worker tasks.
    pub workers: usize,
    /// Idle poll interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Lease length in seconds.
    pub lease_secs: u64,
    /// Handler timeout in seconds.
    pub handler_timeout_secs: u64,
    /// Candidates fetched per poll.
    pub fetch_batch: usize,
    /// Retention of finished jobs in seconds.
    pub retention_secs: u64,
    /// Graceful shutdown timeout in seconds.
    pub shutdown_timeout_secs: u64,
    /// Worker id prefix; random when absent.
    pub name: Option<String>,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        let defaults = DispatcherConfig::default();
        Self {
            workers: defaults.workers,
            poll_interval_ms: defaults.poll_interval.as_millis() as u64,
            lease_secs: defaults.lease_duration.as_secs(),
            handler_timeout_secs: defaults.handler_timeout.as_secs(),
            fetch_batch: defaults.fetch_batch,
            retention_secs: defaults.retention.as_secs(),
            shutdown_timeout_secs: defaults.shutdown_timeout.as_secs(),
            name: None,
        }
    }
}

impl DispatcherSettings {
    /// Convert into the dispatcher's runtime configuration.
    pub fn to_dispatcher_config(&self) -> DispatcherConfig {
        let defaults = DispatcherConfig::default();
        DispatcherConfig {
            workers: self.workers,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            lease_duration: Duration::from_secs(self.lease_secs),
            handler_timeout: Duration::from_secs(self.handler_timeout_secs),
            fetch_batch: self.fetch_batch,
            retention: Duration::from_secs(self.retention_secs),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
            name: self.name.clone().unwrap_or(defaults.name),
        }
    }
}

/// A recurring schedule declared in the configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringConfig {
    /// Schedule key; re-registering the same key replaces the schedule.
    pub key: String,
    /// Name of the handler the spawned jobs run.
    pub handler: String,
    /// Arguments passed to the handler.
    #[serde(default)]
    pub args: serde_json::Value,
    /// Cron expression or shortcut.
    pub cron: String,
    /// IANA timezone the expression is evaluated in.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Attempt limit of spawned jobs.
    pub max_attempts: Option<u32>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}
