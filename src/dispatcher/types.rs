//! Dispatcher type definitions.
//!
//! This module contains error types, state enums, configuration and command
//! types for the dispatcher.

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::storage::StorageError;

/// Errors that can occur in the dispatcher.
#[derive(Debug, Error)]
pub enum DispatcherError {
    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Channel error.
    #[error("channel error: {0}")]
    ChannelError(String),
}

/// State of the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatcherState {
    /// Dispatcher is stopped.
    Stopped,
    /// Dispatcher is running.
    Running,
    /// Dispatcher is paused; running jobs finish, nothing new starts.
    Paused,
}

impl DispatcherState {
    pub fn as_str(self) -> &'static str {
        match self {
            DispatcherState::Stopped => "stopped",
            DispatcherState::Running => "running",
            DispatcherState::Paused => "paused",
        }
    }
}

/// What one maintenance pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    /// Recurring schedules that spawned a job.
    pub fired: usize,
    /// Recurring fires skipped because an instance was still live.
    pub suppressed: usize,
    /// Expired leases released.
    pub reclaimed: usize,
    /// Finished jobs removed.
    pub purged: usize,
}

/// Worker pool and maintenance settings.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherConfig {
    /// Number of worker tasks.
    pub workers: usize,
    /// How long an idle worker waits before polling again.
    pub poll_interval: Duration,
    /// Lease length; renewed every third of it while a handler runs.
    pub lease_duration: Duration,
    /// Upper bound on one handler invocation.
    pub handler_timeout: Duration,
    /// Candidates fetched per poll.
    pub fetch_batch: usize,
    /// How long finished jobs are kept.
    pub retention: Duration,
    /// How long shutdown waits for in-flight jobs.
    pub shutdown_timeout: Duration,
    /// Prefix of worker ids, unique per dispatcher.
    pub name: String,
}

impl DispatcherConfig {
    /// How often a running handler's lease is renewed.
    pub fn renew_interval(&self) -> Duration {
        (self.lease_duration / 3).max(Duration::from_millis(10))
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self {
            workers: 4,
            poll_interval: Duration::from_secs(5),
            lease_duration: Duration::from_secs(30),
            handler_timeout: Duration::from_secs(60),
            fetch_batch: 16,
            retention: Duration::from_secs(24 * 60 * 60),
            shutdown_timeout: Duration::from_secs(30),
            name: format!("tardy-{}", &suffix[..8]),
        }
    }
}

/// Commands that can be sent to the dispatcher.
pub(crate) enum DispatcherCommand {
    /// Stop claiming new jobs.
    Pause { response: oneshot::Sender<()> },
    /// Resume claiming jobs.
    Resume { response: oneshot::Sender<()> },
    /// Run the recurring pump, lease reclamation and purge now.
    Maintain {
        response: oneshot::Sender<Result<MaintenanceReport, DispatcherError>>,
    },
    /// Stop and wait for in-flight jobs.
    Shutdown { response: oneshot::Sender<()> },
}
