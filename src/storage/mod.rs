//! Storage abstraction for jobs and recurring schedules.
//!
//! The [`JobStore`] trait is the only place job state is mutated. Every
//! mutation is atomic per job id; `try_lock` is the mutual-exclusion point
//! that keeps a job from running on two workers at once. Backends:
//!
//! - [`InMemoryStore`]: per-key locking over `dashmap`, lost on restart
//! - [`SqliteStore`]: durable, compare-and-set updates (feature `sqlite`)

mod memory;
#[cfg(any(feature = "sqlite", test))]
mod sqlite;

pub use memory::InMemoryStore;
#[cfg(any(feature = "sqlite", test))]
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

use crate::core::job::{Job, JobState, JobStats, RecurringSchedule};
use crate::core::types::{JobId, ScheduleKey, WorkerId};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested item was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The item is not in a state that permits the operation.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A duplicate key was detected.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The backend itself failed.
    #[error("storage error: {0}")]
    Backend(String),
}

/// How a failed attempt should be recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Schedule another attempt at `next_at`, if attempts remain.
    Retry { next_at: DateTime<Utc> },
    /// Fail the job for good.
    Terminal,
}

impl FailureDisposition {
    pub(crate) fn retry_at(self) -> Option<DateTime<Utc>> {
        match self {
            FailureDisposition::Retry { next_at } => Some(next_at),
            FailureDisposition::Terminal => None,
        }
    }
}

/// Result of firing a recurring schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome {
    /// A new job instance was created.
    Spawned(JobId),
    /// A previous instance is still live; nothing was created.
    Suppressed,
}

/// `Conflict` unless `owner` holds the job's processing lease.
pub(crate) fn ensure_held(job: &Job, owner: &WorkerId) -> Result<(), StorageError> {
    if job.is_held_by(owner) {
        Ok(())
    } else {
        Err(StorageError::Conflict(format!(
            "job {} is not processing for {}",
            job.id, owner
        )))
    }
}

/// Storage trait for jobs and recurring schedules.
#[async_trait]
pub trait JobStore: Send + Sync {
    // Job operations

    /// Persist a new job.
    async fn enqueue(&self, job: Job) -> Result<JobId, StorageError>;

    /// Get a job by ID.
    async fn get_job(&self, id: &JobId) -> Result<Job, StorageError>;

    /// Runnable jobs due at `now`, earliest first, at most `limit`.
    async fn fetch_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, StorageError>;

    /// Atomically claim a job for `owner`.
    ///
    /// Succeeds when the job is runnable and due, or processing with an
    /// expired lease. On success the job is `Processing` with
    /// `locked_until = now + lease`.
    async fn try_lock(
        &self,
        id: &JobId,
        owner: &WorkerId,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError>;

    /// Extend a lease still held by `owner`. Returns false if it was lost.
    async fn renew_lease(
        &self,
        id: &JobId,
        owner: &WorkerId,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError>;

    /// Record success for a job processed by `owner`.
    async fn complete(
        &self,
        id: &JobId,
        owner: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<JobState, StorageError>;

    /// Record a failed attempt for a job processed by `owner`.
    async fn fail(
        &self,
        id: &JobId,
        owner: &WorkerId,
        error: &str,
        disposition: FailureDisposition,
        now: DateTime<Utc>,
    ) -> Result<JobState, StorageError>;

    /// Release a lease without recording an outcome.
    async fn unlock(
        &self,
        id: &JobId,
        owner: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<JobState, StorageError>;

    /// Cancel a job. Processing jobs are flagged and deleted once they stop.
    async fn cancel(&self, id: &JobId, now: DateTime<Utc>) -> Result<JobState, StorageError>;

    /// Release every processing job whose lease expired before `now`.
    async fn reclaim_expired(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(JobId, JobState)>, StorageError>;

    /// Delete terminal jobs that finished before `older_than`.
    async fn purge_finished(&self, older_than: DateTime<Utc>) -> Result<usize, StorageError>;

    /// List jobs, newest first, optionally filtered by state.
    async fn list_jobs(
        &self,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<Job>, StorageError>;

    /// Counts per state.
    async fn stats(&self) -> Result<JobStats, StorageError>;

    // Recurring schedule operations

    /// Insert or update a schedule by key.
    ///
    /// An existing schedule keeps its `created_at` and `last_job_id`.
    async fn upsert_schedule(
        &self,
        schedule: RecurringSchedule,
    ) -> Result<RecurringSchedule, StorageError>;

    /// Get a schedule by key.
    async fn get_schedule(&self, key: &ScheduleKey) -> Result<RecurringSchedule, StorageError>;

    /// List all schedules, ordered by key.
    async fn list_schedules(&self) -> Result<Vec<RecurringSchedule>, StorageError>;

    /// Remove a schedule by key.
    async fn remove_schedule(&self, key: &ScheduleKey) -> Result<(), StorageError>;

    /// Schedules whose `next_fire_at` is at or before `now`.
    async fn due_schedules(&self, now: DateTime<Utc>)
    -> Result<Vec<RecurringSchedule>, StorageError>;

    /// Atomically advance a schedule and spawn `job` unless a previous
    /// instance is still live.
    ///
    /// Returns `Conflict` if `next_fire_at` no longer equals
    /// `expected_fire_at`, meaning another dispatcher already fired it.
    async fn fire_schedule(
        &self,
        key: &ScheduleKey,
        expected_fire_at: DateTime<Utc>,
        next_fire_at: DateTime<Utc>,
        job: Job,
    ) -> Result<FireOutcome, StorageError>;
}
