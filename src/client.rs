//! Enqueue API.
//!
//! [`JobClient`] is the surface callers use to create, inspect and cancel
//! jobs and to manage recurring schedules. It only talks to the store and
//! never waits for a job to run.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::core::clock::{Clock, SystemClock};
use crate::core::job::{
    DEFAULT_MAX_ATTEMPTS, Job, JobSnapshot, JobState, JobStats, Payload, RecurringSchedule,
    checked_offset,
};
use crate::core::schedule::{CronExpr, ScheduleError};
use crate::core::types::{JobId, ScheduleKey};
use crate::events::{Event, EventBus};
use crate::storage::{JobStore, StorageError};

/// Errors returned by [`JobClient`].
#[derive(Debug, Error)]
pub enum ClientError {
    /// No job or schedule with that id or key.
    #[error("not found: {0}")]
    NotFound(String),

    /// The store rejected the operation because of the item's state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The cron expression or timezone is invalid.
    #[error("invalid expression: {0}")]
    InvalidExpression(String),

    /// The requested delay puts the due time out of range.
    #[error("invalid delay: {0}")]
    InvalidDelay(String),

    /// Any other storage failure.
    #[error(transparent)]
    Storage(StorageError),
}

impl From<StorageError> for ClientError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(what) => ClientError::NotFound(what),
            StorageError::Conflict(what) => ClientError::Conflict(what),
            other => ClientError::Storage(other),
        }
    }
}

impl From<ScheduleError> for ClientError {
    fn from(err: ScheduleError) -> Self {
        ClientError::InvalidExpression(err.to_string())
    }
}

/// Options for [`JobClient::enqueue_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Run no earlier than this long from now.
    pub delay: Option<Duration>,
    /// Attempts the job gets; the client default when unset.
    pub max_attempts: Option<u32>,
}

impl EnqueueOptions {
    /// Builder: set the delay.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Builder: set the maximum number of attempts.
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// Client for enqueueing and inspecting jobs.
pub struct JobClient<S: JobStore> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    event_bus: Option<Arc<EventBus>>,
    default_max_attempts: u32,
}

impl<S: JobStore> Clone for JobClient<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            event_bus: self.event_bus.clone(),
            default_max_attempts: self.default_max_attempts,
        }
    }
}

impl<S: JobStore> JobClient<S> {
    /// Create a client over a shared store.
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            event_bus: None,
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Set the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Emit `JobEnqueued` and `JobDeleted` events on this bus.
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Set the attempts granted when a caller does not say.
    pub fn with_default_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts.max(1);
        self
    }

    /// Get the store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Get the clock.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Enqueue a job to run as soon as a worker is free.
    pub async fn enqueue_now(&self, payload: Payload) -> Result<JobId, ClientError> {
        self.enqueue_with(payload, EnqueueOptions::default()).await
    }

    /// Enqueue a job to run no earlier than `delay` from now.
    pub async fn enqueue_delayed(
        &self,
        payload: Payload,
        delay: Duration,
    ) -> Result<JobId, ClientError> {
        self.enqueue_with(payload, EnqueueOptions::default().delay(delay))
            .await
    }

    /// Enqueue a job with explicit options.
    pub async fn enqueue_with(
        &self,
        payload: Payload,
        options: EnqueueOptions,
    ) -> Result<JobId, ClientError> {
        let now = self.clock.now();
        let job = match options.delay {
            Some(delay) if !delay.is_zero() => {
                let due = checked_offset(now, delay).ok_or_else(|| {
                    ClientError::InvalidDelay(format!("{}s is out of range", delay.as_secs()))
                })?;
                Job::delayed(payload, now, due)
            }
            _ => Job::now(payload, now),
        }
        .with_max_attempts(options.max_attempts.unwrap_or(self.default_max_attempts));

        let handler = job.payload.handler.clone();
        let scheduled_at = job.scheduled_at;
        let id = self.store.enqueue(job).await?;

        self.emit(Event::job_enqueued(id, handler, scheduled_at))
            .await;
        Ok(id)
    }

    /// Create or replace the recurring schedule `key`.
    ///
    /// Idempotent: calling it again with the same key updates the existing
    /// schedule in place.
    pub async fn enqueue_recurring(
        &self,
        key: impl Into<ScheduleKey>,
        payload: Payload,
        cron: &str,
        timezone: &str,
    ) -> Result<RecurringSchedule, ClientError> {
        self.enqueue_recurring_with(key, payload, cron, timezone, self.default_max_attempts)
            .await
    }

    /// Like [`enqueue_recurring`](Self::enqueue_recurring), with the number
    /// of attempts each spawned job gets.
    pub async fn enqueue_recurring_with(
        &self,
        key: impl Into<ScheduleKey>,
        payload: Payload,
        cron: &str,
        timezone: &str,
        max_attempts: u32,
    ) -> Result<RecurringSchedule, ClientError> {
        let key = key.into();
        let now = self.clock.now();
        let expr = CronExpr::parse(cron, timezone)?;
        let next_fire_at = expr.next_after(now)?;

        let schedule = RecurringSchedule::new(key, cron, timezone, payload, next_fire_at, now)
            .with_max_attempts(max_attempts);
        let stored = self.store.upsert_schedule(schedule).await?;

        tracing::info!(
            key = %stored.key,
            cron = %stored.cron,
            timezone = %stored.timezone,
            next_fire_at = %stored.next_fire_at,
            "Recurring schedule registered"
        );
        Ok(stored)
    }

    /// Remove the recurring schedule `key`. Jobs it already spawned are kept.
    pub async fn remove_recurring(&self, key: impl Into<ScheduleKey>) -> Result<(), ClientError> {
        let key = key.into();
        self.store.remove_schedule(&key).await?;
        tracing::info!(key = %key, "Recurring schedule removed");
        Ok(())
    }

    /// Get one recurring schedule.
    pub async fn get_recurring(
        &self,
        key: impl Into<ScheduleKey>,
    ) -> Result<RecurringSchedule, ClientError> {
        Ok(self.store.get_schedule(&key.into()).await?)
    }

    /// All recurring schedules, ordered by key.
    pub async fn list_recurring(&self) -> Result<Vec<RecurringSchedule>, ClientError> {
        Ok(self.store.list_schedules().await?)
    }

    /// Latest state of a job.
    pub async fn get_status(&self, id: &JobId) -> Result<JobSnapshot, ClientError> {
        Ok(self.store.get_job(id).await?.snapshot())
    }

    /// Recent jobs, newest first, optionally filtered by state.
    pub async fn list_jobs(
        &self,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<JobSnapshot>, ClientError> {
        let jobs = self.store.list_jobs(state, limit).await?;
        Ok(jobs.iter().map(Job::snapshot).collect())
    }

    /// Cancel a job.
    ///
    /// A job that has not started is deleted at once and never runs. A
    /// processing job is flagged; its result is discarded when it stops.
    pub async fn cancel(&self, id: &JobId) -> Result<JobState, ClientError> {
        let state = self.store.cancel(id, self.clock.now()).await?;
        if state == JobState::Deleted {
            self.emit(Event::job_deleted(*id)).await;
        } else {
            tracing::info!(job_id = %id, state = %state, "Cancellation requested for running job");
        }
        Ok(state)
    }

    /// Counts per state and the number of recurring schedules.
    pub async fn stats(&self) -> Result<JobStats, ClientError> {
        Ok(self.store.stats().await?)
    }

    async fn emit(&self, event: Event) {
        if let Some(bus) = &self.event_bus {
            bus.emit(event).await;
        }
    }
}
