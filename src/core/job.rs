//! Job and recurring schedule records.
//!
//! A [`Job`] is one unit of background work: a payload naming a handler plus
//! its JSON arguments, the state it is in, and the bookkeeping the dispatcher
//! needs (attempt counters, lease owner and expiry). A [`RecurringSchedule`] is
//! a named cron-driven template that spawns jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::types::{JobId, ScheduleKey, WorkerId};

/// Default number of attempts a job gets before it is marked failed.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Ready to run as soon as a worker picks it up.
    Enqueued,
    /// Waiting for its due time.
    Scheduled,
    /// Leased by a worker and executing.
    Processing,
    /// Finished successfully.
    Succeeded,
    /// Finished unsuccessfully; no more attempts.
    Failed,
    /// Failed at least once and waiting for its next attempt.
    AwaitingRetry,
    /// Cancelled.
    Deleted,
}

impl JobState {
    /// All states, in display order.
    pub const ALL: [JobState; 7] = [
        JobState::Enqueued,
        JobState::Scheduled,
        JobState::Processing,
        JobState::AwaitingRetry,
        JobState::Succeeded,
        JobState::Failed,
        JobState::Deleted,
    ];

    /// States a worker may pick a job up from.
    pub const RUNNABLE: [JobState; 3] = [
        JobState::Enqueued,
        JobState::Scheduled,
        JobState::AwaitingRetry,
    ];

    /// Whether no further transitions happen from this state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Deleted
        )
    }

    /// Whether a worker may claim a job in this state.
    pub fn is_runnable(self) -> bool {
        Self::RUNNABLE.contains(&self)
    }

    /// Stable lowercase name, used for persistence and JSON.
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Enqueued => "enqueued",
            JobState::Scheduled => "scheduled",
            JobState::Processing => "processing",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::AwaitingRetry => "awaiting_retry",
            JobState::Deleted => "deleted",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown job state: {}", s))
    }
}

/// How a job came to exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobKind {
    /// Fire-and-forget: run as soon as possible.
    OneShot,
    /// Run once at a later time.
    Delayed,
    /// Spawned by the recurring schedule with this key.
    Recurring { key: ScheduleKey },
}

impl JobKind {
    /// Stable lowercase name, used for persistence and JSON.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::OneShot => "one_shot",
            JobKind::Delayed => "delayed",
            JobKind::Recurring { .. } => "recurring",
        }
    }

    /// The schedule key, for recurring jobs.
    pub fn schedule_key(&self) -> Option<&ScheduleKey> {
        match self {
            JobKind::Recurring { key } => Some(key),
            _ => None,
        }
    }
}

/// What a job runs: the registered handler name and its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Name the handler is registered under.
    pub handler: String,
    /// Arbitrary JSON arguments passed to the handler.
    #[serde(default)]
    pub args: serde_json::Value,
}

impl Payload {
    /// Create a payload with no arguments.
    pub fn new(handler: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
            args: serde_json::Value::Null,
        }
    }

    /// Builder: set the arguments.
    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        self.args = args;
        self
    }
}

/// A persisted job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub payload: Payload,
    pub kind: JobKind,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    /// Due time; `None` means "as soon as possible".
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Number of the current (or last) attempt, starting at 1.
    pub attempt: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub locked_by: Option<WorkerId>,
    pub locked_until: Option<DateTime<Utc>>,
    /// When the job entered a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
    /// Set when cancellation arrives while the job is processing.
    pub cancel_requested: bool,
    /// Bumped on every mutation.
    pub version: u64,
}

impl Job {
    /// Create a job that is ready to run immediately.
    pub fn now(payload: Payload, created_at: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            payload,
            kind: JobKind::OneShot,
            state: JobState::Enqueued,
            created_at,
            scheduled_at: None,
            attempt: 1,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            last_error: None,
            locked_by: None,
            locked_until: None,
            finished_at: None,
            cancel_requested: false,
            version: 0,
        }
    }

    /// Create a job due at `due_at`.
    pub fn delayed(payload: Payload, created_at: DateTime<Utc>, due_at: DateTime<Utc>) -> Self {
        let mut job = Self::now(payload, created_at);
        job.kind = JobKind::Delayed;
        job.state = JobState::Scheduled;
        job.scheduled_at = Some(due_at);
        job
    }

    /// Create a job spawned by the recurring schedule `key`.
    pub fn recurring(key: ScheduleKey, payload: Payload, created_at: DateTime<Utc>) -> Self {
        let mut job = Self::now(payload, created_at);
        job.kind = JobKind::Recurring { key };
        job
    }

    /// Builder: set the maximum number of attempts (at least 1).
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Whether the job may run at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state.is_runnable() && self.scheduled_at.is_none_or(|at| at <= now)
    }

    /// Whether a lease is held and has not expired at `now`.
    pub fn has_live_lease(&self, now: DateTime<Utc>) -> bool {
        self.locked_by.is_some() && self.locked_until.is_some_and(|until| until > now)
    }

    /// Whether `try_lock` would succeed at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        let stealable = self.state == JobState::Processing && !self.cancel_requested;
        (self.is_due(now) || stealable) && !self.has_live_lease(now)
    }

    /// Take the lease for `owner`.
    pub fn mark_locked(&mut self, owner: &WorkerId, lease: Duration, now: DateTime<Utc>) {
        self.state = JobState::Processing;
        self.locked_by = Some(owner.clone());
        self.locked_until = Some(saturating_offset(now, lease));
        self.version += 1;
    }

    /// Push the lease expiry out to `now + lease`.
    pub fn extend_lease(&mut self, lease: Duration, now: DateTime<Utc>) {
        self.locked_until = Some(saturating_offset(now, lease));
        self.version += 1;
    }

    /// Whether `owner` holds the processing lease, expired or not.
    pub fn is_held_by(&self, owner: &WorkerId) -> bool {
        self.state == JobState::Processing && self.locked_by.as_ref() == Some(owner)
    }

    /// Release the lease and return to the state the job was claimed from.
    ///
    /// A job with a pending cancellation is deleted instead.
    pub fn mark_released(&mut self, now: DateTime<Utc>) {
        if self.cancel_requested {
            self.finish(JobState::Deleted, now);
            return;
        }
        self.state = if self.attempt > 1 {
            JobState::AwaitingRetry
        } else if self.scheduled_at.is_some() {
            JobState::Scheduled
        } else {
            JobState::Enqueued
        };
        self.clear_lock();
        self.version += 1;
    }

    /// Record a successful attempt (or the cancellation that overrides it).
    pub fn mark_succeeded(&mut self, now: DateTime<Utc>) {
        self.finish(JobState::Succeeded, now);
    }

    /// Record a failed attempt.
    ///
    /// With `retry_at` set and attempts left, the job waits for its next attempt;
    /// otherwise it fails for good.
    pub fn mark_attempt_failed(
        &mut self,
        error: impl Into<String>,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) {
        self.last_error = Some(error.into());
        match retry_at {
            Some(at) if self.attempt < self.max_attempts && !self.cancel_requested => {
                self.state = JobState::AwaitingRetry;
                self.attempt += 1;
                self.scheduled_at = Some(at);
                self.clear_lock();
                self.version += 1;
            }
            _ => self.finish(JobState::Failed, now),
        }
    }

    /// Cancel the job, or flag it for cancellation if it is processing.
    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) {
        match self.state {
            JobState::Deleted => {}
            JobState::Processing => {
                self.cancel_requested = true;
                self.version += 1;
            }
            _ => self.finish(JobState::Deleted, now),
        }
    }

    /// Read-only view for callers.
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot::from(self)
    }

    fn finish(&mut self, state: JobState, now: DateTime<Utc>) {
        self.state = if self.cancel_requested {
            JobState::Deleted
        } else {
            state
        };
        self.finished_at = Some(now);
        self.clear_lock();
        self.version += 1;
    }

    fn clear_lock(&mut self) {
        self.locked_by = None;
        self.locked_until = None;
    }
}

/// Caller-facing view of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub handler: String,
    pub kind: JobKind,
    pub state: JobState,
    pub attempt: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub locked_by: Option<WorkerId>,
    /// True once the job failed after using every attempt.
    pub exhausted: bool,
}

impl From<&Job> for JobSnapshot {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            handler: job.payload.handler.clone(),
            kind: job.kind.clone(),
            state: job.state,
            attempt: job.attempt,
            max_attempts: job.max_attempts,
            last_error: job.last_error.clone(),
            created_at: job.created_at,
            scheduled_at: job.scheduled_at,
            finished_at: job.finished_at,
            locked_by: job.locked_by.clone(),
            exhausted: job.state == JobState::Failed && job.attempt >= job.max_attempts,
        }
    }
}

/// A named cron template that spawns jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringSchedule {
    pub key: ScheduleKey,
    pub cron: String,
    pub timezone: String,
    pub payload: Payload,
    /// Attempts granted to each spawned job.
    pub max_attempts: u32,
    pub next_fire_at: DateTime<Utc>,
    pub last_job_id: Option<JobId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RecurringSchedule {
    /// Create a schedule record. `next_fire_at` must already be computed.
    pub fn new(
        key: ScheduleKey,
        cron: impl Into<String>,
        timezone: impl Into<String>,
        payload: Payload,
        next_fire_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            key,
            cron: cron.into(),
            timezone: timezone.into(),
            payload,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            next_fire_at,
            last_job_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder: set attempts granted to spawned jobs.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Build the job instance for one fire of this schedule.
    pub fn spawn_job(&self, now: DateTime<Utc>) -> Job {
        Job::recurring(self.key.clone(), self.payload.clone(), now)
            .with_max_attempts(self.max_attempts)
    }
}

/// Counts of jobs per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub enqueued: usize,
    pub scheduled: usize,
    pub processing: usize,
    pub awaiting_retry: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub deleted: usize,
    pub recurring: usize,
}

impl JobStats {
    /// Add one job in `state` to the counts.
    pub fn record(&mut self, state: JobState) {
        self.add(state, 1);
    }

    /// Add `count` jobs in `state` to the counts.
    pub fn add(&mut self, state: JobState, count: usize) {
        let slot = match state {
            JobState::Enqueued => &mut self.enqueued,
            JobState::Scheduled => &mut self.scheduled,
            JobState::Processing => &mut self.processing,
            JobState::AwaitingRetry => &mut self.awaiting_retry,
            JobState::Succeeded => &mut self.succeeded,
            JobState::Failed => &mut self.failed,
            JobState::Deleted => &mut self.deleted,
        };
        *slot += count;
    }

    /// Total number of jobs counted.
    pub fn total(&self) -> usize {
        self.enqueued
            + self.scheduled
            + self.processing
            + self.awaiting_retry
            + self.succeeded
            + self.failed
            + self.deleted
    }
}

/// Convert a std duration to chrono, saturating on overflow.
pub(crate) fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// `at + duration`, or `None` past the representable range.
pub(crate) fn checked_offset(at: DateTime<Utc>, duration: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
}

/// `at + duration`, clamped to the latest representable time.
pub(crate) fn saturating_offset(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    checked_offset(at, duration).unwrap_or(DateTime::<Utc>::MAX_UTC)
}
