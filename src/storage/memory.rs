//! In-memory storage implementation.
//!
//! Provides a thread-safe in-memory backend for testing and development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::time::Duration;

use super::{FailureDisposition, FireOutcome, JobStore, StorageError, ensure_held};
use crate::core::job::{Job, JobState, JobStats, RecurringSchedule};
use crate::core::types::{JobId, ScheduleKey, WorkerId};

/// In-memory storage backend.
///
/// Jobs and schedules live in sharded concurrent maps, so mutations lock a
/// single entry and run in parallel across ids. Data is not persisted across
/// restarts.
///
/// Lock order is schedules before jobs; no job entry is held while touching
/// another job.
pub struct InMemoryStore {
    jobs: DashMap<JobId, Job>,
    schedules: DashMap<ScheduleKey, RecurringSchedule>,
}

impl InMemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            jobs: DashMap::new(),
            schedules: DashMap::new(),
        }
    }

    /// Run `f` against the job while holding its entry lock.
    fn with_job<T>(
        &self,
        id: &JobId,
        f: impl FnOnce(&mut Job) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut entry = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("job: {}", id)))?;
        f(entry.value_mut())
    }

    fn insert_job(&self, job: Job) -> Result<JobId, StorageError> {
        match self.jobs.entry(job.id) {
            Entry::Occupied(_) => Err(StorageError::DuplicateKey(format!("job: {}", job.id))),
            Entry::Vacant(slot) => {
                let id = job.id;
                slot.insert(job);
                Ok(id)
            }
        }
    }

    fn has_live_instance(&self, key: &ScheduleKey) -> bool {
        self.jobs
            .iter()
            .any(|job| !job.state.is_terminal() && job.kind.schedule_key() == Some(key))
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn due_time(job: &Job) -> DateTime<Utc> {
    job.scheduled_at.unwrap_or(job.created_at)
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn enqueue(&self, job: Job) -> Result<JobId, StorageError> {
        self.insert_job(job)
    }

    async fn get_job(&self, id: &JobId) -> Result<Job, StorageError> {
        self.jobs
            .get(id)
            .map(|job| job.clone())
            .ok_or_else(|| StorageError::NotFound(format!("job: {}", id)))
    }

    async fn fetch_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, StorageError> {
        let mut due: Vec<Job> = self
            .jobs
            .iter()
            .filter(|job| job.is_due(now) && !job.has_live_lease(now))
            .map(|job| job.clone())
            .collect();
        due.sort_by_key(due_time);
        due.truncate(limit);
        Ok(due)
    }

    async fn try_lock(
        &self,
        id: &JobId,
        owner: &WorkerId,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        self.with_job(id, |job| {
            if !job.is_claimable(now) {
                return Ok(false);
            }
            job.mark_locked(owner, lease, now);
            Ok(true)
        })
    }

    async fn renew_lease(
        &self,
        id: &JobId,
        owner: &WorkerId,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let Some(mut job) = self.jobs.get_mut(id) else {
            return Ok(false);
        };
        if !job.is_held_by(owner) {
            return Ok(false);
        }
        job.extend_lease(lease, now);
        Ok(true)
    }

    async fn complete(
        &self,
        id: &JobId,
        owner: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<JobState, StorageError> {
        self.with_job(id, |job| {
            ensure_held(job, owner)?;
            job.mark_succeeded(now);
            Ok(job.state)
        })
    }

    async fn fail(
        &self,
        id: &JobId,
        owner: &WorkerId,
        error: &str,
        disposition: FailureDisposition,
        now: DateTime<Utc>,
    ) -> Result<JobState, StorageError> {
        self.with_job(id, |job| {
            ensure_held(job, owner)?;
            job.mark_attempt_failed(error, disposition.retry_at(), now);
            Ok(job.state)
        })
    }

    async fn unlock(
        &self,
        id: &JobId,
        owner: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<JobState, StorageError> {
        self.with_job(id, |job| {
            ensure_held(job, owner)?;
            job.mark_released(now);
            Ok(job.state)
        })
    }

    async fn cancel(&self, id: &JobId, now: DateTime<Utc>) -> Result<JobState, StorageError> {
        self.with_job(id, |job| {
            job.mark_cancelled(now);
            Ok(job.state)
        })
    }

    async fn reclaim_expired(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(JobId, JobState)>, StorageError> {
        let expired: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|job| job.state == JobState::Processing && !job.has_live_lease(now))
            .map(|job| job.id)
            .collect();

        let mut reclaimed = Vec::new();
        for id in expired {
            if let Some(mut job) = self.jobs.get_mut(&id) {
                // re-check under the entry lock; a renewal may have raced us
                if job.state == JobState::Processing && !job.has_live_lease(now) {
                    job.mark_released(now);
                    reclaimed.push((id, job.state));
                }
            }
        }
        Ok(reclaimed)
    }

    async fn purge_finished(&self, older_than: DateTime<Utc>) -> Result<usize, StorageError> {
        let mut removed = 0;
        self.jobs.retain(|_, job| {
            let expired =
                job.state.is_terminal() && job.finished_at.is_some_and(|at| at < older_than);
            if expired {
                removed += 1;
            }
            !expired
        });
        Ok(removed)
    }

    async fn list_jobs(
        &self,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<Job>, StorageError> {
        let mut jobs: Vec<Job> = self
            .jobs
            .iter()
            .filter(|job| state.is_none_or(|s| job.state == s))
            .map(|job| job.clone())
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn stats(&self) -> Result<JobStats, StorageError> {
        let mut stats = JobStats::default();
        for job in self.jobs.iter() {
            stats.record(job.state);
        }
        stats.recurring = self.schedules.len();
        Ok(stats)
    }

    async fn upsert_schedule(
        &self,
        schedule: RecurringSchedule,
    ) -> Result<RecurringSchedule, StorageError> {
        match self.schedules.entry(schedule.key.clone()) {
            Entry::Occupied(mut existing) => {
                let stored = existing.get_mut();
                stored.cron = schedule.cron;
                stored.timezone = schedule.timezone;
                stored.payload = schedule.payload;
                stored.max_attempts = schedule.max_attempts;
                stored.next_fire_at = schedule.next_fire_at;
                stored.updated_at = schedule.updated_at;
                Ok(stored.clone())
            }
            Entry::Vacant(slot) => Ok(slot.insert(schedule).clone()),
        }
    }

    async fn get_schedule(&self, key: &ScheduleKey) -> Result<RecurringSchedule, StorageError> {
        self.schedules
            .get(key)
            .map(|s| s.clone())
            .ok_or_else(|| StorageError::NotFound(format!("schedule: {}", key)))
    }

    async fn list_schedules(&self) -> Result<Vec<RecurringSchedule>, StorageError> {
        let mut schedules: Vec<RecurringSchedule> =
            self.schedules.iter().map(|s| s.clone()).collect();
        schedules.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(schedules)
    }

    async fn remove_schedule(&self, key: &ScheduleKey) -> Result<(), StorageError> {
        self.schedules
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(format!("schedule: {}", key)))
    }

    async fn due_schedules(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<RecurringSchedule>, StorageError> {
        let mut due: Vec<RecurringSchedule> = self
            .schedules
            .iter()
            .filter(|s| s.next_fire_at <= now)
            .map(|s| s.clone())
            .collect();
        due.sort_by_key(|s| s.next_fire_at);
        Ok(due)
    }

    async fn fire_schedule(
        &self,
        key: &ScheduleKey,
        expected_fire_at: DateTime<Utc>,
        next_fire_at: DateTime<Utc>,
        job: Job,
    ) -> Result<FireOutcome, StorageError> {
        // the schedule entry stays locked until the job is inserted
        let mut schedule = self
            .schedules
            .get_mut(key)
            .ok_or_else(|| StorageError::NotFound(format!("schedule: {}", key)))?;
        if schedule.next_fire_at != expected_fire_at {
            return Err(StorageError::Conflict(format!(
                "schedule {} already fired for {}",
                key, expected_fire_at
            )));
        }

        schedule.next_fire_at = next_fire_at;
        if self.has_live_instance(key) {
            return Ok(FireOutcome::Suppressed);
        }

        let id = self.insert_job(job)?;
        schedule.last_job_id = Some(id);
        Ok(FireOutcome::Spawned(id))
    }
}
