//! SQLite storage implementation.
//!
//! Provides durable storage using a SQLite database. Lock acquisition is a
//! single conditional `UPDATE`; other job mutations read the row, apply the
//! transition and write it back guarded by the row's `version`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    Sqlite, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Executor, Row};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use super::{FailureDisposition, FireOutcome, JobStore, StorageError, ensure_held};
use crate::core::job::{
    Job, JobKind, JobState, JobStats, Payload, RecurringSchedule, saturating_offset,
};
use crate::core::types::{JobId, ScheduleKey, WorkerId};

const JOB_COLUMNS: &str = "id, handler, args, kind, schedule_key, state, created_at, \
    scheduled_at, attempt, max_attempts, last_error, locked_by, locked_until, finished_at, \
    cancel_requested, version";

const SCHEDULE_COLUMNS: &str = "key, cron, timezone, handler, args, max_attempts, \
    next_fire_at, last_job_id, created_at, updated_at";

const LIVE_STATES: &str = "('enqueued', 'scheduled', 'processing', 'awaiting_retry')";

/// Attempts at a version-guarded write before giving up with `Conflict`.
const MAX_WRITE_ATTEMPTS: usize = 8;

/// SQLite storage backend.
///
/// Applies the schema on connect; the schema is idempotent.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path_str = path.as_ref().to_string_lossy();
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path_str))
            .map_err(backend)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(backend)?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create an in-memory SQLite database (useful for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(backend)?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(backend)?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StorageError> {
        let schema = include_str!("../../migrations/001_initial_schema.sql");
        sqlx::raw_sql(schema)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("migration failed: {}", e)))?;
        Ok(())
    }

    /// Close the database connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn job_exists(&self, id: &JobId) -> Result<bool, StorageError> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        Ok(found.is_some())
    }

    /// Read the job, apply `f`, and write it back if nobody else changed it
    /// in between. Transitions that leave `version` untouched are not written.
    async fn modify<T, F>(&self, id: &JobId, mut f: F) -> Result<T, StorageError>
    where
        T: Send,
        F: FnMut(&mut Job) -> Result<T, StorageError> + Send,
    {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let mut job = self.get_job(id).await?;
            let expected = job.version;
            let result = f(&mut job)?;
            if job.version == expected || self.write_job(&job, expected).await? {
                return Ok(result);
            }
        }
        Err(StorageError::Conflict(format!(
            "job {} is being modified concurrently",
            id
        )))
    }

    async fn write_job(&self, job: &Job, expected_version: u64) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET state = ?, scheduled_at = ?, attempt = ?, last_error = ?,
                locked_by = ?, locked_until = ?, finished_at = ?, cancel_requested = ?,
                version = ?
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(job.state.as_str())
        .bind(job.scheduled_at.map(millis))
        .bind(job.attempt as i64)
        .bind(&job.last_error)
        .bind(job.locked_by.as_ref().map(|w| w.as_str().to_string()))
        .bind(job.locked_until.map(millis))
        .bind(job.finished_at.map(millis))
        .bind(job.cancel_requested)
        .bind(job.version as i64)
        .bind(job.id.to_string())
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected() == 1)
    }
}

fn backend(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StorageError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StorageError::Serialization(format!("timestamp out of range: {}", ms)))
}

fn encode_args(args: &serde_json::Value) -> Result<String, StorageError> {
    serde_json::to_string(args).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn decode_args(raw: &str) -> Result<serde_json::Value, StorageError> {
    serde_json::from_str(raw).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, StorageError>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(name)
        .map_err(|e| StorageError::Serialization(format!("column {}: {}", name, e)))
}

fn job_from_row(row: &SqliteRow) -> Result<Job, StorageError> {
    let id: String = column(row, "id")?;
    let kind: String = column(row, "kind")?;
    let schedule_key: Option<String> = column(row, "schedule_key")?;
    let state: String = column(row, "state")?;
    let args: String = column(row, "args")?;

    let kind = match (kind.as_str(), schedule_key) {
        ("one_shot", _) => JobKind::OneShot,
        ("delayed", _) => JobKind::Delayed,
        ("recurring", Some(key)) => JobKind::Recurring {
            key: ScheduleKey::new(key),
        },
        (other, _) => {
            return Err(StorageError::Serialization(format!(
                "invalid job kind: {}",
                other
            )));
        }
    };

    Ok(Job {
        id: id
            .parse()
            .map_err(|e| StorageError::Serialization(format!("invalid job id: {}", e)))?,
        payload: Payload {
            handler: column(row, "handler")?,
            args: decode_args(&args)?,
        },
        kind,
        state: state.parse().map_err(StorageError::Serialization)?,
        created_at: from_millis(column(row, "created_at")?)?,
        scheduled_at: column::<Option<i64>>(row, "scheduled_at")?
            .map(from_millis)
            .transpose()?,
        attempt: column::<i64>(row, "attempt")? as u32,
        max_attempts: column::<i64>(row, "max_attempts")? as u32,
        last_error: column(row, "last_error")?,
        locked_by: column::<Option<String>>(row, "locked_by")?.map(WorkerId::new),
        locked_until: column::<Option<i64>>(row, "locked_until")?
            .map(from_millis)
            .transpose()?,
        finished_at: column::<Option<i64>>(row, "finished_at")?
            .map(from_millis)
            .transpose()?,
        cancel_requested: column(row, "cancel_requested")?,
        version: column::<i64>(row, "version")? as u64,
    })
}

fn schedule_from_row(row: &SqliteRow) -> Result<RecurringSchedule, StorageError> {
    let args: String = column(row, "args")?;
    let last_job_id = column::<Option<String>>(row, "last_job_id")?
        .map(|id| id.parse::<JobId>())
        .transpose()
        .map_err(|e| StorageError::Serialization(format!("invalid job id: {}", e)))?;

    Ok(RecurringSchedule {
        key: ScheduleKey::new(column::<String>(row, "key")?),
        cron: column(row, "cron")?,
        timezone: column(row, "timezone")?,
        payload: Payload {
            handler: column(row, "handler")?,
            args: decode_args(&args)?,
        },
        max_attempts: column::<i64>(row, "max_attempts")? as u32,
        next_fire_at: from_millis(column(row, "next_fire_at")?)?,
        last_job_id,
        created_at: from_millis(column(row, "created_at")?)?,
        updated_at: from_millis(column(row, "updated_at")?)?,
    })
}

async fn insert_job<'e, E>(executor: E, job: &Job) -> Result<(), StorageError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "INSERT INTO jobs ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        JOB_COLUMNS
    );
    let result = sqlx::query(&sql)
        .bind(job.id.to_string())
        .bind(&job.payload.handler)
        .bind(encode_args(&job.payload.args)?)
        .bind(job.kind.as_str())
        .bind(job.kind.schedule_key().map(|k| k.as_str().to_string()))
        .bind(job.state.as_str())
        .bind(millis(job.created_at))
        .bind(job.scheduled_at.map(millis))
        .bind(job.attempt as i64)
        .bind(job.max_attempts as i64)
        .bind(&job.last_error)
        .bind(job.locked_by.as_ref().map(|w| w.as_str().to_string()))
        .bind(job.locked_until.map(millis))
        .bind(job.finished_at.map(millis))
        .bind(job.cancel_requested)
        .bind(job.version as i64)
        .execute(executor)
        .await;

    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
            Err(StorageError::DuplicateKey(format!("job: {}", job.id)))
        }
        Err(e) => Err(backend(e)),
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn enqueue(&self, job: Job) -> Result<JobId, StorageError> {
        insert_job(&self.pool, &job).await?;
        Ok(job.id)
    }

    async fn get_job(&self, id: &JobId) -> Result<Job, StorageError> {
        let sql = format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .ok_or_else(|| StorageError::NotFound(format!("job: {}", id)))?;
        job_from_row(&row)
    }

    async fn fetch_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, StorageError> {
        let sql = format!(
            r#"
            SELECT {} FROM jobs
            WHERE state IN ('enqueued', 'scheduled', 'awaiting_retry')
              AND (scheduled_at IS NULL OR scheduled_at <= ?)
              AND (locked_until IS NULL OR locked_until <= ?)
            ORDER BY COALESCE(scheduled_at, created_at)
            LIMIT ?
            "#,
            JOB_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(millis(now))
            .bind(millis(now))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(job_from_row).collect()
    }

    async fn try_lock(
        &self,
        id: &JobId,
        owner: &WorkerId,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET state = 'processing', locked_by = ?, locked_until = ?,
                version = version + 1
            WHERE id = ?
              AND (locked_until IS NULL OR locked_until <= ?)
              AND (
                (state IN ('enqueued', 'scheduled', 'awaiting_retry')
                  AND (scheduled_at IS NULL OR scheduled_at <= ?))
                OR (state = 'processing' AND cancel_requested = 0)
              )
            "#,
        )
        .bind(owner.as_str())
        .bind(millis(saturating_offset(now, lease)))
        .bind(id.to_string())
        .bind(millis(now))
        .bind(millis(now))
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if self.job_exists(id).await? {
            Ok(false)
        } else {
            Err(StorageError::NotFound(format!("job: {}", id)))
        }
    }

    async fn renew_lease(
        &self,
        id: &JobId,
        owner: &WorkerId,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET locked_until = ?, version = version + 1
            WHERE id = ? AND state = 'processing' AND locked_by = ?
            "#,
        )
        .bind(millis(saturating_offset(now, lease)))
        .bind(id.to_string())
        .bind(owner.as_str())
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected() == 1)
    }

    async fn complete(
        &self,
        id: &JobId,
        owner: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<JobState, StorageError> {
        self.modify(id, |job| {
            ensure_held(job, owner)?;
            job.mark_succeeded(now);
            Ok(job.state)
        })
        .await
    }

    async fn fail(
        &self,
        id: &JobId,
        owner: &WorkerId,
        error: &str,
        disposition: FailureDisposition,
        now: DateTime<Utc>,
    ) -> Result<JobState, StorageError> {
        self.modify(id, |job| {
            ensure_held(job, owner)?;
            job.mark_attempt_failed(error, disposition.retry_at(), now);
            Ok(job.state)
        })
        .await
    }

    async fn unlock(
        &self,
        id: &JobId,
        owner: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<JobState, StorageError> {
        self.modify(id, |job| {
            ensure_held(job, owner)?;
            job.mark_released(now);
            Ok(job.state)
        })
        .await
    }

    async fn cancel(&self, id: &JobId, now: DateTime<Utc>) -> Result<JobState, StorageError> {
        self.modify(id, |job| {
            job.mark_cancelled(now);
            Ok(job.state)
        })
        .await
    }

    async fn reclaim_expired(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(JobId, JobState)>, StorageError> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM jobs WHERE state = 'processing' AND locked_until <= ?",
        )
        .bind(millis(now))
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        let mut reclaimed = Vec::new();
        for raw in ids {
            let id: JobId = raw
                .parse()
                .map_err(|e| StorageError::Serialization(format!("invalid job id: {}", e)))?;
            let released = self
                .modify(&id, |job| {
                    if job.state == JobState::Processing && !job.has_live_lease(now) {
                        job.mark_released(now);
                        Ok(Some(job.state))
                    } else {
                        Ok(None)
                    }
                })
                .await;
            match released {
                Ok(Some(state)) => reclaimed.push((id, state)),
                // purged or already handled by someone else
                Ok(None) | Err(StorageError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(reclaimed)
    }

    async fn purge_finished(&self, older_than: DateTime<Utc>) -> Result<usize, StorageError> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE state IN ('succeeded', 'failed', 'deleted') AND finished_at < ?
            "#,
        )
        .bind(millis(older_than))
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected() as usize)
    }

    async fn list_jobs(
        &self,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<Job>, StorageError> {
        let rows = match state {
            Some(state) => {
                let sql = format!(
                    "SELECT {} FROM jobs WHERE state = ? ORDER BY created_at DESC LIMIT ?",
                    JOB_COLUMNS
                );
                sqlx::query(&sql)
                    .bind(state.as_str())
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM jobs ORDER BY created_at DESC LIMIT ?",
                    JOB_COLUMNS
                );
                sqlx::query(&sql)
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(backend)?;
        rows.iter().map(job_from_row).collect()
    }

    async fn stats(&self) -> Result<JobStats, StorageError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM jobs GROUP BY state")
                .fetch_all(&self.pool)
                .await
                .map_err(backend)?;

        let mut stats = JobStats::default();
        for (state, count) in rows {
            let state: JobState = state.parse().map_err(StorageError::Serialization)?;
            stats.add(state, count as usize);
        }

        let recurring: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM recurring_schedules")
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        stats.recurring = recurring as usize;
        Ok(stats)
    }

    async fn upsert_schedule(
        &self,
        schedule: RecurringSchedule,
    ) -> Result<RecurringSchedule, StorageError> {
        let sql = format!(
            r#"
            INSERT INTO recurring_schedules ({})
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                cron = excluded.cron,
                timezone = excluded.timezone,
                handler = excluded.handler,
                args = excluded.args,
                max_attempts = excluded.max_attempts,
                next_fire_at = excluded.next_fire_at,
                updated_at = excluded.updated_at
            RETURNING {}
            "#,
            SCHEDULE_COLUMNS, SCHEDULE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(schedule.key.as_str())
            .bind(&schedule.cron)
            .bind(&schedule.timezone)
            .bind(&schedule.payload.handler)
            .bind(encode_args(&schedule.payload.args)?)
            .bind(schedule.max_attempts as i64)
            .bind(millis(schedule.next_fire_at))
            .bind(schedule.last_job_id.map(|id| id.to_string()))
            .bind(millis(schedule.created_at))
            .bind(millis(schedule.updated_at))
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        schedule_from_row(&row)
    }

    async fn get_schedule(&self, key: &ScheduleKey) -> Result<RecurringSchedule, StorageError> {
        let sql = format!(
            "SELECT {} FROM recurring_schedules WHERE key = ?",
            SCHEDULE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .ok_or_else(|| StorageError::NotFound(format!("schedule: {}", key)))?;
        schedule_from_row(&row)
    }

    async fn list_schedules(&self) -> Result<Vec<RecurringSchedule>, StorageError> {
        let sql = format!(
            "SELECT {} FROM recurring_schedules ORDER BY key",
            SCHEDULE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(schedule_from_row).collect()
    }

    async fn remove_schedule(&self, key: &ScheduleKey) -> Result<(), StorageError> {
        let result = sqlx::query("DELETE FROM recurring_schedules WHERE key = ?")
            .bind(key.as_str())
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("schedule: {}", key)));
        }
        Ok(())
    }

    async fn due_schedules(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<RecurringSchedule>, StorageError> {
        let sql = format!(
            "SELECT {} FROM recurring_schedules WHERE next_fire_at <= ? ORDER BY next_fire_at",
            SCHEDULE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(millis(now))
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(schedule_from_row).collect()
    }

    async fn fire_schedule(
        &self,
        key: &ScheduleKey,
        expected_fire_at: DateTime<Utc>,
        next_fire_at: DateTime<Utc>,
        job: Job,
    ) -> Result<FireOutcome, StorageError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        // claiming the fire first takes the write lock for the transaction
        let advanced = sqlx::query(
            "UPDATE recurring_schedules SET next_fire_at = ? WHERE key = ? AND next_fire_at = ?",
        )
        .bind(millis(next_fire_at))
        .bind(key.as_str())
        .bind(millis(expected_fire_at))
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        if advanced.rows_affected() == 0 {
            let exists: Option<i64> =
                sqlx::query_scalar("SELECT 1 FROM recurring_schedules WHERE key = ?")
                    .bind(key.as_str())
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(backend)?;
            tx.rollback().await.map_err(backend)?;
            return Err(match exists {
                Some(_) => StorageError::Conflict(format!(
                    "schedule {} already fired for {}",
                    key, expected_fire_at
                )),
                None => StorageError::NotFound(format!("schedule: {}", key)),
            });
        }

        let live_sql = format!(
            "SELECT COUNT(*) FROM jobs WHERE schedule_key = ? AND state IN {}",
            LIVE_STATES
        );
        let live: i64 = sqlx::query_scalar(&live_sql)
            .bind(key.as_str())
            .fetch_one(&mut *tx)
            .await
            .map_err(backend)?;

        if live > 0 {
            tx.commit().await.map_err(backend)?;
            return Ok(FireOutcome::Suppressed);
        }

        insert_job(&mut *tx, &job).await?;
        sqlx::query("UPDATE recurring_schedules SET last_job_id = ? WHERE key = ?")
            .bind(job.id.to_string())
            .bind(key.as_str())
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        tx.commit().await.map_err(backend)?;

        Ok(FireOutcome::Spawned(job.id))
    }
}
