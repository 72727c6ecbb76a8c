//! Data-cleanup demo service and handler.
//!
//! The service owns a sample record set that stands in for a database table.
//! A cleanup run soft-deletes records older than the retention window and
//! reports what it did.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{DemoConfig, FailureInjector, MAX_RETENTION_DAYS};
use crate::core::clock::{Clock, SystemClock};
use crate::core::handler::{HandlerOutcome, JobContext, JobHandler};

/// One row of the sample data set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataRecord {
    pub id: u32,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub deleted: bool,
}

/// Outcome of one cleanup run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CleanupReport {
    /// Sequence number of this run.
    pub execution: u32,
    pub cutoff: DateTime<Utc>,
    pub total_before: usize,
    pub old_records: usize,
    pub deleted: usize,
    pub remaining: usize,
    /// Share of records deleted by this run, in percent.
    pub reduction_pct: f64,
}

/// Current shape of the data set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataStatistics {
    pub total: usize,
    pub active: usize,
    pub deleted: usize,
    pub old_records: usize,
    /// Sequence number of the last cleanup run, if any.
    pub last_cleanup: Option<u32>,
}

#[derive(Debug, Default)]
struct CleanupState {
    records: Vec<DataRecord>,
    executions: u32,
}

/// Owns the sample data set. Shared by the cleanup handlers and the
/// statistics endpoint.
#[derive(Debug)]
pub struct DataCleanupService {
    state: Mutex<CleanupState>,
    sample_records: usize,
    retention: ChronoDuration,
    record_delay: Duration,
}

impl DataCleanupService {
    pub fn new(config: &DemoConfig) -> Self {
        Self {
            state: Mutex::new(CleanupState::default()),
            sample_records: config.sample_records,
            retention: ChronoDuration::days(config.retention_days.clamp(0, MAX_RETENTION_DAYS)),
            record_delay: Duration::from_millis(config.record_delay_ms),
        }
    }

    /// Create a service over a fixed record set.
    pub fn with_records(config: &DemoConfig, records: Vec<DataRecord>) -> Self {
        let service = Self::new(config);
        service.lock().records = records;
        service
    }

    /// Simulated work per deleted record.
    pub fn record_delay(&self) -> Duration {
        self.record_delay
    }

    /// Soft-delete every record older than the retention window.
    pub fn cleanup(&self, now: DateTime<Utc>) -> CleanupReport {
        let cutoff = now - self.retention;
        let mut state = self.lock();
        self.ensure_sample(&mut state, now);

        state.executions += 1;
        let execution = state.executions;
        let total_before = state.records.len();

        let mut deleted = 0;
        for record in state
            .records
            .iter_mut()
            .filter(|r| !r.deleted && r.created_at < cutoff)
        {
            record.deleted = true;
            deleted += 1;
        }
        let remaining = state.records.iter().filter(|r| !r.deleted).count();

        let reduction_pct = if total_before == 0 {
            0.0
        } else {
            deleted as f64 / total_before as f64 * 100.0
        };

        CleanupReport {
            execution,
            cutoff,
            total_before,
            old_records: deleted,
            deleted,
            remaining,
            reduction_pct,
        }
    }

    /// Counts over the data set, seeding it first if needed.
    pub fn statistics(&self, now: DateTime<Utc>) -> DataStatistics {
        let cutoff = now - self.retention;
        let mut state = self.lock();
        self.ensure_sample(&mut state, now);

        let deleted = state.records.iter().filter(|r| r.deleted).count();
        DataStatistics {
            total: state.records.len(),
            active: state.records.len() - deleted,
            deleted,
            old_records: state
                .records
                .iter()
                .filter(|r| !r.deleted && r.created_at < cutoff)
                .count(),
            last_cleanup: (state.executions > 0).then_some(state.executions),
        }
    }

    fn ensure_sample(&self, state: &mut CleanupState, now: DateTime<Utc>) {
        if !state.records.is_empty() {
            return;
        }

        let mut rng = rand::rng();
        state.records = (1..=self.sample_records as u32)
            .map(|id| DataRecord {
                id,
                name: format!("record_{}", id),
                created_at: now - ChronoDuration::days(rng.random_range(1..90)),
                deleted: false,
            })
            .collect();
        tracing::info!(count = state.records.len(), "Sample data initialized");
    }

    fn lock(&self) -> MutexGuard<'_, CleanupState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Runs [`DataCleanupService::cleanup`] as a job.
pub struct DataCleanupHandler {
    service: Arc<DataCleanupService>,
    injector: Arc<dyn FailureInjector>,
    clock: Arc<dyn Clock>,
}

impl DataCleanupHandler {
    pub fn new(service: Arc<DataCleanupService>, injector: Arc<dyn FailureInjector>) -> Self {
        Self {
            service,
            injector,
            clock: Arc::new(SystemClock),
        }
    }

    /// Builder: set the clock used to compute the retention cutoff.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

#[async_trait]
impl JobHandler for DataCleanupHandler {
    async fn handle(&self, ctx: JobContext) -> HandlerOutcome {
        if self.injector.should_fail(&ctx) {
            tracing::warn!(
                job_id = %ctx.job_id,
                attempt = ctx.attempt,
                "Simulated failure: database connection lost during cleanup"
            );
            return HandlerOutcome::retry(
                "simulated failure: database connection lost during cleanup",
            );
        }

        let report = self.service.cleanup(self.clock.now());
        let work = self
            .service
            .record_delay()
            .saturating_mul(report.deleted as u32);
        tokio::time::sleep(work).await;

        tracing::info!(
            job_id = %ctx.job_id,
            execution = report.execution,
            cutoff = %report.cutoff.format("%Y-%m-%d"),
            total_before = report.total_before,
            deleted = report.deleted,
            remaining = report.remaining,
            freed_kb = report.deleted * 1024,
            reduction_pct = %format!("{:.1}", report.reduction_pct),
            "Data cleanup finished"
        );
        HandlerOutcome::Success
    }
}
