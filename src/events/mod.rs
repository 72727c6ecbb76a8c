//! Lifecycle events and event handling.
//!
//! The dispatcher and the client emit an [`Event`] at every job transition so
//! that logging, metrics or tests can observe the engine without polling the
//! store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::core::job::JobState;
use crate::core::types::{JobId, ScheduleKey, WorkerId};

/// Lifecycle events emitted by the engine.
#[derive(Debug, Clone)]
pub enum Event {
    /// A job was persisted by the client.
    JobEnqueued {
        job_id: JobId,
        handler: String,
        scheduled_at: Option<DateTime<Utc>>,
        timestamp: Instant,
    },

    /// A worker claimed a job and is running its handler.
    JobStarted {
        job_id: JobId,
        worker: WorkerId,
        /// The attempt being made (1-indexed).
        attempt: u32,
        timestamp: Instant,
    },

    /// A job's handler succeeded.
    JobSucceeded {
        job_id: JobId,
        attempt: u32,
        duration: Duration,
        timestamp: Instant,
    },

    /// An attempt failed and another one is scheduled.
    JobRetryScheduled {
        job_id: JobId,
        /// The attempt number that just failed.
        failed_attempt: u32,
        max_attempts: u32,
        next_at: DateTime<Utc>,
        error: String,
        timestamp: Instant,
    },

    /// A job failed for good.
    JobFailed {
        job_id: JobId,
        attempt: u32,
        error: String,
        /// True when every attempt was used.
        exhausted: bool,
        timestamp: Instant,
    },

    /// A job was cancelled.
    JobDeleted { job_id: JobId, timestamp: Instant },

    /// A recurring schedule spawned a job.
    RecurringFired {
        key: ScheduleKey,
        job_id: JobId,
        timestamp: Instant,
    },

    /// A recurring fire was skipped because the previous instance is live.
    RecurringSuppressed { key: ScheduleKey, timestamp: Instant },

    /// An expired lease was released.
    LeaseReclaimed {
        job_id: JobId,
        state: JobState,
        timestamp: Instant,
    },
}

impl Event {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> Instant {
        match self {
            Event::JobEnqueued { timestamp, .. }
            | Event::JobStarted { timestamp, .. }
            | Event::JobSucceeded { timestamp, .. }
            | Event::JobRetryScheduled { timestamp, .. }
            | Event::JobFailed { timestamp, .. }
            | Event::JobDeleted { timestamp, .. }
            | Event::RecurringFired { timestamp, .. }
            | Event::RecurringSuppressed { timestamp, .. }
            | Event::LeaseReclaimed { timestamp, .. } => *timestamp,
        }
    }

    /// The job the event is about, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Event::JobEnqueued { job_id, .. }
            | Event::JobStarted { job_id, .. }
            | Event::JobSucceeded { job_id, .. }
            | Event::JobRetryScheduled { job_id, .. }
            | Event::JobFailed { job_id, .. }
            | Event::JobDeleted { job_id, .. }
            | Event::RecurringFired { job_id, .. }
            | Event::LeaseReclaimed { job_id, .. } => Some(*job_id),
            Event::RecurringSuppressed { .. } => None,
        }
    }

    pub fn job_enqueued(
        job_id: JobId,
        handler: impl Into<String>,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Self {
        Event::JobEnqueued {
            job_id,
            handler: handler.into(),
            scheduled_at,
            timestamp: Instant::now(),
        }
    }

    pub fn job_started(job_id: JobId, worker: WorkerId, attempt: u32) -> Self {
        Event::JobStarted {
            job_id,
            worker,
            attempt,
            timestamp: Instant::now(),
        }
    }

    pub fn job_succeeded(job_id: JobId, attempt: u32, duration: Duration) -> Self {
        Event::JobSucceeded {
            job_id,
            attempt,
            duration,
            timestamp: Instant::now(),
        }
    }

    pub fn job_retry_scheduled(
        job_id: JobId,
        failed_attempt: u32,
        max_attempts: u32,
        next_at: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Self {
        Event::JobRetryScheduled {
            job_id,
            failed_attempt,
            max_attempts,
            next_at,
            error: error.into(),
            timestamp: Instant::now(),
        }
    }

    pub fn job_failed(job_id: JobId, attempt: u32, error: impl Into<String>, exhausted: bool) -> Self {
        Event::JobFailed {
            job_id,
            attempt,
            error: error.into(),
            exhausted,
            timestamp: Instant::now(),
        }
    }

    pub fn job_deleted(job_id: JobId) -> Self {
        Event::JobDeleted {
            job_id,
            timestamp: Instant::now(),
        }
    }

    pub fn recurring_fired(key: ScheduleKey, job_id: JobId) -> Self {
        Event::RecurringFired {
            key,
            job_id,
            timestamp: Instant::now(),
        }
    }

    pub fn recurring_suppressed(key: ScheduleKey) -> Self {
        Event::RecurringSuppressed {
            key,
            timestamp: Instant::now(),
        }
    }

    pub fn lease_reclaimed(job_id: JobId, state: JobState) -> Self {
        Event::LeaseReclaimed {
            job_id,
            state,
            timestamp: Instant::now(),
        }
    }
}

/// Handler for receiving lifecycle events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, event: &Event);
}

/// Event bus for distributing events to registered handlers.
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    /// Create a new event bus with no handlers.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register an event handler.
    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.push(handler);
    }

    /// Emit an event to all registered handlers, in registration order.
    pub async fn emit(&self, event: Event) {
        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            handler.handle(&event).await;
        }
    }

    /// Get the number of registered handlers.
    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
