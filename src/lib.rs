//! tardy - a small durable background-job engine.
//!
//! Jobs are persisted through a [`JobStore`] and executed by a pool of
//! workers owned by a [`Dispatcher`]. Producers go through a [`JobClient`]
//! to enqueue fire-and-forget, delayed and recurring (cron) jobs. Failed
//! attempts are retried with exponential backoff until their attempt limit
//! is reached.

pub mod api;
pub mod client;
pub mod config;
pub mod core;
pub mod demo;
pub mod dispatcher;
pub mod events;
pub mod storage;
pub mod testing;

pub use client::{ClientError, EnqueueOptions, JobClient};
pub use config::{ConfigError, GlobalConfig, StorageConfig, YamlLoader};
pub use core::clock::{Clock, ManualClock, SystemClock};
pub use core::handler::{
    ExecutionFailure, HandlerOutcome, HandlerRegistry, JobContext, JobHandler,
};
pub use core::job::{
    Job, JobKind, JobSnapshot, JobState, JobStats, Payload, RecurringSchedule,
};
pub use core::retry::{RetryDecision, RetryPolicy};
pub use core::schedule::{CronExpr, ScheduleError, next_fire_after};
pub use core::types::{JobId, ScheduleKey, WorkerId};
pub use dispatcher::{
    Dispatcher, DispatcherConfig, DispatcherError, DispatcherHandle, DispatcherState,
    MaintenanceReport,
};
pub use events::{Event, EventBus, EventHandler};
pub use storage::{FailureDisposition, FireOutcome, InMemoryStore, JobStore, StorageError};
#[cfg(feature = "sqlite")]
pub use storage::SqliteStore;
