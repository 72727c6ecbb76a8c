//! Demo services.
//!
//! Two example workloads exercised through the HTTP API: a notification
//! sender and a data-cleanup routine over an in-memory record set. Both log
//! their simulated work and can be told to fail through a
//! [`FailureInjector`] to show retries in action.

mod cleanup;
mod notification;

pub use cleanup::{CleanupReport, DataCleanupHandler, DataCleanupService, DataRecord, DataStatistics};
pub use notification::{NotificationArgs, NotificationHandler};

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::core::clock::Clock;
use crate::core::handler::{HandlerRegistry, JobContext};

/// Handler name of the plain notification job.
pub const NOTIFICATION: &str = "notification";
/// Handler name of the notification job that fails its first attempts.
pub const NOTIFICATION_WITH_FAILURE: &str = "notification-with-failure";
/// Handler name of the data-cleanup job.
pub const DATA_CLEANUP: &str = "data-cleanup";
/// Handler name of the data-cleanup job that fails at random.
pub const DATA_CLEANUP_WITH_FAILURE: &str = "data-cleanup-with-failure";

/// Key of the daily notification schedule.
pub const DAILY_NOTIFICATION_KEY: &str = "daily-notification";
/// Key of the hourly data-cleanup schedule.
pub const HOURLY_CLEANUP_KEY: &str = "hourly-data-cleanup";

/// Longest accepted retention window of the cleanup demo.
pub const MAX_RETENTION_DAYS: i64 = 36_500;

/// Decides whether an attempt should fail on purpose.
pub trait FailureInjector: Send + Sync {
    /// True when the attempt described by `ctx` should fail.
    fn should_fail(&self, ctx: &JobContext) -> bool;
}

/// Never fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverFail;

impl FailureInjector for NeverFail {
    fn should_fail(&self, _ctx: &JobContext) -> bool {
        false
    }
}

/// Fails every attempt up to and including attempt `k`.
#[derive(Debug, Clone, Copy)]
pub struct FailFirstAttempts(pub u32);

impl FailureInjector for FailFirstAttempts {
    fn should_fail(&self, ctx: &JobContext) -> bool {
        ctx.attempt <= self.0
    }
}

/// Fails each attempt with probability `p`.
#[derive(Debug, Clone, Copy)]
pub struct RandomFailure(f64);

impl RandomFailure {
    /// Create an injector; `probability` is clamped to `0.0..=1.0`.
    pub fn new(probability: f64) -> Self {
        Self(probability.clamp(0.0, 1.0))
    }

    pub fn probability(&self) -> f64 {
        self.0
    }
}

impl FailureInjector for RandomFailure {
    fn should_fail(&self, _ctx: &JobContext) -> bool {
        rand::rng().random_bool(self.0)
    }
}

/// Demo workload settings (`demo` section of the configuration).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    /// Register the demo handlers and routes.
    pub enabled: bool,
    /// Simulated work per notification, in milliseconds.
    pub notification_delay_ms: u64,
    /// Attempts the failing notification demo fails before succeeding.
    pub notification_failures: u32,
    /// Size of the sample record set.
    pub sample_records: usize,
    /// Records older than this many days are cleaned up.
    pub retention_days: i64,
    /// Simulated work per deleted record, in milliseconds.
    pub record_delay_ms: u64,
    /// Failure probability of the failing cleanup demo.
    pub failure_probability: f64,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            notification_delay_ms: 500,
            notification_failures: 2,
            sample_records: 50,
            retention_days: 30,
            record_delay_ms: 50,
            failure_probability: 2.0 / 3.0,
        }
    }
}

/// Register the four demo handlers.
pub fn register_demo_handlers(
    registry: &mut HandlerRegistry,
    cleanup: Arc<DataCleanupService>,
    config: &DemoConfig,
    clock: Arc<dyn Clock>,
) {
    let delay = Duration::from_millis(config.notification_delay_ms);

    registry.register(
        NOTIFICATION,
        Arc::new(NotificationHandler::new(Arc::new(NeverFail)).with_delay(delay)),
    );
    registry.register(
        NOTIFICATION_WITH_FAILURE,
        Arc::new(
            NotificationHandler::new(Arc::new(FailFirstAttempts(config.notification_failures)))
                .with_delay(delay),
        ),
    );
    registry.register(
        DATA_CLEANUP,
        Arc::new(
            DataCleanupHandler::new(Arc::clone(&cleanup), Arc::new(NeverFail))
                .with_clock(Arc::clone(&clock)),
        ),
    );
    registry.register(
        DATA_CLEANUP_WITH_FAILURE,
        Arc::new(
            DataCleanupHandler::new(
                cleanup,
                Arc::new(RandomFailure::new(config.failure_probability)),
            )
            .with_clock(clock),
        ),
    );
}
