//! Dispatcher engine.
//!
//! The dispatcher owns a pool of worker tasks that claim due jobs from the
//! store and a coordinator task that takes commands from a
//! [`DispatcherHandle`] and, on every tick, fires due recurring schedules,
//! reclaims expired leases and purges old finished jobs.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::handle::{COMMAND_CHANNEL_BUFFER, DispatcherHandle};
use super::types::{
    DispatcherCommand, DispatcherConfig, DispatcherError, DispatcherState, MaintenanceReport,
};
use super::worker::run_worker;
use crate::core::clock::{Clock, SystemClock};
use crate::core::handler::HandlerRegistry;
use crate::core::job::chrono_duration;
use crate::core::retry::RetryPolicy;
use crate::core::schedule::next_fire_after;
use crate::core::types::WorkerId;
use crate::events::{Event, EventBus};
use crate::storage::{FireOutcome, JobStore, StorageError};

/// State shared by the coordinator and every worker.
pub(crate) struct Shared<S: JobStore> {
    pub(crate) store: Arc<S>,
    pub(crate) registry: HandlerRegistry,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) event_bus: Arc<EventBus>,
    pub(crate) retry_policy: RetryPolicy,
    pub(crate) config: DispatcherConfig,
}

/// Worker pool and recurring pump over a [`JobStore`].
pub struct Dispatcher<S: JobStore> {
    shared: Shared<S>,
    /// How often the coordinator runs maintenance.
    tick_interval: Duration,
}

impl<S: JobStore + 'static> Dispatcher<S> {
    /// Create a dispatcher over a shared store.
    pub fn new(store: Arc<S>, registry: HandlerRegistry) -> Self {
        Self {
            shared: Shared {
                store,
                registry,
                clock: Arc::new(SystemClock),
                event_bus: Arc::new(EventBus::new()),
                retry_policy: RetryPolicy::default(),
                config: DispatcherConfig::default(),
            },
            tick_interval: Duration::from_secs(1),
        }
    }

    /// Set the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.shared.clock = clock;
        self
    }

    /// Set the event bus. The bus is usually shared with a `JobClient`.
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.shared.event_bus = event_bus;
        self
    }

    /// Set the retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.shared.retry_policy = policy;
        self
    }

    /// Set the worker pool configuration.
    pub fn with_config(mut self, config: DispatcherConfig) -> Self {
        self.shared.config = config;
        self
    }

    /// Set the number of workers. Zero workers leaves only the coordinator,
    /// which still fires schedules and reclaims leases.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.shared.config.workers = workers;
        self
    }

    /// Set the maintenance tick interval.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Get the configuration.
    pub fn config(&self) -> &DispatcherConfig {
        &self.shared.config
    }

    /// Get the event bus.
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.shared.event_bus
    }

    /// Start the workers and the coordinator and return a handle for
    /// controlling them.
    pub fn start(self) -> (DispatcherHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let (state_tx, state_rx) = watch::channel(DispatcherState::Running);

        let handle = DispatcherHandle {
            command_tx,
            state: state_rx.clone(),
        };

        let shared = Arc::new(self.shared);
        let workers = (1..=shared.config.workers)
            .map(|n| {
                let worker = WorkerId::new(format!("{}-{}", shared.config.name, n));
                tokio::spawn(run_worker(Arc::clone(&shared), worker, state_rx.clone()))
            })
            .collect();

        tracing::info!(
            name = %shared.config.name,
            workers = shared.config.workers,
            handlers = shared.registry.len(),
            "Dispatcher started"
        );

        let coordinator = Coordinator {
            shared,
            workers,
            tick_interval: self.tick_interval,
        };
        let task = tokio::spawn(async move {
            coordinator.run(command_rx, state_tx).await;
        });

        (handle, task)
    }
}

struct Coordinator<S: JobStore> {
    shared: Arc<Shared<S>>,
    workers: Vec<JoinHandle<()>>,
    tick_interval: Duration,
}

impl<S: JobStore + 'static> Coordinator<S> {
    /// Main coordinator loop.
    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<DispatcherCommand>,
        state: watch::Sender<DispatcherState>,
    ) {
        let start = tokio::time::Instant::now() + self.tick_interval;
        let mut interval = tokio::time::interval_at(start, self.tick_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let current = *state.borrow();
                    match self.maintain(current).await {
                        Ok(report) if report != MaintenanceReport::default() => {
                            tracing::debug!(?report, "Maintenance pass finished");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(error = %e, "Maintenance pass failed");
                        }
                    }
                }

                Some(command) = command_rx.recv() => {
                    match command {
                        DispatcherCommand::Pause { response } => {
                            state.send_replace(DispatcherState::Paused);
                            tracing::info!("Dispatcher paused");
                            let _ = response.send(());
                        }
                        DispatcherCommand::Resume { response } => {
                            state.send_replace(DispatcherState::Running);
                            tracing::info!("Dispatcher resumed");
                            let _ = response.send(());
                        }
                        DispatcherCommand::Maintain { response } => {
                            let current = *state.borrow();
                            let _ = response.send(self.maintain(current).await);
                        }
                        DispatcherCommand::Shutdown { response } => {
                            state.send_replace(DispatcherState::Stopped);
                            self.await_workers().await;
                            tracing::info!("Dispatcher stopped");
                            let _ = response.send(());
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Reclaim expired leases, fire due schedules unless paused, and purge
    /// finished jobs past retention.
    async fn maintain(&self, state: DispatcherState) -> Result<MaintenanceReport, DispatcherError> {
        let now = self.shared.clock.now();
        let mut report = MaintenanceReport::default();

        for (job_id, job_state) in self.shared.store.reclaim_expired(now).await? {
            self.shared
                .event_bus
                .emit(Event::lease_reclaimed(job_id, job_state))
                .await;
            report.reclaimed += 1;
        }

        if state == DispatcherState::Running {
            self.fire_due_schedules(now, &mut report).await?;
        }

        if let Some(cutoff) = now.checked_sub_signed(chrono_duration(self.shared.config.retention))
        {
            report.purged = self.shared.store.purge_finished(cutoff).await?;
            if report.purged > 0 {
                tracing::info!(count = report.purged, "Purged finished jobs");
            }
        }

        Ok(report)
    }

    /// Fire every due recurring schedule once, skipping missed occurrences.
    async fn fire_due_schedules(
        &self,
        now: DateTime<Utc>,
        report: &mut MaintenanceReport,
    ) -> Result<(), DispatcherError> {
        for schedule in self.shared.store.due_schedules(now).await? {
            let next_fire_at = match next_fire_after(&schedule.cron, &schedule.timezone, now) {
                Ok(next) => next,
                Err(e) => {
                    tracing::warn!(key = %schedule.key, cron = %schedule.cron, error = %e, "Cannot compute next fire time");
                    continue;
                }
            };

            let outcome = self
                .shared
                .store
                .fire_schedule(
                    &schedule.key,
                    schedule.next_fire_at,
                    next_fire_at,
                    schedule.spawn_job(now),
                )
                .await;

            match outcome {
                Ok(FireOutcome::Spawned(job_id)) => {
                    self.shared
                        .event_bus
                        .emit(Event::recurring_fired(schedule.key.clone(), job_id))
                        .await;
                    report.fired += 1;
                }
                Ok(FireOutcome::Suppressed) => {
                    self.shared
                        .event_bus
                        .emit(Event::recurring_suppressed(schedule.key.clone()))
                        .await;
                    report.suppressed += 1;
                }
                Err(StorageError::Conflict(_) | StorageError::NotFound(_)) => {
                    tracing::debug!(key = %schedule.key, "Schedule changed concurrently, fire skipped");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    /// Wait for workers to finish their in-flight jobs, up to the shutdown
    /// timeout. Workers still busy after that are aborted and their leases
    /// left to expire.
    async fn await_workers(&mut self) {
        self.workers.retain(|handle| !handle.is_finished());
        if self.workers.is_empty() {
            tracing::info!("No running workers to wait for during shutdown");
            return;
        }

        let shutdown_timeout = self.shared.config.shutdown_timeout;
        tracing::info!(
            "Graceful shutdown: waiting for {} worker(s) to finish (timeout: {:?})",
            self.workers.len(),
            shutdown_timeout
        );

        let start = tokio::time::Instant::now();
        // No deadline when the timeout is past the clock's range.
        let deadline = start.checked_add(shutdown_timeout);

        loop {
            self.workers.retain(|handle| !handle.is_finished());
            let remaining = self.workers.len();

            if remaining == 0 {
                tracing::info!("All workers finished gracefully in {:?}", start.elapsed());
                break;
            }

            if deadline.is_some_and(|deadline| tokio::time::Instant::now() >= deadline) {
                tracing::warn!(
                    "Graceful shutdown timeout ({:?}) exceeded with {} worker(s) still busy",
                    shutdown_timeout,
                    remaining
                );
                for handle in self.workers.drain(..) {
                    handle.abort();
                }
                break;
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}
