//! Worker tasks: claim due jobs and run their handlers.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;

use super::engine::Shared;
use super::types::DispatcherState;
use crate::core::handler::{ExecutionFailure, HandlerOutcome, JobContext};
use crate::core::job::{Job, JobState};
use crate::core::retry::RetryDecision;
use crate::core::types::WorkerId;
use crate::events::Event;
use crate::storage::{FailureDisposition, JobStore, StorageError};

/// Poll loop of one worker. Returns once the dispatcher stops.
pub(crate) async fn run_worker<S: JobStore + 'static>(
    shared: Arc<Shared<S>>,
    worker: WorkerId,
    mut state: watch::Receiver<DispatcherState>,
) {
    tracing::debug!(worker = %worker, "Worker started");

    loop {
        let current = *state.borrow_and_update();
        match current {
            DispatcherState::Stopped => break,
            DispatcherState::Paused => {
                if state.changed().await.is_err() {
                    break;
                }
                continue;
            }
            DispatcherState::Running => {}
        }

        match claim_next(&shared, &worker).await {
            Ok(Some(job)) => {
                execute(&shared, &worker, job).await;
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(worker = %worker, error = %e, "Failed to claim job");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(shared.config.poll_interval) => {}
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    tracing::debug!(worker = %worker, "Worker stopped");
}

/// Lock the first due candidate that nobody else got to.
///
/// The job is re-read after locking so the attempt counter reflects any
/// transition that happened between the fetch and the lock.
async fn claim_next<S: JobStore>(
    shared: &Shared<S>,
    worker: &WorkerId,
) -> Result<Option<Job>, StorageError> {
    let now = shared.clock.now();
    let candidates = shared
        .store
        .fetch_due(now, shared.config.fetch_batch)
        .await?;

    for candidate in candidates {
        match shared
            .store
            .try_lock(&candidate.id, worker, shared.config.lease_duration, now)
            .await
        {
            Ok(true) => return shared.store.get_job(&candidate.id).await.map(Some),
            Ok(false) | Err(StorageError::NotFound(_)) => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(None)
}

/// Run one claimed job and record its outcome.
async fn execute<S: JobStore + 'static>(shared: &Shared<S>, worker: &WorkerId, job: Job) {
    let started = Instant::now();
    shared
        .event_bus
        .emit(Event::job_started(job.id, worker.clone(), job.attempt))
        .await;

    let result = run_handler(shared, worker, &job).await;
    let now = shared.clock.now();

    match result {
        Ok(()) => match shared.store.complete(&job.id, worker, now).await {
            Ok(JobState::Deleted) => {
                tracing::debug!(job_id = %job.id, "Job finished after cancellation, result discarded");
                shared.event_bus.emit(Event::job_deleted(job.id)).await;
            }
            Ok(_) => {
                let duration = started.elapsed();
                shared
                    .event_bus
                    .emit(Event::job_succeeded(job.id, job.attempt, duration))
                    .await;
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, worker = %worker, error = %e, "Failed to record job success");
            }
        },
        Err(failure) => record_failure(shared, worker, &job, failure).await,
    }
}

async fn record_failure<S: JobStore>(
    shared: &Shared<S>,
    worker: &WorkerId,
    job: &Job,
    failure: ExecutionFailure,
) {
    let now = shared.clock.now();
    let disposition = if failure.is_retryable() {
        match shared.retry_policy.decide(job, now) {
            RetryDecision::Retry { next_at } => FailureDisposition::Retry { next_at },
            RetryDecision::Exhausted => FailureDisposition::Terminal,
        }
    } else {
        FailureDisposition::Terminal
    };
    let error = failure.to_string();

    match shared
        .store
        .fail(&job.id, worker, &error, disposition, now)
        .await
    {
        Ok(JobState::AwaitingRetry) => {
            let next_at = disposition.retry_at().unwrap_or(now);
            shared
                .event_bus
                .emit(Event::job_retry_scheduled(
                    job.id,
                    job.attempt,
                    job.max_attempts,
                    next_at,
                    error,
                ))
                .await;
        }
        Ok(JobState::Deleted) => {
            tracing::debug!(job_id = %job.id, "Job failed after cancellation, result discarded");
            shared.event_bus.emit(Event::job_deleted(job.id)).await;
        }
        Ok(_) => {
            let exhausted = job.attempt >= job.max_attempts;
            shared
                .event_bus
                .emit(Event::job_failed(job.id, job.attempt, error, exhausted))
                .await;
        }
        Err(e) => {
            tracing::warn!(job_id = %job.id, worker = %worker, error = %e, "Failed to record job failure");
        }
    }
}

/// Invoke the handler in its own task, bounded by the handler timeout,
/// renewing the lease while it runs.
async fn run_handler<S: JobStore + 'static>(
    shared: &Shared<S>,
    worker: &WorkerId,
    job: &Job,
) -> Result<(), ExecutionFailure> {
    let Some(handler) = shared.registry.get(&job.payload.handler) else {
        return Err(ExecutionFailure::UnknownHandler(job.payload.handler.clone()));
    };

    let ctx = JobContext::for_job(job);
    let mut task = tokio::spawn(async move { handler.handle(ctx).await });

    let timeout = shared.config.handler_timeout;
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let mut renew = tokio::time::interval(shared.config.renew_interval());
    // The first tick completes immediately; the lease is fresh.
    renew.tick().await;

    loop {
        tokio::select! {
            joined = &mut task => {
                return match joined {
                    Ok(HandlerOutcome::Success) => Ok(()),
                    Ok(HandlerOutcome::Retryable(error)) => Err(ExecutionFailure::Handler(error)),
                    Ok(HandlerOutcome::Fatal(error)) => Err(ExecutionFailure::Fatal(error)),
                    Err(e) => {
                        tracing::warn!(job_id = %job.id, error = %e, "Handler task aborted");
                        Err(ExecutionFailure::Panicked)
                    }
                };
            }
            _ = &mut deadline => {
                task.abort();
                return Err(ExecutionFailure::Timeout(timeout));
            }
            _ = renew.tick() => {
                let now = shared.clock.now();
                match shared
                    .store
                    .renew_lease(&job.id, worker, shared.config.lease_duration, now)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!(job_id = %job.id, worker = %worker, "Lease lost while handler was running");
                    }
                    Err(e) => {
                        tracing::warn!(job_id = %job.id, error = %e, "Failed to renew lease");
                    }
                }
            }
        }
    }
}
