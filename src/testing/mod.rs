//! Testing utilities for users of the Tardy library.
//!
//! This module provides scripted handlers and polling helpers for testing
//! code that enqueues and runs jobs:
//!
//! - [`CountingHandler`]: Succeeds and counts invocations
//! - [`FlakyHandler`]: Fails N times then succeeds
//! - [`FailingHandler`]: Always fails, retryable or fatal
//! - [`SlowHandler`]: Sleeps before succeeding
//! - [`OverlapDetector`]: Detects the same job running twice at once
//! - [`RecordingEventHandler`]: Captures lifecycle events
//! - [`wait_for_state`]: Polls a store until a job reaches a state

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::core::handler::{HandlerOutcome, JobContext, JobHandler};
use crate::core::job::Job;
use crate::core::job::JobState;
use crate::core::types::JobId;
use crate::events::{Event, EventHandler};
use crate::storage::JobStore;

/// A handler that always succeeds and counts how often it ran.
#[derive(Debug, Default)]
pub struct CountingHandler {
    calls: AtomicU32,
}

impl CountingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of invocations so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for CountingHandler {
    async fn handle(&self, _ctx: JobContext) -> HandlerOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        HandlerOutcome::Success
    }
}

/// A handler that fails a set number of times then succeeds.
///
/// # Example
///
/// ```
/// use tardy::testing::FlakyHandler;
///
/// // Fails twice, succeeds on the third call
/// let handler = FlakyHandler::new(2);
/// assert_eq!(handler.calls(), 0);
/// ```
#[derive(Debug)]
pub struct FlakyHandler {
    failures: u32,
    calls: AtomicU32,
}

impl FlakyHandler {
    /// Create a handler that fails its first `failures` invocations.
    pub fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicU32::new(0),
        })
    }

    /// Number of invocations so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for FlakyHandler {
    async fn handle(&self, ctx: JobContext) -> HandlerOutcome {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            HandlerOutcome::retry(format!(
                "simulated failure {} of {} (attempt {})",
                call, self.failures, ctx.attempt
            ))
        } else {
            HandlerOutcome::Success
        }
    }
}

/// A handler that fails on every invocation.
#[derive(Debug)]
pub struct FailingHandler {
    message: String,
    fatal: bool,
    calls: AtomicU32,
}

impl FailingHandler {
    /// Fail with a retryable error.
    pub fn retryable(message: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            message: message.into(),
            fatal: false,
            calls: AtomicU32::new(0),
        })
    }

    /// Fail with an error retries cannot fix.
    pub fn fatal(message: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            message: message.into(),
            fatal: true,
            calls: AtomicU32::new(0),
        })
    }

    /// Number of invocations so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for FailingHandler {
    async fn handle(&self, _ctx: JobContext) -> HandlerOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fatal {
            HandlerOutcome::Fatal(self.message.clone())
        } else {
            HandlerOutcome::Retryable(self.message.clone())
        }
    }
}

/// A handler that sleeps before succeeding.
#[derive(Debug)]
pub struct SlowHandler {
    delay: Duration,
    calls: AtomicU32,
}

impl SlowHandler {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            calls: AtomicU32::new(0),
        })
    }

    /// Number of invocations so far, finished or not.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for SlowHandler {
    async fn handle(&self, _ctx: JobContext) -> HandlerOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        HandlerOutcome::Success
    }
}

/// A handler that records whether any job id was ever running twice at the
/// same time.
#[derive(Debug)]
pub struct OverlapDetector {
    hold: Duration,
    running: Mutex<HashSet<JobId>>,
    overlaps: AtomicUsize,
    calls: AtomicUsize,
}

impl OverlapDetector {
    /// Create a detector that holds each job for `hold`.
    pub fn new(hold: Duration) -> Arc<Self> {
        Arc::new(Self {
            hold,
            running: Mutex::new(HashSet::new()),
            overlaps: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        })
    }

    /// Times a job started while another invocation of it was running.
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    /// Total invocations.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for OverlapDetector {
    async fn handle(&self, ctx: JobContext) -> HandlerOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let inserted = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(ctx.job_id);
        if !inserted {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }

        tokio::time::sleep(self.hold).await;

        if inserted {
            self.running
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&ctx.job_id);
        }
        HandlerOutcome::Success
    }
}

/// An event handler that keeps every event it receives.
#[derive(Debug, Default)]
pub struct RecordingEventHandler {
    events: tokio::sync::Mutex<Vec<Event>>,
}

impl RecordingEventHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// All events received so far, in order.
    pub async fn events(&self) -> Vec<Event> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl EventHandler for RecordingEventHandler {
    async fn handle(&self, event: &Event) {
        self.events.lock().await.push(event.clone());
    }
}

/// Poll `store` until job `id` is in `state`, or give up after `timeout`.
pub async fn wait_for_state<S: JobStore + ?Sized>(
    store: &S,
    id: &JobId,
    state: JobState,
    timeout: Duration,
) -> Option<Job> {
    wait_for(store, id, timeout, |job| job.state == state).await
}

/// Poll `store` until job `id` is terminal, or give up after `timeout`.
pub async fn wait_for_terminal<S: JobStore + ?Sized>(
    store: &S,
    id: &JobId,
    timeout: Duration,
) -> Option<Job> {
    wait_for(store, id, timeout, |job| job.state.is_terminal()).await
}

async fn wait_for<S: JobStore + ?Sized>(
    store: &S,
    id: &JobId,
    timeout: Duration,
    done: impl Fn(&Job) -> bool,
) -> Option<Job> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match store.get_job(id).await {
            Ok(job) if done(&job) => return Some(job),
            _ => {}
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
