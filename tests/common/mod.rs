//! Common test utilities shared across integration tests.

use std::sync::Arc;
use std::time::Duration;
use tardy::{
    Dispatcher, DispatcherConfig, EventBus, HandlerRegistry, JobClient, JobStore, RetryPolicy,
};

/// Upper bound on how long a test waits for a job to settle.
pub const WAIT: Duration = Duration::from_secs(10);

/// Dispatcher settings tuned for tests: short polls, everything else default.
pub fn fast_config(workers: usize) -> DispatcherConfig {
    DispatcherConfig {
        workers,
        poll_interval: Duration::from_millis(10),
        shutdown_timeout: Duration::from_secs(5),
        ..DispatcherConfig::default()
    }
}

/// A dispatcher and a client over the same store and event bus, retrying
/// immediately.
pub fn engine<S: JobStore + 'static>(
    store: Arc<S>,
    registry: HandlerRegistry,
    workers: usize,
) -> (Dispatcher<S>, JobClient<S>) {
    let event_bus = Arc::new(EventBus::new());
    let dispatcher = Dispatcher::new(Arc::clone(&store), registry)
        .with_config(fast_config(workers))
        .with_retry_policy(RetryPolicy::immediate())
        .with_event_bus(Arc::clone(&event_bus));
    let client = JobClient::new(store).with_event_bus(event_bus);
    (dispatcher, client)
}
