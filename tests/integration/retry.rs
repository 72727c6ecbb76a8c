//! Retry integration tests.
//!
//! These tests verify that failed attempts are retried until they succeed or
//! run out of attempts, and that the outcome is visible through the client.

use std::sync::Arc;
use std::time::Duration;

use tardy::testing::{
    FailingHandler, FlakyHandler, RecordingEventHandler, SlowHandler, wait_for_terminal,
};
use tardy::{
    DispatcherConfig, EnqueueOptions, Event, HandlerRegistry, InMemoryStore, JobState, Payload,
};

use crate::common::{WAIT, engine, fast_config};

/// Test: A job failing its first two attempts succeeds on the third.
#[tokio::test]
async fn test_flaky_job_succeeds_on_third_attempt() {
    let store = Arc::new(InMemoryStore::new());
    let flaky = FlakyHandler::new(2);
    let registry = HandlerRegistry::new().with("flaky", flaky.clone());
    let (dispatcher, client) = engine(Arc::clone(&store), registry, 2);
    let (handle, task) = dispatcher.start();

    let id = client
        .enqueue_with(
            Payload::new("flaky"),
            EnqueueOptions::default().max_attempts(5),
        )
        .await
        .unwrap();

    let job = wait_for_terminal(store.as_ref(), &id, WAIT)
        .await
        .expect("job should finish");
    assert_eq!(job.state, JobState::Succeeded);
    assert_eq!(job.attempt, 3);
    assert_eq!(flaky.calls(), 3);

    let status = client.get_status(&id).await.unwrap();
    assert!(!status.exhausted);

    handle.shutdown().await.unwrap();
    let _ = task.await;
}

/// Test: An always-failing job stops after its attempt limit.
#[tokio::test]
async fn test_always_failing_job_is_exhausted() {
    let store = Arc::new(InMemoryStore::new());
    let failing = FailingHandler::retryable("upstream unavailable");
    let registry = HandlerRegistry::new().with("fail", failing.clone());
    let (dispatcher, client) = engine(Arc::clone(&store), registry, 2);
    let (handle, task) = dispatcher.start();

    let id = client
        .enqueue_with(
            Payload::new("fail"),
            EnqueueOptions::default().max_attempts(2),
        )
        .await
        .unwrap();

    wait_for_terminal(store.as_ref(), &id, WAIT)
        .await
        .expect("job should finish");

    let status = client.get_status(&id).await.unwrap();
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.attempt, 2);
    assert!(status.exhausted);
    assert_eq!(
        status.last_error.as_deref(),
        Some("upstream unavailable")
    );
    assert_eq!(failing.calls(), 2);

    handle.shutdown().await.unwrap();
    let _ = task.await;
}

/// Test: A fatal failure is not retried.
#[tokio::test]
async fn test_fatal_failure_is_not_retried() {
    let store = Arc::new(InMemoryStore::new());
    let failing = FailingHandler::fatal("malformed payload");
    let registry = HandlerRegistry::new().with("fatal", failing.clone());
    let (dispatcher, client) = engine(Arc::clone(&store), registry, 1);
    let (handle, task) = dispatcher.start();

    let id = client.enqueue_now(Payload::new("fatal")).await.unwrap();

    let job = wait_for_terminal(store.as_ref(), &id, WAIT)
        .await
        .expect("job should finish");
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempt, 1);
    assert!(job.last_error.unwrap().contains("malformed payload"));
    assert_eq!(failing.calls(), 1);
    assert!(!client.get_status(&id).await.unwrap().exhausted);

    handle.shutdown().await.unwrap();
    let _ = task.await;
}

/// Test: A handler exceeding the timeout is retried, then fails with a
/// timeout error.
#[tokio::test]
async fn test_timeout_is_retried_then_fails() {
    let store = Arc::new(InMemoryStore::new());
    let slow = SlowHandler::new(Duration::from_secs(30));
    let registry = HandlerRegistry::new().with("slow", slow.clone());
    let (dispatcher, client) = engine(Arc::clone(&store), registry, 1);
    let (handle, task) = dispatcher
        .with_config(DispatcherConfig {
            handler_timeout: Duration::from_millis(50),
            ..fast_config(1)
        })
        .start();

    let id = client
        .enqueue_with(
            Payload::new("slow"),
            EnqueueOptions::default().max_attempts(2),
        )
        .await
        .unwrap();

    let job = wait_for_terminal(store.as_ref(), &id, WAIT)
        .await
        .expect("job should finish");
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempt, 2);
    assert!(job.last_error.unwrap().contains("timed out"));
    assert_eq!(slow.calls(), 2);

    handle.shutdown().await.unwrap();
    let _ = task.await;
}

/// Test: Each failed attempt emits a retry event before the final outcome.
#[tokio::test]
async fn test_retry_events_are_emitted() {
    let store = Arc::new(InMemoryStore::new());
    let registry = HandlerRegistry::new().with("flaky", FlakyHandler::new(1));
    let (dispatcher, client) = engine(Arc::clone(&store), registry, 1);
    let recorder = RecordingEventHandler::new();
    dispatcher.event_bus().register(recorder.clone()).await;
    let (handle, task) = dispatcher.start();

    let id = client.enqueue_now(Payload::new("flaky")).await.unwrap();
    wait_for_terminal(store.as_ref(), &id, WAIT)
        .await
        .expect("job should finish");
    handle.shutdown().await.unwrap();
    let _ = task.await;

    let events = recorder.events().await;
    let retries: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            Event::JobRetryScheduled { failed_attempt, .. } => Some(*failed_attempt),
            _ => None,
        })
        .collect();
    assert_eq!(retries, vec![1]);
    assert!(events.iter().any(|e| matches!(
        e,
        Event::JobSucceeded { attempt: 2, .. }
    )));
    assert!(events.iter().any(|e| matches!(e, Event::JobEnqueued { .. })));
}
