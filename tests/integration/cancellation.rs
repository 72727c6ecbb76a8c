//! Cancellation integration tests.
//!
//! These tests verify that cancelled jobs never run again, whether they were
//! waiting, scheduled for a retry or executing at the time.

use std::sync::Arc;
use std::time::Duration;

use tardy::testing::{CountingHandler, FailingHandler, SlowHandler, wait_for_state};
use tardy::{
    ClientError, EnqueueOptions, HandlerRegistry, InMemoryStore, JobId, JobState, Payload,
    RetryPolicy,
};

use crate::common::{WAIT, engine};

/// Test: A delayed job cancelled before its due time never runs.
#[tokio::test]
async fn test_cancel_scheduled_job() {
    let store = Arc::new(InMemoryStore::new());
    let counter = CountingHandler::new();
    let registry = HandlerRegistry::new().with("count", counter.clone());
    let (dispatcher, client) = engine(Arc::clone(&store), registry, 2);
    let (handle, task) = dispatcher.start();

    let id = client
        .enqueue_delayed(Payload::new("count"), Duration::from_millis(200))
        .await
        .unwrap();
    assert_eq!(client.cancel(&id).await.unwrap(), JobState::Deleted);

    tokio::time::sleep(Duration::from_millis(400)).await;
    let status = client.get_status(&id).await.unwrap();
    assert_eq!(status.state, JobState::Deleted);
    assert!(status.finished_at.is_some());
    assert_eq!(counter.calls(), 0);

    handle.shutdown().await.unwrap();
    let _ = task.await;
}

/// Test: A job cancelled while awaiting a retry never executes again.
#[tokio::test]
async fn test_cancel_while_awaiting_retry() {
    let store = Arc::new(InMemoryStore::new());
    let failing = FailingHandler::retryable("try later");
    let registry = HandlerRegistry::new().with("fail", failing.clone());
    let (dispatcher, client) = engine(Arc::clone(&store), registry, 2);
    let (handle, task) = dispatcher
        .with_retry_policy(RetryPolicy::exponential(
            Duration::from_millis(150),
            Duration::from_millis(150),
        ))
        .start();

    let id = client
        .enqueue_with(
            Payload::new("fail"),
            EnqueueOptions::default().max_attempts(5),
        )
        .await
        .unwrap();
    wait_for_state(store.as_ref(), &id, JobState::AwaitingRetry, WAIT)
        .await
        .expect("first attempt should fail");

    assert_eq!(client.cancel(&id).await.unwrap(), JobState::Deleted);

    // Well past the retry time.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let status = client.get_status(&id).await.unwrap();
    assert_eq!(status.state, JobState::Deleted);
    assert_eq!(status.attempt, 1);
    assert_eq!(failing.calls(), 1);

    handle.shutdown().await.unwrap();
    let _ = task.await;
}

/// Test: A running job finishes its attempt but ends up deleted.
#[tokio::test]
async fn test_cancel_processing_job() {
    let store = Arc::new(InMemoryStore::new());
    let slow = SlowHandler::new(Duration::from_millis(300));
    let registry = HandlerRegistry::new().with("slow", slow.clone());
    let (dispatcher, client) = engine(Arc::clone(&store), registry, 1);
    let (handle, task) = dispatcher.start();

    let id = client.enqueue_now(Payload::new("slow")).await.unwrap();
    wait_for_state(store.as_ref(), &id, JobState::Processing, WAIT)
        .await
        .expect("job should start");

    // The flag is recorded; the attempt keeps running.
    assert_eq!(client.cancel(&id).await.unwrap(), JobState::Processing);

    let job = wait_for_state(store.as_ref(), &id, JobState::Deleted, WAIT)
        .await
        .expect("job should end up deleted");
    assert!(job.locked_by.is_none());
    assert_eq!(slow.calls(), 1);

    handle.shutdown().await.unwrap();
    let _ = task.await;
}

/// Test: Cancelling an unknown job is reported as not found.
#[tokio::test]
async fn test_cancel_unknown_job() {
    let store = Arc::new(InMemoryStore::new());
    let (_, client) = engine(Arc::clone(&store), HandlerRegistry::new(), 0);

    let result = client.cancel(&JobId::new()).await;
    assert!(matches!(result, Err(ClientError::NotFound(_))));

    let status = client.get_status(&JobId::new()).await;
    assert!(matches!(status, Err(ClientError::NotFound(_))));
}

/// Test: Cancelling twice is harmless.
#[tokio::test]
async fn test_cancel_is_idempotent() {
    let store = Arc::new(InMemoryStore::new());
    let (_, client) = engine(Arc::clone(&store), HandlerRegistry::new(), 0);

    let id = client.enqueue_now(Payload::new("count")).await.unwrap();
    assert_eq!(client.cancel(&id).await.unwrap(), JobState::Deleted);
    assert_eq!(client.cancel(&id).await.unwrap(), JobState::Deleted);
    assert_eq!(client.stats().await.unwrap().deleted, 1);
}
