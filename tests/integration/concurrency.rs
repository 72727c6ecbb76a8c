//! Concurrency integration tests.
//!
//! These tests verify that a job is never executed by two workers at the same
//! time, within one dispatcher and across dispatchers sharing a store.

use std::sync::Arc;
use std::time::Duration;

use tardy::testing::{CountingHandler, OverlapDetector, wait_for_terminal};
use tardy::{HandlerRegistry, InMemoryStore, JobState, JobStore, Payload};

use crate::common::{WAIT, engine};

/// Test: Many workers racing over many jobs never overlap on one job.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_job_runs_on_two_workers_at_once() {
    let store = Arc::new(InMemoryStore::new());
    let detector = OverlapDetector::new(Duration::from_millis(5));
    let registry = HandlerRegistry::new().with("detect", detector.clone());
    let (dispatcher, client) = engine(Arc::clone(&store), registry, 8);
    let (handle, task) = dispatcher.start();

    let mut ids = Vec::new();
    for _ in 0..100 {
        ids.push(client.enqueue_now(Payload::new("detect")).await.unwrap());
    }

    for id in &ids {
        let job = wait_for_terminal(store.as_ref(), id, WAIT)
            .await
            .expect("every job should finish");
        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(job.attempt, 1);
    }

    assert_eq!(detector.overlaps(), 0);
    assert_eq!(detector.calls(), 100);

    handle.shutdown().await.unwrap();
    let _ = task.await;
}

/// Test: Two dispatchers over one store execute each job exactly once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_dispatchers_share_one_store() {
    let store = Arc::new(InMemoryStore::new());
    let counter = CountingHandler::new();

    let (first, client) = engine(
        Arc::clone(&store),
        HandlerRegistry::new().with("count", counter.clone()),
        4,
    );
    let (second, _) = engine(
        Arc::clone(&store),
        HandlerRegistry::new().with("count", counter.clone()),
        4,
    );
    let (first_handle, first_task) = first.start();
    let (second_handle, second_task) = second.start();

    let mut ids = Vec::new();
    for _ in 0..50 {
        ids.push(client.enqueue_now(Payload::new("count")).await.unwrap());
    }

    for id in &ids {
        let job = wait_for_terminal(store.as_ref(), id, WAIT)
            .await
            .expect("every job should finish");
        assert_eq!(job.state, JobState::Succeeded);
    }
    assert_eq!(counter.calls(), 50);

    first_handle.shutdown().await.unwrap();
    second_handle.shutdown().await.unwrap();
    let _ = first_task.await;
    let _ = second_task.await;
}

/// Test: Delayed jobs run only once their due time has passed.
#[tokio::test]
async fn test_delayed_job_waits_for_due_time() {
    let store = Arc::new(InMemoryStore::new());
    let counter = CountingHandler::new();
    let registry = HandlerRegistry::new().with("count", counter.clone());
    let (dispatcher, client) = engine(Arc::clone(&store), registry, 2);
    let (handle, task) = dispatcher.start();

    let id = client
        .enqueue_delayed(Payload::new("count"), Duration::from_millis(300))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.get_job(&id).await.unwrap().state, JobState::Scheduled);
    assert_eq!(counter.calls(), 0);

    let job = wait_for_terminal(store.as_ref(), &id, WAIT)
        .await
        .expect("delayed job should run");
    assert_eq!(job.state, JobState::Succeeded);
    assert!(job.finished_at.unwrap() >= job.scheduled_at.unwrap());
    assert_eq!(counter.calls(), 1);

    handle.shutdown().await.unwrap();
    let _ = task.await;
}
