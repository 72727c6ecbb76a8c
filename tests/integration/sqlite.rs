//! SQLite integration tests.
//!
//! These tests run the engine over a database file and verify that jobs and
//! schedules survive reopening the store.

use std::sync::Arc;
use std::time::Duration;

use tardy::testing::{FlakyHandler, OverlapDetector, wait_for_terminal};
use tardy::{EnqueueOptions, HandlerRegistry, JobClient, JobState, JobStore, Payload, SqliteStore};
use tempfile::TempDir;

use crate::common::{WAIT, engine};

async fn open(dir: &TempDir) -> Arc<SqliteStore> {
    Arc::new(SqliteStore::new(dir.path().join("tardy.db")).await.unwrap())
}

/// Test: Jobs run to completion over the SQLite backend, with retries.
#[tokio::test]
async fn test_dispatcher_over_sqlite() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;
    let flaky = FlakyHandler::new(1);
    let registry = HandlerRegistry::new().with("flaky", flaky.clone());
    let (dispatcher, client) = engine(Arc::clone(&store), registry, 2);
    let (handle, task) = dispatcher.start();

    let id = client
        .enqueue_with(
            Payload::new("flaky").with_args(serde_json::json!({"user": "u1"})),
            EnqueueOptions::default().max_attempts(3),
        )
        .await
        .unwrap();

    let job = wait_for_terminal(store.as_ref(), &id, WAIT)
        .await
        .expect("job should finish");
    assert_eq!(job.state, JobState::Succeeded);
    assert_eq!(job.attempt, 2);
    assert_eq!(job.payload.args["user"], "u1");

    handle.shutdown().await.unwrap();
    let _ = task.await;
    store.close().await;
}

/// Test: Workers contending over one database never overlap on a job.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sqlite_locking_under_contention() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;
    let detector = OverlapDetector::new(Duration::from_millis(2));
    let registry = HandlerRegistry::new().with("detect", detector.clone());
    let (dispatcher, client) = engine(Arc::clone(&store), registry, 6);
    let (handle, task) = dispatcher.start();

    let mut ids = Vec::new();
    for _ in 0..30 {
        ids.push(client.enqueue_now(Payload::new("detect")).await.unwrap());
    }
    for id in &ids {
        let job = wait_for_terminal(store.as_ref(), id, WAIT)
            .await
            .expect("every job should finish");
        assert_eq!(job.state, JobState::Succeeded);
    }

    assert_eq!(detector.overlaps(), 0);
    assert_eq!(detector.calls(), 30);

    handle.shutdown().await.unwrap();
    let _ = task.await;
    store.close().await;
}

/// Test: Pending jobs and schedules survive reopening the database.
#[tokio::test]
async fn test_state_survives_reopen() {
    let dir = TempDir::new().unwrap();

    let (delayed, schedule) = {
        let store = open(&dir).await;
        let client = JobClient::new(Arc::clone(&store));
        let delayed = client
            .enqueue_delayed(Payload::new("count"), Duration::from_secs(3600))
            .await
            .unwrap();
        let schedule = client
            .enqueue_recurring("nightly", Payload::new("count"), "0 0 * * *", "UTC")
            .await
            .unwrap();
        store.close().await;
        (delayed, schedule)
    };

    let store = open(&dir).await;
    let client = JobClient::new(Arc::clone(&store));

    let status = client.get_status(&delayed).await.unwrap();
    assert_eq!(status.state, JobState::Scheduled);
    assert!(status.scheduled_at.is_some());

    let reopened = client.get_recurring("nightly").await.unwrap();
    assert_eq!(reopened.cron, schedule.cron);
    assert_eq!(reopened.next_fire_at, schedule.next_fire_at);

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.scheduled, 1);
    assert_eq!(stats.recurring, 1);
    store.close().await;
}
