//! Recurring schedule integration tests.
//!
//! These tests drive the recurring pump with a manual clock and verify
//! idempotent registration, one fire per occurrence and the rule that a
//! schedule never has two live instances.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tardy::testing::{CountingHandler, wait_for_state};
use tardy::{
    ClientError, Clock, Dispatcher, HandlerRegistry, InMemoryStore, JobClient,
    JobState, JobStore, ManualClock, Payload, ScheduleKey,
};

use crate::common::{WAIT, engine};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 23, 0, 0).unwrap()
}

fn manual_client(store: Arc<InMemoryStore>, clock: Arc<ManualClock>) -> JobClient<InMemoryStore> {
    JobClient::new(store).with_clock(clock)
}

/// A coordinator-only dispatcher whose pump runs only on demand.
fn manual_dispatcher(
    store: Arc<InMemoryStore>,
    clock: Arc<ManualClock>,
) -> Dispatcher<InMemoryStore> {
    Dispatcher::new(store, HandlerRegistry::new())
        .with_workers(0)
        .with_clock(clock)
        .with_tick_interval(Duration::from_secs(3600))
}

/// Test: Registering the same key twice leaves exactly one schedule.
#[tokio::test]
async fn test_enqueue_recurring_is_idempotent() {
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(ManualClock::new(start_time()));
    let client = manual_client(Arc::clone(&store), clock);

    client
        .enqueue_recurring("k", Payload::new("count"), "0 0 * * *", "UTC")
        .await
        .unwrap();
    let updated = client
        .enqueue_recurring("k", Payload::new("count"), "0 0 * * *", "UTC")
        .await
        .unwrap();

    let schedules = client.list_recurring().await.unwrap();
    assert_eq!(schedules.len(), 1);
    assert_eq!(schedules[0], updated);
    assert_eq!(
        updated.next_fire_at,
        Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap()
    );
}

/// Test: Re-registering a key replaces its expression.
#[tokio::test]
async fn test_enqueue_recurring_updates_expression() {
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(ManualClock::new(start_time()));
    let client = manual_client(Arc::clone(&store), clock);

    client
        .enqueue_recurring("report", Payload::new("count"), "@daily", "UTC")
        .await
        .unwrap();
    let updated = client
        .enqueue_recurring("report", Payload::new("count"), "@hourly", "UTC")
        .await
        .unwrap();

    assert_eq!(updated.cron, "@hourly");
    assert_eq!(client.list_recurring().await.unwrap().len(), 1);
    assert_eq!(
        client.get_recurring("report").await.unwrap().next_fire_at,
        Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap()
    );
}

/// Test: Invalid expressions and timezones are rejected before storing.
#[tokio::test]
async fn test_enqueue_recurring_rejects_invalid_input() {
    let store = Arc::new(InMemoryStore::new());
    let client = JobClient::new(Arc::clone(&store));

    let bad_cron = client
        .enqueue_recurring("bad", Payload::new("count"), "61 * * * *", "UTC")
        .await;
    assert!(matches!(bad_cron, Err(ClientError::InvalidExpression(_))));

    let bad_tz = client
        .enqueue_recurring("bad", Payload::new("count"), "@daily", "Nowhere/Special")
        .await;
    assert!(matches!(bad_tz, Err(ClientError::InvalidExpression(_))));

    assert!(client.list_recurring().await.unwrap().is_empty());
}

/// Test: A schedule never has two live spawned jobs.
#[tokio::test]
async fn test_fire_is_suppressed_while_previous_instance_is_live() {
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(ManualClock::new(start_time()));
    let client = manual_client(Arc::clone(&store), clock.clone());
    let (handle, task) = manual_dispatcher(Arc::clone(&store), clock.clone()).start();

    client
        .enqueue_recurring("nightly", Payload::new("count"), "0 0 * * *", "UTC")
        .await
        .unwrap();

    clock.set(Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap());
    let report = handle.maintain().await.unwrap();
    assert_eq!(report.fired, 1);
    let first = client
        .get_recurring("nightly")
        .await
        .unwrap()
        .last_job_id
        .expect("schedule should record its job");

    // Nothing runs the first instance, so the next occurrence is skipped.
    clock.advance(DAY);
    let report = handle.maintain().await.unwrap();
    assert_eq!(report.fired, 0);
    assert_eq!(report.suppressed, 1);
    let live = client
        .list_jobs(Some(JobState::Enqueued), 10)
        .await
        .unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].id, first);

    // Once the instance is gone the following occurrence fires again.
    assert_eq!(client.cancel(&first).await.unwrap(), JobState::Deleted);
    clock.advance(DAY);
    let report = handle.maintain().await.unwrap();
    assert_eq!(report.fired, 1);
    let second = client
        .get_recurring("nightly")
        .await
        .unwrap()
        .last_job_id
        .unwrap();
    assert_ne!(first, second);

    handle.shutdown().await.unwrap();
    let _ = task.await;
}

/// Test: Missed occurrences fire once, not once per missed slot.
#[tokio::test]
async fn test_missed_occurrences_do_not_burst() {
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(ManualClock::new(start_time()));
    let client = manual_client(Arc::clone(&store), clock.clone());
    let (handle, task) = manual_dispatcher(Arc::clone(&store), clock.clone()).start();

    client
        .enqueue_recurring("hourly", Payload::new("count"), "@hourly", "UTC")
        .await
        .unwrap();

    // Ten hours of downtime.
    clock.advance(Duration::from_secs(10 * 60 * 60));
    let report = handle.maintain().await.unwrap();
    assert_eq!(report.fired, 1);
    assert_eq!(handle.maintain().await.unwrap().fired, 0);

    let schedule = client.get_recurring("hourly").await.unwrap();
    assert_eq!(
        schedule.next_fire_at,
        Utc.with_ymd_and_hms(2024, 1, 2, 10, 0, 0).unwrap()
    );
    assert!(schedule.next_fire_at > clock.now());

    handle.shutdown().await.unwrap();
    let _ = task.await;
}

/// Test: Removing a schedule keeps the jobs it already spawned.
#[tokio::test]
async fn test_remove_recurring_keeps_spawned_jobs() {
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(ManualClock::new(start_time()));
    let client = manual_client(Arc::clone(&store), clock.clone());
    let (handle, task) = manual_dispatcher(Arc::clone(&store), clock.clone()).start();

    client
        .enqueue_recurring("nightly", Payload::new("count"), "@daily", "UTC")
        .await
        .unwrap();
    clock.advance(DAY);
    assert_eq!(handle.maintain().await.unwrap().fired, 1);

    client.remove_recurring("nightly").await.unwrap();
    assert!(matches!(
        client.remove_recurring("nightly").await,
        Err(ClientError::NotFound(_))
    ));
    assert!(matches!(
        client.get_recurring("nightly").await,
        Err(ClientError::NotFound(_))
    ));
    assert_eq!(store.stats().await.unwrap().enqueued, 1);

    clock.advance(DAY);
    assert_eq!(handle.maintain().await.unwrap().fired, 0);

    handle.shutdown().await.unwrap();
    let _ = task.await;
}

/// Test: With a real clock and workers, a per-second schedule runs its
/// spawned jobs to completion.
#[tokio::test]
async fn test_recurring_jobs_run_end_to_end() {
    let store = Arc::new(InMemoryStore::new());
    let counter = CountingHandler::new();
    let registry = HandlerRegistry::new().with("count", counter.clone());
    let (dispatcher, client) = engine(Arc::clone(&store), registry, 2);
    let (handle, task) = dispatcher
        .with_tick_interval(Duration::from_millis(50))
        .start();

    client
        .enqueue_recurring("every-second", Payload::new("count"), "* * * * * *", "UTC")
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + WAIT;
    let job_id = loop {
        let schedule = client.get_recurring("every-second").await.unwrap();
        if let Some(id) = schedule.last_job_id {
            break id;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "schedule never fired"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    };

    let job = wait_for_state(store.as_ref(), &job_id, JobState::Succeeded, WAIT)
        .await
        .expect("spawned job should succeed");
    assert_eq!(
        job.kind.schedule_key(),
        Some(&ScheduleKey::new("every-second"))
    );
    assert!(counter.calls() >= 1);

    handle.shutdown().await.unwrap();
    let _ = task.await;
}

/// Test: Pausing the dispatcher also pauses the recurring pump.
#[tokio::test]
async fn test_paused_dispatcher_does_not_fire() {
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(ManualClock::new(start_time()));
    let client = manual_client(Arc::clone(&store), clock.clone());
    let (handle, task) = manual_dispatcher(Arc::clone(&store), clock.clone()).start();

    client
        .enqueue_recurring("nightly", Payload::new("count"), "@daily", "UTC")
        .await
        .unwrap();
    handle.pause().await.unwrap();
    clock.advance(DAY);
    assert_eq!(handle.maintain().await.unwrap().fired, 0);

    handle.resume().await.unwrap();
    assert_eq!(handle.maintain().await.unwrap().fired, 1);

    handle.shutdown().await.unwrap();
    let _ = task.await;
}
