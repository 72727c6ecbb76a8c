//! API integration tests.
//!
//! These tests drive the router with `oneshot` requests against an engine
//! whose dispatcher has no workers, so jobs stay where the API put them.

use tardy::api::{ApiState, build_router, create_api_state};
use tardy::demo::{DAILY_NOTIFICATION_KEY, DataCleanupService, DemoConfig, register_demo_handlers};
use tardy::testing::CountingHandler;
use tardy::{HandlerRegistry, InMemoryStore, JobClient, JobStore, SystemClock};

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;

use crate::common::engine;

struct TestApi {
    state: ApiState<InMemoryStore>,
    store: Arc<InMemoryStore>,
}

impl TestApi {
    fn router(&self) -> Router {
        build_router(self.state.clone())
    }
}

/// Create a test API with the demo services enabled or not.
fn create_test_api(demo: bool) -> TestApi {
    let store = Arc::new(InMemoryStore::new());
    let mut registry = HandlerRegistry::new().with("count", CountingHandler::new());
    let cleanup = if demo {
        let config = DemoConfig::default();
        let service = Arc::new(DataCleanupService::new(&config));
        register_demo_handlers(
            &mut registry,
            Arc::clone(&service),
            &config,
            Arc::new(SystemClock),
        );
        Some(service)
    } else {
        None
    };

    let (dispatcher, client) = engine(Arc::clone(&store), registry.clone(), 0);
    let (handle, _task) = dispatcher.start();

    TestApi {
        state: create_api_state(client, handle, registry, cleanup),
        store,
    }
}

async fn send(router: Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

/// Test: Health endpoint responds with status ok.
#[tokio::test]
async fn test_health_endpoint() {
    let api = create_test_api(false);

    let (status, json) = send(api.router(), Method::GET, "/api/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
}

/// Test: Dispatcher state endpoints report and change the state.
#[tokio::test]
async fn test_dispatcher_pause_and_resume() {
    let api = create_test_api(false);

    let (status, json) = send(api.router(), Method::GET, "/api/dispatcher/state", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["state"], "running");
    assert_eq!(json["is_running"], true);
    assert_eq!(json["is_paused"], false);

    let (status, _) = send(api.router(), Method::POST, "/api/dispatcher/pause", None).await;
    assert_eq!(status, StatusCode::OK);
    let (_, json) = send(api.router(), Method::GET, "/api/dispatcher/state", None).await;
    assert_eq!(json["state"], "paused");
    assert_eq!(json["is_paused"], true);

    let (status, _) = send(api.router(), Method::POST, "/api/dispatcher/resume", None).await;
    assert_eq!(status, StatusCode::OK);
    let (_, json) = send(api.router(), Method::GET, "/api/dispatcher/state", None).await;
    assert_eq!(json["state"], "running");
}

/// Test: Control endpoints fail once the dispatcher is gone.
#[tokio::test]
async fn test_pause_after_shutdown_is_unavailable() {
    let api = create_test_api(false);
    api.state.handle.shutdown().await.unwrap();

    let (status, json) = send(api.router(), Method::POST, "/api/dispatcher/pause", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["code"], "SERVICE_UNAVAILABLE");
}

/// Test: An enqueued job can be read back and cancelled.
#[tokio::test]
async fn test_enqueue_get_and_cancel_job() {
    let api = create_test_api(false);

    let (status, json) = send(
        api.router(),
        Method::POST,
        "/api/jobs",
        Some(json!({"handler": "count", "args": {"n": 1}, "max_attempts": 3})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let job_id = json["job_id"].as_str().unwrap().to_string();

    let (status, json) = send(api.router(), Method::GET, &format!("/api/jobs/{}", job_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["handler"], "count");
    assert_eq!(json["state"], "enqueued");
    assert_eq!(json["attempt"], 1);
    assert_eq!(json["max_attempts"], 3);
    assert_eq!(json["exhausted"], false);

    let (status, json) = send(
        api.router(),
        Method::DELETE,
        &format!("/api/jobs/{}", job_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["state"], "deleted");

    let id = job_id.parse().unwrap();
    assert!(api.store.get_job(&id).await.unwrap().state.is_terminal());
}

/// Test: A delayed enqueue lands in the scheduled state.
#[tokio::test]
async fn test_enqueue_delayed_job() {
    let api = create_test_api(false);

    let (status, json) = send(
        api.router(),
        Method::POST,
        "/api/jobs",
        Some(json!({"handler": "count", "delay_secs": 600})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let job_id = json["job_id"].as_str().unwrap();
    let (_, json) = send(api.router(), Method::GET, &format!("/api/jobs/{}", job_id), None).await;
    assert_eq!(json["state"], "scheduled");
    assert!(json["scheduled_at"].is_string());
}

/// Test: A delay beyond the representable time range is rejected.
#[tokio::test]
async fn test_enqueue_out_of_range_delay() {
    let api = create_test_api(false);

    let (status, json) = send(
        api.router(),
        Method::POST,
        "/api/jobs",
        Some(json!({"handler": "count", "delay_secs": 10_000_000_000_000u64})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json["code"], "INVALID_REQUEST");
    assert_eq!(api.store.stats().await.unwrap().total(), 0);
}

/// Test: Enqueueing for an unregistered handler is rejected.
#[tokio::test]
async fn test_enqueue_unknown_handler() {
    let api = create_test_api(false);

    let (status, json) = send(
        api.router(),
        Method::POST,
        "/api/jobs",
        Some(json!({"handler": "missing"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json["code"], "INVALID_REQUEST");
    assert_eq!(api.store.stats().await.unwrap().total(), 0);
}

/// Test: Unknown and malformed job ids are not found.
#[tokio::test]
async fn test_get_job_not_found() {
    let api = create_test_api(false);

    let (status, json) = send(api.router(), Method::GET, "/api/jobs/not-a-uuid", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["code"], "NOT_FOUND");

    let unknown = tardy::JobId::new();
    let (status, _) = send(api.router(), Method::GET, &format!("/api/jobs/{}", unknown), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        api.router(),
        Method::DELETE,
        &format!("/api/jobs/{}", unknown),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

/// Test: Jobs can be listed and filtered by state.
#[tokio::test]
async fn test_list_jobs_and_stats() {
    let api = create_test_api(false);

    for body in [
        json!({"handler": "count"}),
        json!({"handler": "count"}),
        json!({"handler": "count", "delay_secs": 60}),
    ] {
        let (status, _) = send(api.router(), Method::POST, "/api/jobs", Some(body)).await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, json) = send(api.router(), Method::GET, "/api/jobs", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["count"], 3);

    let (_, json) = send(api.router(), Method::GET, "/api/jobs?state=scheduled", None).await;
    assert_eq!(json["count"], 1);
    assert_eq!(json["jobs"][0]["state"], "scheduled");

    let (_, json) = send(api.router(), Method::GET, "/api/jobs?limit=2", None).await;
    assert_eq!(json["count"], 2);

    let (status, _) = send(api.router(), Method::GET, "/api/jobs?state=bogus", None).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, json) = send(api.router(), Method::GET, "/api/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["enqueued"], 2);
    assert_eq!(json["scheduled"], 1);
    assert_eq!(json["failed"], 0);
}

/// Test: Recurring schedules can be created, listed and removed.
#[tokio::test]
async fn test_recurring_crud() {
    let api = create_test_api(false);

    let (status, json) = send(
        api.router(),
        Method::PUT,
        "/api/recurring/nightly",
        Some(json!({"handler": "count", "cron": "0 0 * * *"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["key"], "nightly");
    assert_eq!(json["timezone"], "UTC");

    // Same key again updates in place.
    let (status, _) = send(
        api.router(),
        Method::PUT,
        "/api/recurring/nightly",
        Some(json!({"handler": "count", "cron": "30 1 * * *", "timezone": "Europe/Paris"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, json) = send(api.router(), Method::GET, "/api/recurring", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["count"], 1);
    assert_eq!(json["schedules"][0]["cron"], "30 1 * * *");
    assert_eq!(json["schedules"][0]["timezone"], "Europe/Paris");

    let (status, _) = send(api.router(), Method::DELETE, "/api/recurring/nightly", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(api.router(), Method::DELETE, "/api/recurring/nightly", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

/// Test: Invalid cron expressions are rejected.
#[tokio::test]
async fn test_recurring_invalid_cron() {
    let api = create_test_api(false);

    let (status, json) = send(
        api.router(),
        Method::PUT,
        "/api/recurring/broken",
        Some(json!({"handler": "count", "cron": "every tuesday"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json["code"], "INVALID_REQUEST");

    let (_, json) = send(api.router(), Method::GET, "/api/recurring", None).await;
    assert_eq!(json["count"], 0);
}

/// Test: Demo routes are only mounted when the demo is enabled.
#[tokio::test]
async fn test_demo_routes_absent_when_disabled() {
    let api = create_test_api(false);

    let (status, _) = send(
        api.router(),
        Method::POST,
        "/api/notification/fire-and-forget",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

/// Test: Demo endpoints enqueue the expected jobs.
#[tokio::test]
async fn test_demo_endpoints() {
    let api = create_test_api(true);

    let (status, json) = send(
        api.router(),
        Method::POST,
        "/api/notification/fire-and-forget",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let job_id = json["job_id"].as_str().unwrap().to_string();
    let (_, job) = send(api.router(), Method::GET, &format!("/api/jobs/{}", job_id), None).await;
    assert_eq!(job["handler"], "notification");
    assert_eq!(job["state"], "enqueued");

    let (status, json) = send(api.router(), Method::POST, "/api/notification/delayed", None).await;
    assert_eq!(status, StatusCode::OK);
    let job_id = json["job_id"].as_str().unwrap().to_string();
    let (_, job) = send(api.router(), Method::GET, &format!("/api/jobs/{}", job_id), None).await;
    assert_eq!(job["state"], "scheduled");

    let (status, json) = send(
        api.router(),
        Method::POST,
        "/api/notification/simulate-failure",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(json["note"].is_string());

    for uri in [
        "/api/notification/cleanup-data",
        "/api/notification/cleanup-data-with-failure",
    ] {
        let (status, json) = send(api.router(), Method::POST, uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(json["job_id"].is_string());
    }

    let (status, _) = send(api.router(), Method::POST, "/api/notification/recurring", None).await;
    assert_eq!(status, StatusCode::OK);
    let schedule = api
        .state
        .client
        .get_recurring(DAILY_NOTIFICATION_KEY)
        .await
        .unwrap();
    assert_eq!(schedule.cron, "@daily");
    assert_eq!(schedule.payload.args["user"], "daily_user");

    let stats = api.store.stats().await.unwrap();
    assert_eq!(stats.enqueued, 4);
    assert_eq!(stats.scheduled, 1);
    assert_eq!(stats.recurring, 1);
}

/// Test: Data statistics reflect the sample record set.
#[tokio::test]
async fn test_demo_data_statistics() {
    let api = create_test_api(true);

    let (status, json) = send(
        api.router(),
        Method::GET,
        "/api/notification/data-statistics",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["total"], 50);
    assert_eq!(json["deleted"], 0);
    assert!(json["last_cleanup"].is_null());
}

/// Test: Client-side enqueues are visible through the API.
#[tokio::test]
async fn test_client_and_api_share_store() {
    let api = create_test_api(false);
    let client: &JobClient<InMemoryStore> = &api.state.client;

    let id = client
        .enqueue_now(tardy::Payload::new("count"))
        .await
        .unwrap();

    let (status, json) = send(api.router(), Method::GET, &format!("/api/jobs/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["id"], id.to_string());
}
