//! API request handlers.

use axum::{
    Json,
    extract::{Path, Query, State},
};
use std::sync::Arc;
use std::time::Duration;

use crate::client::{EnqueueOptions, JobClient};
use crate::core::handler::HandlerRegistry;
use crate::core::job::{JobSnapshot, JobState, JobStats, Payload, RecurringSchedule};
use crate::core::types::JobId;
use crate::demo::{
    DAILY_NOTIFICATION_KEY, DATA_CLEANUP, DATA_CLEANUP_WITH_FAILURE, DataCleanupService,
    DataStatistics, NOTIFICATION, NOTIFICATION_WITH_FAILURE,
};
use crate::dispatcher::DispatcherHandle;
use crate::storage::JobStore;

use super::errors::ApiError;
use super::responses::{
    CancelResponse, DispatcherStateResponse, EnqueueRequest, EnqueueResponse, HealthResponse,
    JobListResponse, ListJobsQuery, MessageResponse, RecurringListResponse, RecurringRequest,
};

/// Shared application state for API handlers.
pub struct ApiState<S: JobStore> {
    pub client: JobClient<S>,
    pub handle: DispatcherHandle,
    /// Registered handler names; enqueue requests for anything else are
    /// rejected.
    pub registry: HandlerRegistry,
    /// Backs the demo statistics endpoint when the demo is enabled.
    pub cleanup: Option<Arc<DataCleanupService>>,
}

impl<S: JobStore> Clone for ApiState<S> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            handle: self.handle.clone(),
            registry: self.registry.clone(),
            cleanup: self.cleanup.clone(),
        }
    }
}

impl<S: JobStore> ApiState<S> {
    fn require_handler(&self, handler: &str) -> Result<(), ApiError> {
        if self.registry.contains(handler) {
            Ok(())
        } else {
            Err(ApiError::Unprocessable(format!(
                "no handler registered for '{}'",
                handler
            )))
        }
    }
}

fn parse_job_id(raw: &str) -> Result<JobId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::NotFound(format!("invalid job id: {}", raw)))
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse::default())
}

/// Job counts per state.
pub async fn get_stats<S: JobStore + 'static>(
    State(state): State<ApiState<S>>,
) -> Result<Json<JobStats>, ApiError> {
    Ok(Json(state.client.stats().await?))
}

/// Get dispatcher state.
pub async fn get_dispatcher_state<S: JobStore + 'static>(
    State(state): State<ApiState<S>>,
) -> Json<DispatcherStateResponse> {
    Json(DispatcherStateResponse::from(state.handle.state()))
}

/// Pause the dispatcher.
pub async fn pause_dispatcher<S: JobStore + 'static>(
    State(state): State<ApiState<S>>,
) -> Result<Json<MessageResponse>, ApiError> {
    state.handle.pause().await?;
    Ok(Json(MessageResponse {
        message: "dispatcher paused".to_string(),
    }))
}

/// Resume the dispatcher.
pub async fn resume_dispatcher<S: JobStore + 'static>(
    State(state): State<ApiState<S>>,
) -> Result<Json<MessageResponse>, ApiError> {
    state.handle.resume().await?;
    Ok(Json(MessageResponse {
        message: "dispatcher resumed".to_string(),
    }))
}

/// Enqueue a job.
pub async fn enqueue_job<S: JobStore + 'static>(
    State(state): State<ApiState<S>>,
    Json(request): Json<EnqueueRequest>,
) -> Result<Json<EnqueueResponse>, ApiError> {
    state.require_handler(&request.handler)?;

    let options = EnqueueOptions {
        delay: request.delay_secs.map(Duration::from_secs),
        max_attempts: request.max_attempts,
    };
    let payload = Payload::new(&request.handler).with_args(request.args);
    let job_id = state.client.enqueue_with(payload, options).await?;

    Ok(Json(EnqueueResponse {
        job_id: job_id.to_string(),
        message: format!("job '{}' enqueued", request.handler),
        note: None,
    }))
}

/// List recent jobs.
pub async fn list_jobs<S: JobStore + 'static>(
    State(state): State<ApiState<S>>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<JobListResponse>, ApiError> {
    let filter = query
        .state
        .as_deref()
        .map(str::parse::<JobState>)
        .transpose()
        .map_err(ApiError::Unprocessable)?;

    let jobs = state.client.list_jobs(filter, query.limit).await?;
    let count = jobs.len();
    Ok(Json(JobListResponse { jobs, count }))
}

/// Get a specific job.
pub async fn get_job<S: JobStore + 'static>(
    State(state): State<ApiState<S>>,
    Path(job_id): Path<String>,
) -> Result<Json<JobSnapshot>, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    Ok(Json(state.client.get_status(&job_id).await?))
}

/// Cancel a job.
pub async fn cancel_job<S: JobStore + 'static>(
    State(state): State<ApiState<S>>,
    Path(job_id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    let job_state = state.client.cancel(&job_id).await?;
    Ok(Json(CancelResponse {
        job_id: job_id.to_string(),
        state: job_state,
    }))
}

/// List recurring schedules.
pub async fn list_recurring<S: JobStore + 'static>(
    State(state): State<ApiState<S>>,
) -> Result<Json<RecurringListResponse>, ApiError> {
    let schedules = state.client.list_recurring().await?;
    let count = schedules.len();
    Ok(Json(RecurringListResponse { schedules, count }))
}

/// Create or update a recurring schedule.
pub async fn put_recurring<S: JobStore + 'static>(
    State(state): State<ApiState<S>>,
    Path(key): Path<String>,
    Json(request): Json<RecurringRequest>,
) -> Result<Json<RecurringSchedule>, ApiError> {
    state.require_handler(&request.handler)?;

    let payload = Payload::new(&request.handler).with_args(request.args);
    let schedule = match request.max_attempts {
        Some(max_attempts) => {
            state
                .client
                .enqueue_recurring_with(key, payload, &request.cron, &request.timezone, max_attempts)
                .await?
        }
        None => {
            state
                .client
                .enqueue_recurring(key, payload, &request.cron, &request.timezone)
                .await?
        }
    };
    Ok(Json(schedule))
}

/// Remove a recurring schedule.
pub async fn delete_recurring<S: JobStore + 'static>(
    State(state): State<ApiState<S>>,
    Path(key): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    state.client.remove_recurring(key.as_str()).await?;
    Ok(Json(MessageResponse {
        message: format!("recurring schedule '{}' removed", key),
    }))
}

// Demo endpoints

fn notification(handler: &str, user: &str) -> Payload {
    Payload::new(handler).with_args(serde_json::json!({ "user": user }))
}

/// Enqueue a notification to run now.
pub async fn demo_fire_and_forget<S: JobStore + 'static>(
    State(state): State<ApiState<S>>,
) -> Result<Json<EnqueueResponse>, ApiError> {
    let job_id = state
        .client
        .enqueue_now(notification(NOTIFICATION, "user1"))
        .await?;
    Ok(Json(EnqueueResponse {
        job_id: job_id.to_string(),
        message: "fire-and-forget job enqueued".to_string(),
        note: None,
    }))
}

/// Schedule a notification ten minutes from now.
pub async fn demo_delayed<S: JobStore + 'static>(
    State(state): State<ApiState<S>>,
) -> Result<Json<EnqueueResponse>, ApiError> {
    let job_id = state
        .client
        .enqueue_delayed(notification(NOTIFICATION, "user2"), Duration::from_secs(600))
        .await?;
    Ok(Json(EnqueueResponse {
        job_id: job_id.to_string(),
        message: "delayed job scheduled to run in 10 minutes".to_string(),
        note: None,
    }))
}

/// Register the daily notification schedule.
pub async fn demo_recurring<S: JobStore + 'static>(
    State(state): State<ApiState<S>>,
) -> Result<Json<MessageResponse>, ApiError> {
    state
        .client
        .enqueue_recurring(
            DAILY_NOTIFICATION_KEY,
            notification(NOTIFICATION, "daily_user"),
            "@daily",
            "UTC",
        )
        .await?;
    Ok(Json(MessageResponse {
        message: "recurring job configured to run daily".to_string(),
    }))
}

/// Enqueue a notification that fails its first attempts.
pub async fn demo_simulate_failure<S: JobStore + 'static>(
    State(state): State<ApiState<S>>,
) -> Result<Json<EnqueueResponse>, ApiError> {
    let job_id = state
        .client
        .enqueue_now(notification(NOTIFICATION_WITH_FAILURE, "user_test"))
        .await?;
    Ok(Json(EnqueueResponse {
        job_id: job_id.to_string(),
        message: "job with simulated failure enqueued; it will be retried automatically"
            .to_string(),
        note: Some("watch the job's attempt counter and last_error".to_string()),
    }))
}

/// Enqueue a data cleanup.
pub async fn demo_cleanup_data<S: JobStore + 'static>(
    State(state): State<ApiState<S>>,
) -> Result<Json<EnqueueResponse>, ApiError> {
    let job_id = state
        .client
        .enqueue_now(Payload::new(DATA_CLEANUP))
        .await?;
    Ok(Json(EnqueueResponse {
        job_id: job_id.to_string(),
        message: "data cleanup job enqueued".to_string(),
        note: None,
    }))
}

/// Enqueue a data cleanup that may fail.
pub async fn demo_cleanup_data_with_failure<S: JobStore + 'static>(
    State(state): State<ApiState<S>>,
) -> Result<Json<EnqueueResponse>, ApiError> {
    let job_id = state
        .client
        .enqueue_now(Payload::new(DATA_CLEANUP_WITH_FAILURE))
        .await?;
    Ok(Json(EnqueueResponse {
        job_id: job_id.to_string(),
        message: "data cleanup job with possible failure enqueued".to_string(),
        note: Some("this job fails at random to demonstrate retries".to_string()),
    }))
}

/// Current shape of the demo data set.
pub async fn demo_data_statistics<S: JobStore + 'static>(
    State(state): State<ApiState<S>>,
) -> Result<Json<DataStatistics>, ApiError> {
    let service = state
        .cleanup
        .as_ref()
        .ok_or_else(|| ApiError::NotFound("demo services are disabled".to_string()))?;
    Ok(Json(service.statistics(state.client.clock().now())))
}
