//! API request and response types.

use serde::{Deserialize, Serialize};

use crate::core::job::{JobSnapshot, JobState, RecurringSchedule};
use crate::dispatcher::DispatcherState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

/// Dispatcher state response.
#[derive(Debug, Serialize)]
pub struct DispatcherStateResponse {
    pub state: DispatcherState,
    pub is_running: bool,
    pub is_paused: bool,
}

impl From<DispatcherState> for DispatcherStateResponse {
    fn from(state: DispatcherState) -> Self {
        Self {
            state,
            is_running: state == DispatcherState::Running,
            is_paused: state == DispatcherState::Paused,
        }
    }
}

/// Body of `POST /api/jobs`.
#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub handler: String,
    #[serde(default)]
    pub args: serde_json::Value,
    /// Run no earlier than this many seconds from now.
    pub delay_secs: Option<u64>,
    pub max_attempts: Option<u32>,
}

/// Body of `PUT /api/recurring/{key}`.
#[derive(Debug, Deserialize)]
pub struct RecurringRequest {
    pub handler: String,
    #[serde(default)]
    pub args: serde_json::Value,
    pub cron: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    pub max_attempts: Option<u32>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// Query parameters of `GET /api/jobs`.
#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub state: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    20
}

/// A job was enqueued.
#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub job_id: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Job cancellation response.
#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub job_id: String,
    pub state: JobState,
}

/// List of jobs response.
#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobSnapshot>,
    pub count: usize,
}

/// List of recurring schedules response.
#[derive(Debug, Serialize)]
pub struct RecurringListResponse {
    pub schedules: Vec<RecurringSchedule>,
    pub count: usize,
}

/// Simple message response.
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}
