//! HTTP API module for the tardy job engine.
//!
//! Provides REST endpoints for enqueueing and inspecting jobs, managing
//! recurring schedules, controlling the dispatcher, and the demo workloads.

mod errors;
mod handlers;
mod responses;

pub use errors::{ApiError, ErrorResponse};
pub use handlers::ApiState;
pub use responses::*;

use axum::{
    Router,
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::client::JobClient;
use crate::core::handler::HandlerRegistry;
use crate::demo::DataCleanupService;
use crate::dispatcher::DispatcherHandle;
use crate::storage::JobStore;

/// Configuration for the API server (`server` section).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to bind to.
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5252,
        }
    }
}

impl ApiConfig {
    /// Create a new API config with custom host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Get the socket address.
    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }
}

/// Build the API router with all endpoints.
///
/// The demo routes are mounted only when the state carries the demo
/// cleanup service.
pub fn build_router<S: JobStore + 'static>(state: ApiState<S>) -> Router {
    let mut router = Router::new()
        // Health and stats
        .route("/api/health", get(handlers::health))
        .route("/api/stats", get(handlers::get_stats::<S>))
        // Dispatcher control
        .route(
            "/api/dispatcher/state",
            get(handlers::get_dispatcher_state::<S>),
        )
        .route(
            "/api/dispatcher/pause",
            post(handlers::pause_dispatcher::<S>),
        )
        .route(
            "/api/dispatcher/resume",
            post(handlers::resume_dispatcher::<S>),
        )
        // Jobs
        .route(
            "/api/jobs",
            get(handlers::list_jobs::<S>).post(handlers::enqueue_job::<S>),
        )
        .route(
            "/api/jobs/{job_id}",
            get(handlers::get_job::<S>).delete(handlers::cancel_job::<S>),
        )
        // Recurring schedules
        .route("/api/recurring", get(handlers::list_recurring::<S>))
        .route(
            "/api/recurring/{key}",
            put(handlers::put_recurring::<S>).delete(handlers::delete_recurring::<S>),
        );

    if state.cleanup.is_some() {
        router = router
            .route(
                "/api/notification/fire-and-forget",
                post(handlers::demo_fire_and_forget::<S>),
            )
            .route(
                "/api/notification/delayed",
                post(handlers::demo_delayed::<S>),
            )
            .route(
                "/api/notification/recurring",
                post(handlers::demo_recurring::<S>),
            )
            .route(
                "/api/notification/simulate-failure",
                post(handlers::demo_simulate_failure::<S>),
            )
            .route(
                "/api/notification/cleanup-data",
                post(handlers::demo_cleanup_data::<S>),
            )
            .route(
                "/api/notification/cleanup-data-with-failure",
                post(handlers::demo_cleanup_data_with_failure::<S>),
            )
            .route(
                "/api/notification/data-statistics",
                get(handlers::demo_data_statistics::<S>),
            );
    }

    router
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Create the API state from the engine components.
pub fn create_api_state<S: JobStore>(
    client: JobClient<S>,
    handle: DispatcherHandle,
    registry: HandlerRegistry,
    cleanup: Option<Arc<DataCleanupService>>,
) -> ApiState<S> {
    ApiState {
        client,
        handle,
        registry,
        cleanup,
    }
}

/// Start the API server.
///
/// This function spawns the server and returns a handle to the task.
/// The server runs until the task is aborted or the process exits.
pub async fn start_server<S: JobStore + 'static>(
    config: ApiConfig,
    state: ApiState<S>,
) -> std::io::Result<tokio::task::JoinHandle<()>> {
    let router = build_router(state);
    let addr = config
        .socket_addr()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    let listener = TcpListener::bind(addr).await?;
    tracing::info!("API server listening on http://{}", addr);

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!("API server error: {}", e);
        }
    });

    Ok(handle)
}
