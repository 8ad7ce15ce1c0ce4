//! HTTP API surface.
//!
//! Field names are bit-exact for client compatibility: `job_in_progress`
//! on the worker bodies, camelCase times on the status response, ISO
//! 8601 timestamps, millisecond durations.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::domain::errors::DomainError;
use crate::domain::models::{Payload, ServerConfig, Task};
use crate::infrastructure::config::EndpointSpec;
use crate::services::{
    EndpointService, HeartbeatRequest, PullRequest, ResultSubmission, TaskDispatcher,
    WebhookDispatcher, WorkerRegistry,
};

/// Shared state for the HTTP server.
pub struct AppState {
    pub dispatcher: Arc<TaskDispatcher>,
    pub registry: Arc<WorkerRegistry>,
    pub endpoints: Arc<EndpointService>,
    pub webhooks: WebhookDispatcher,
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

fn error_response(err: &DomainError) -> Response {
    let (status, code) = match err {
        DomainError::TaskNotFound(_)
        | DomainError::WorkerNotFound(_)
        | DomainError::EndpointNotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        DomainError::InvalidStateTransition { .. } => (StatusCode::CONFLICT, "illegal_transition"),
        DomainError::Conflict { .. } => (StatusCode::CONFLICT, "conflict"),
        DomainError::ValidationFailed(_) => (StatusCode::BAD_REQUEST, "validation_failed"),
        DomainError::DatabaseError(_)
        | DomainError::SerializationError(_)
        | DomainError::ProviderError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            code: code.to_string(),
        }),
    )
        .into_response()
}

// ---------------------------------------------------------------------
// Request/response bodies
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub input: Box<RawValue>,
    #[serde(default)]
    pub webhook: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub id: Uuid,
    pub status: String,
    /// Present (false) only when the queue is over its limit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommended: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct SyncSubmitParams {
    /// Seconds to wait for a terminal state
    #[serde(default = "default_sync_timeout")]
    pub timeout: u64,
}

fn default_sync_timeout() -> u64 {
    60
}

/// RunPod-compatible task status body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusResponse {
    pub id: Uuid,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Box<RawValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Milliseconds spent queued before assignment
    pub delay_time: i64,
    /// Milliseconds spent executing
    pub execution_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Box<RawValue>>,
}

impl From<Task> for TaskStatusResponse {
    fn from(task: Task) -> Self {
        let delay_time = task.queue_wait_ms().unwrap_or(0);
        let execution_time = match (task.started_at, task.completed_at) {
            (Some(started), Some(completed)) => (completed - started).num_milliseconds(),
            _ => 0,
        };
        Self {
            id: task.id,
            status: task.status.as_str().to_string(),
            output: task.output.as_ref().map(|p| p.as_raw().to_owned()),
            error: task.error_message,
            created_at: task.created_at.to_rfc3339(),
            started_at: task.started_at.map(|t| t.to_rfc3339()),
            completed_at: task.completed_at.map(|t| t.to_rfc3339()),
            worker_id: task.worker_id,
            endpoint: Some(task.endpoint),
            delay_time,
            execution_time,
            input: Some(task.input.as_raw().to_owned()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatBody {
    pub worker_id: String,
    #[serde(default)]
    pub job_in_progress: Vec<String>,
    #[serde(default)]
    pub job_count: Option<u32>,
    #[serde(default)]
    pub concurrency: Option<u32>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PullBody {
    pub worker_id: String,
    #[serde(default)]
    pub job_in_progress: Vec<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default)]
    pub concurrency: Option<u32>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
}

fn default_batch_size() -> u32 {
    1
}

#[derive(Debug, Serialize)]
pub struct PullResponse {
    pub jobs: Vec<JobEntry>,
}

#[derive(Debug, Serialize)]
pub struct JobEntry {
    pub id: Uuid,
    pub input: Box<RawValue>,
}

#[derive(Debug, Deserialize)]
pub struct ResultBody {
    #[serde(default)]
    pub task_id: Option<Uuid>,
    #[serde(default)]
    pub output: Option<Box<RawValue>>,
    #[serde(default)]
    pub error: Option<String>,
    /// Advisory; pod shutdown is the orchestrator's call
    #[serde(default, rename = "stopPod")]
    pub stop_pod: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct StreamBody {
    pub task_id: Uuid,
    pub output: Box<RawValue>,
}

// ---------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------

async fn submit(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SubmitRequest>,
) -> Response {
    let input = Payload::from(body.input);
    let endpoint = body.endpoint.unwrap_or_default();
    match state.dispatcher.submit(&endpoint, input, body.webhook).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(SubmitResponse {
                id: outcome.task_id,
                status: outcome.status.as_str().to_string(),
                recommended: (!outcome.recommended).then_some(false),
            }),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

async fn submit_sync(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SyncSubmitParams>,
    Json(body): Json<SubmitRequest>,
) -> Response {
    let input = Payload::from(body.input);
    let endpoint = body.endpoint.unwrap_or_default();
    let outcome = match state.dispatcher.submit(&endpoint, input, body.webhook).await {
        Ok(outcome) => outcome,
        Err(e) => return error_response(&e),
    };

    let deadline = Utc::now() + chrono::Duration::seconds(params.timeout.min(3600) as i64);
    match state
        .dispatcher
        .wait_for_terminal(outcome.task_id, deadline)
        .await
    {
        Ok(task) => Json(TaskStatusResponse::from(task)).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn task_status(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    match state.dispatcher.get_task(id).await {
        Ok(task) => Json(TaskStatusResponse::from(task)).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn cancel_task(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    match state.dispatcher.cancel(id).await {
        Ok(task) => Json(TaskStatusResponse::from(task)).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn worker_heartbeat(
    State(state): State<Arc<AppState>>,
    Json(body): Json<HeartbeatBody>,
) -> Response {
    let request = HeartbeatRequest {
        worker_id: body.worker_id,
        endpoint: body.endpoint.unwrap_or_default(),
        jobs_in_progress: body.job_in_progress,
        reported_count: body.job_count,
        concurrency: body.concurrency,
        version: body.version,
    };
    match state.registry.process_heartbeat(&request).await {
        Ok(_) => StatusCode::OK.into_response(),
        Err(e) => error_response(&e),
    }
}

async fn worker_pull(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PullBody>,
) -> Response {
    let request = PullRequest {
        worker_id: body.worker_id,
        endpoint: body.endpoint.unwrap_or_default(),
        jobs_in_progress: body.job_in_progress,
        reported_count: None,
        concurrency: body.concurrency,
        version: body.version,
        batch_size: body.batch_size,
    };
    match state.dispatcher.pull(&request).await {
        Ok(jobs) => Json(PullResponse {
            jobs: jobs
                .into_iter()
                .map(|job| JobEntry {
                    id: job.id,
                    input: job.input.as_raw().to_owned(),
                })
                .collect(),
        })
        .into_response(),
        Err(e) => error_response(&e),
    }
}

async fn worker_result(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ResultBody>,
) -> Response {
    // The task ID may ride in the X-Request-ID header instead.
    let task_id = match body.task_id.or_else(|| {
        headers
            .get("X-Request-ID")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Uuid::parse_str(v).ok())
    }) {
        Some(id) => id,
        None => {
            return error_response(&DomainError::ValidationFailed(
                "task_id missing from body and X-Request-ID header".to_string(),
            ))
        }
    };

    if body.stop_pod == Some(true) {
        // Advisory only; the orchestrator owns pod shutdown.
        tracing::debug!(%task_id, "worker requested pod stop");
    }

    let submission = ResultSubmission {
        task_id,
        output: body.output.map(Payload::from),
        error: body.error,
    };
    match state.dispatcher.ingest_result(&submission).await {
        Ok(task) => Json(TaskStatusResponse::from(task)).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn worker_stream(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StreamBody>,
) -> Response {
    // Streaming chunks never touch the terminal-state machine; they
    // are relayed to the task's webhook when one is configured.
    match state.dispatcher.get_task(body.task_id).await {
        Ok(task) => {
            if let Some(url) = task.webhook_url {
                state.webhooks.dispatch_chunk(url, body.task_id, &body.output);
            }
            StatusCode::OK.into_response()
        }
        Err(e) => error_response(&e),
    }
}

async fn save_endpoint(
    State(state): State<Arc<AppState>>,
    Json(body): Json<EndpointSpec>,
) -> Response {
    let (metadata, autoscaler) = body.into_records();
    match state.endpoints.save(metadata, autoscaler).await {
        Ok(record) => Json(record).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn get_endpoint(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    match state.endpoints.get(&name).await {
        Ok(record) => Json(record).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn list_endpoints(State(state): State<Arc<AppState>>) -> Response {
    match state.endpoints.list().await {
        Ok(records) => Json(records).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn delete_endpoint(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    match state.endpoints.delete(&name).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(&e),
    }
}

async fn endpoint_stats(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    match state.endpoints.get_stats(&name).await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn health() -> StatusCode {
    StatusCode::OK
}

// ---------------------------------------------------------------------
// Router / server
// ---------------------------------------------------------------------

/// Build the API router.
pub fn build_router(state: Arc<AppState>, enable_cors: bool) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/submit", post(submit))
        .route("/submit/sync", post(submit_sync))
        .route("/status/{id}", get(task_status))
        .route("/cancel/{id}", post(cancel_task))
        .route("/worker/heartbeat", post(worker_heartbeat))
        .route("/worker/pull", post(worker_pull))
        .route("/worker/result", post(worker_result))
        .route("/worker/stream", post(worker_stream))
        .route("/endpoints", get(list_endpoints).put(save_endpoint))
        .route("/endpoints/{name}", get(get_endpoint).delete(delete_endpoint))
        .route("/endpoints/{name}/stats", get(endpoint_stats))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if enable_cors {
        router = router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }
    router
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve(
    state: Arc<AppState>,
    config: &ServerConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "http server listening");

    let router = build_router(state, config.enable_cors);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
