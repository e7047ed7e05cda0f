use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use edgemesh_core::coordinator::{Coordinator, JobFilter, NodeRegistration, TaskSpec};
use edgemesh_core::error::{CoordError, ErrorKind};
use edgemesh_db::models::{JobStatus, MetricsSample, NodePolicy, TaskType};

use crate::streams;

/// Header agents must present when a shared secret is configured.
pub const SECRET_HEADER: &str = "x-edgemesh-secret";

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub shared_secret: Option<String>,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    kind: ErrorKind,
    message: String,
}

impl From<CoordError> for AppError {
    fn from(err: CoordError) -> Self {
        let status = match err.kind() {
            ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            kind: err.kind(),
            message: format!("{err:#}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": { "kind": self.kind, "message": self.message }
        });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct HeartbeatRequest {
    node_id: String,
    metrics: MetricsSample,
}

#[derive(Debug, Deserialize)]
struct PullRequest {
    node_id: String,
}

#[derive(Debug, Deserialize)]
struct SubmitResultRequest {
    node_id: String,
    success: bool,
    duration_ms: i64,
    #[serde(default)]
    output: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateJobRequest {
    #[serde(rename = "type")]
    job_type: TaskType,
    #[serde(default)]
    tasks: Option<Vec<TaskSpec>>,
    #[serde(default)]
    task_count: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct JobStatusRequest {
    status: JobStatus,
}

#[derive(Debug, Deserialize)]
struct SimulateRequest {
    task_type: TaskType,
    #[serde(default)]
    requires_gpu: bool,
}

fn default_history_limit() -> i64 {
    50
}

#[derive(Debug, Deserialize)]
struct NodeDetailQuery {
    #[serde(default)]
    include_metrics_history: bool,
    #[serde(default = "default_history_limit")]
    history_limit: i64,
}

fn default_burst_count() -> usize {
    20
}

fn default_burst_tasks() -> usize {
    1
}

#[derive(Debug, Deserialize)]
struct BurstQuery {
    #[serde(default = "default_burst_count")]
    count: usize,
    #[serde(default = "default_burst_tasks")]
    tasks_per_job: usize,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    // Agent and task endpoints sit behind the shared-secret gate.
    let gated = Router::new()
        .route("/v1/agent/register", post(register))
        .route("/v1/agent/heartbeat", post(heartbeat))
        .route("/v1/tasks/pull", post(pull_task))
        .route("/v1/tasks/{id}/result", post(submit_result))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_shared_secret,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/v1/nodes", get(list_nodes))
        .route("/v1/nodes/{id}", get(get_node))
        .route("/v1/nodes/{id}/policy", put(set_policy))
        .route("/v1/cluster/summary", get(cluster_summary))
        .route("/v1/simulate/schedule", post(simulate_schedule))
        .route("/v1/metrics/execution", get(execution_metrics))
        .route("/v1/jobs", post(create_job).get(list_jobs))
        .route("/v1/jobs/{id}", get(get_job))
        .route("/v1/jobs/{id}/tasks", get(get_job_tasks))
        .route("/v1/jobs/{id}/status", post(set_job_status))
        .route("/v1/demo/jobs/create-embed-burst", post(demo_embed_burst))
        .route("/v1/stream/nodes", get(streams::stream_nodes))
        .route("/v1/stream/jobs", get(streams::stream_jobs))
        .merge(gated)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(
    state: AppState,
    bind: &str,
    port: u16,
    cancel: CancellationToken,
) -> Result<()> {
    let app = build_router(state);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("edgemesh coordinator listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let shutdown = {
        let cancel = cancel.clone();
        async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => cancel.cancel(),
                _ = cancel.cancelled() => {}
            }
        }
    };
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    cancel.cancel();
    tracing::info!("edgemesh coordinator shut down");
    Ok(())
}

// ---------------------------------------------------------------------------
// Shared-secret gate
// ---------------------------------------------------------------------------

async fn require_shared_secret(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(secret) = &state.shared_secret {
        let provided = request
            .headers()
            .get(SECRET_HEADER)
            .and_then(|value| value.to_str().ok());
        if provided != Some(secret.as_str()) {
            return AppError::from(CoordError::Unauthorized).into_response();
        }
    }
    next.run(request).await
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn list_nodes(State(state): State<AppState>) -> Result<Response, AppError> {
    let nodes = state.coordinator.list_nodes().await?;
    Ok(Json(nodes).into_response())
}

async fn get_node(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    Query(query): Query<NodeDetailQuery>,
) -> Result<Response, AppError> {
    let view = state
        .coordinator
        .get_node(&node_id, query.include_metrics_history, query.history_limit)
        .await?;
    Ok(Json(view).into_response())
}

async fn set_policy(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    Json(policy): Json<NodePolicy>,
) -> Result<Response, AppError> {
    let node = state
        .coordinator
        .set_policy(&node_id, &policy, Utc::now())
        .await?;
    Ok(Json(node).into_response())
}

async fn cluster_summary(State(state): State<AppState>) -> Result<Response, AppError> {
    let summary = state.coordinator.cluster_summary(Utc::now()).await?;
    Ok(Json(summary).into_response())
}

async fn simulate_schedule(
    State(state): State<AppState>,
    Json(request): Json<SimulateRequest>,
) -> Result<Response, AppError> {
    let ranked = state
        .coordinator
        .simulate_schedule(request.task_type, request.requires_gpu, Utc::now())
        .await?;
    Ok(Json(ranked).into_response())
}

async fn execution_metrics(State(state): State<AppState>) -> Result<Response, AppError> {
    let metrics = state.coordinator.execution_metrics().await?;
    Ok(Json(metrics).into_response())
}

async fn register(
    State(state): State<AppState>,
    Json(registration): Json<NodeRegistration>,
) -> Result<Response, AppError> {
    let node = state
        .coordinator
        .register_node(&registration, Utc::now())
        .await?;
    Ok(Json(node).into_response())
}

async fn heartbeat(
    State(state): State<AppState>,
    Json(request): Json<HeartbeatRequest>,
) -> Result<Response, AppError> {
    let node = state
        .coordinator
        .heartbeat(&request.node_id, &request.metrics, Utc::now())
        .await?;
    Ok(Json(node).into_response())
}

async fn pull_task(
    State(state): State<AppState>,
    Json(request): Json<PullRequest>,
) -> Result<Response, AppError> {
    // No work is an empty 200, never an error.
    let body = match state
        .coordinator
        .pull_task(&request.node_id, Utc::now())
        .await?
    {
        Some(task) => serde_json::json!({ "task": task }),
        None => serde_json::json!({}),
    };
    Ok(Json(body).into_response())
}

async fn submit_result(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
    Json(request): Json<SubmitResultRequest>,
) -> Result<Response, AppError> {
    let (ack, task) = state
        .coordinator
        .submit_result(
            task_id,
            &request.node_id,
            request.success,
            request.output.as_ref(),
            request.duration_ms,
            request.error.as_deref(),
            Utc::now(),
        )
        .await?;
    Ok(Json(serde_json::json!({ "status": ack, "task": task })).into_response())
}

async fn create_job(
    State(state): State<AppState>,
    Json(request): Json<CreateJobRequest>,
) -> Result<Response, AppError> {
    let specs = match (request.tasks, request.task_count) {
        (Some(_), Some(_)) => {
            return Err(CoordError::bad_request("tasks and task_count are mutually exclusive").into())
        }
        (Some(tasks), None) => tasks,
        (None, Some(count)) => empty_specs(count),
        (None, None) => {
            return Err(CoordError::bad_request("either tasks or task_count is required").into())
        }
    };

    let view = state
        .coordinator
        .create_job(request.job_type, &specs, Utc::now())
        .await?;
    Ok((StatusCode::CREATED, Json(view)).into_response())
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(filter): Query<JobFilter>,
) -> Result<Response, AppError> {
    let jobs = state.coordinator.list_jobs(&filter).await?;
    Ok(Json(jobs).into_response())
}

async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Response, AppError> {
    let view = state.coordinator.get_job(job_id).await?;
    Ok(Json(view).into_response())
}

async fn get_job_tasks(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Response, AppError> {
    let tasks = state.coordinator.get_job_tasks(job_id).await?;
    Ok(Json(tasks).into_response())
}

async fn set_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    Json(request): Json<JobStatusRequest>,
) -> Result<Response, AppError> {
    // Cancel is the only operator-settable status; everything else is
    // derived from task state.
    if request.status != JobStatus::Cancelled {
        return Err(CoordError::bad_request("only status \"cancelled\" can be set").into());
    }
    let view = state.coordinator.cancel_job(job_id, Utc::now()).await?;
    Ok(Json(view).into_response())
}

async fn demo_embed_burst(
    State(state): State<AppState>,
    Query(query): Query<BurstQuery>,
) -> Result<Response, AppError> {
    if query.count == 0 || query.tasks_per_job == 0 {
        return Err(CoordError::bad_request("count and tasks_per_job must be >= 1").into());
    }

    let mut job_ids = Vec::with_capacity(query.count);
    for _ in 0..query.count {
        let view = state
            .coordinator
            .create_job(
                TaskType::Embeddings,
                &empty_specs(query.tasks_per_job),
                Utc::now(),
            )
            .await?;
        job_ids.push(view.job.id);
    }
    Ok(Json(serde_json::json!({ "jobs": job_ids })).into_response())
}

fn empty_specs(count: usize) -> Vec<TaskSpec> {
    (0..count)
        .map(|i| TaskSpec {
            payload: serde_json::json!({ "index": i }),
            max_retries: None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
