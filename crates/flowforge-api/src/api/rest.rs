use crate::AppState;
use axum::{
    extract::{rejection::JsonRejection, MatchedPath, Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use flowforge_core::{Task, TaskError, TaskId, TaskStatus};
use flowforge_store::{StatusCounts, StoreError};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::{error, warn};

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

/// REST API routes
pub fn create_rest_api(state: AppState) -> Router {
    Router::new()
        .route("/tasks", get(list_tasks).post(submit_task))
        .route("/tasks/:id", get(get_task))
        .route("/stats", get(get_stats))
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route_layer(middleware::from_fn_with_state(state.clone(), track_requests))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct SubmitTaskRequest {
    payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct SubmitTaskResponse {
    id: TaskId,
    status: TaskStatus,
}

#[derive(Debug, Deserialize)]
struct ListTasksQuery {
    status: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    #[serde(flatten)]
    counts: StatusCounts,
    total: u64,
}

/// Submit a new task
async fn submit_task(
    State(state): State<AppState>,
    body: Result<Json<SubmitTaskRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitTaskResponse>), ApiError> {
    let Json(req) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let task = state.queue.submit(req.payload).await?;
    state.metrics.tasks_submitted_total.inc();

    Ok((
        StatusCode::CREATED,
        Json(SubmitTaskResponse {
            id: task.id,
            status: task.status,
        }),
    ))
}

/// Get task by ID
async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    let id = TaskId::parse_str(&id)
        .map_err(|_| ApiError::BadRequest(format!("Invalid task id: {}", id)))?;
    let task = state.queue.get(id).await?;
    Ok(Json(task))
}

/// List tasks newest first
async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListTasksQuery>,
) -> Result<Json<Vec<Task>>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(TaskStatus::from_str)
        .transpose()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT);
    let offset = query.offset.unwrap_or(0);
    if i64::try_from(offset).is_err() {
        return Err(ApiError::BadRequest(format!("offset {} is out of range", offset)));
    }

    let tasks = state.queue.list(status, limit, offset).await?;
    Ok(Json(tasks))
}

async fn get_stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let counts = state.queue.counts().await?;
    state.metrics.update_task_counts(&counts);
    Ok(Json(StatsResponse {
        total: counts.total(),
        counts,
    }))
}

/// Liveness: answers without touching the store
async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "api-service",
    }))
}

/// Readiness: the store must answer a ping
async fn readiness_check(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let backend = state.queue.backend();
    backend
        .ping()
        .await
        .map_err(|e| ApiError::Unavailable(e.to_string()))?;

    Ok(Json(serde_json::json!({
        "status": "ready",
        "store": backend.name(),
    })))
}

async fn track_requests(
    State(state): State<AppState>,
    matched: Option<MatchedPath>,
    request: Request,
    next: Next,
) -> Response {
    let route = matched
        .as_ref()
        .map(MatchedPath::as_str)
        .unwrap_or("unmatched")
        .to_string();
    let response = next.run(request).await;
    state
        .metrics
        .record_request(&route, response.status().as_u16());
    response
}

/// API error types
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unavailable(String),
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::TaskNotFound(_) => ApiError::NotFound(err.to_string()),
            StoreError::Task(TaskError::PayloadTooLarge { .. })
            | StoreError::Task(TaskError::Serialization(_)) => {
                ApiError::BadRequest(err.to_string())
            }
            e if e.is_transient() => ApiError::Unavailable(e.to_string()),
            e => ApiError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unavailable(msg) => {
                warn!("Store unavailable: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, msg)
            }
            ApiError::Internal(msg) => {
                error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = Json(serde_json::json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}
