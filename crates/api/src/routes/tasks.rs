//! Task submission and administration routes.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{NewTask, RescheduleTask, Task, TaskStatusView};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route(
            "/api/tasks/{id}",
            get(get_task).patch(reschedule_task).delete(delete_task),
        )
        .route("/api/tasks/{id}/status", get(get_task_status))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub skip: Option<i64>,
    pub limit: Option<i64>,
}

/// POST /api/tasks: Submit a notification task for delivery.
///
/// 503 when the dispatch queue is down; the task is not kept in that case.
async fn create_task(
    State(state): State<AppState>,
    Json(new_task): Json<NewTask>,
) -> Result<(StatusCode, Json<Task>), AppError> {
    let task = state.service.submit(new_task).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

/// GET /api/tasks: List tasks, newest first.
async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Task>>, AppError> {
    let tasks = state.service.list(query.skip, query.limit).await?;
    Ok(Json(tasks))
}

/// GET /api/tasks/:id: Full task record.
async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Task>, AppError> {
    Ok(Json(state.service.get(id).await?))
}

/// GET /api/tasks/:id/status: Delivery status of a task.
async fn get_task_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TaskStatusView>, AppError> {
    Ok(Json(state.service.get_status(id).await?))
}

/// PATCH /api/tasks/:id: Move a pending task to a new delivery time.
///
/// 409 once the task has been claimed.
async fn reschedule_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<RescheduleTask>,
) -> Result<Json<Task>, AppError> {
    Ok(Json(state.service.reschedule(id, body.scheduled_at).await?))
}

/// DELETE /api/tasks/:id: Remove a task that is not being delivered.
async fn delete_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Task>, AppError> {
    Ok(Json(state.service.delete(id).await?))
}
