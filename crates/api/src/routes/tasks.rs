//! Task progress routes for callers that poll instead of waiting for the
//! callback.

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{ItemRecord, TaskRecord};

use crate::middleware::account::RequestAccount;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct TaskView {
    pub task: TaskRecord,
    pub items: Vec<ItemRecord>,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/api/tasks/{id}", get(get_task))
}

/// GET /api/tasks/{id}: task progress plus the items persisted so far.
async fn get_task(
    State(state): State<AppState>,
    RequestAccount(account): RequestAccount,
    Path(id): Path<Uuid>,
) -> Result<Json<TaskView>, AppError> {
    let task = state
        .store
        .get_task(id)
        .await?
        .filter(|t| t.executor_id == account.id)
        .ok_or_else(|| AppError::NotFound(format!("Task {} not found", id)))?;

    let items = state.store.items_for_task(id).await?;
    Ok(Json(TaskView { task, items }))
}
