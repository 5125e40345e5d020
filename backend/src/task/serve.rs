use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::{IntoParams, ToSchema};
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

use crate::config::AppState;
use crate::error::Result;

use super::model::TaskRow;

#[derive(Debug, Serialize, ToSchema)]
pub struct TaskResponse {
    pub id: String,
    pub kind: String,
    pub target_id: Option<String>,
    pub status: String,
    pub progress: i32,
    pub message: String,
    pub result: Option<Value>,
    pub created_at: chrono::NaiveDateTime,
    pub updated_at: chrono::NaiveDateTime,
}

impl From<TaskRow> for TaskResponse {
    fn from(row: TaskRow) -> Self {
        TaskResponse {
            status: row.status().as_str().to_string(),
            result: row.result(),
            id: row.id,
            kind: row.kind,
            target_id: row.target_id,
            progress: row.progress,
            message: row.message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct TaskListQuery {
    pub status: Option<String>,
    pub kind: Option<String>,
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_page_size")]
    pub page_size: i64,
}

fn default_page() -> i64 {
    1
}

fn default_page_size() -> i64 {
    20
}

/// List tasks, most recent first
#[utoipa::path(
    get,
    path = "",
    params(TaskListQuery),
    responses((status = 200, description = "Tasks", body = Vec<TaskResponse>))
)]
async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<TaskListQuery>,
) -> Result<Json<Vec<TaskResponse>>> {
    let mut conn = state.conn()?;
    let rows = tokio::task::spawn_blocking(move || {
        TaskRow::list(
            &mut conn,
            query.status.as_deref(),
            query.kind.as_deref(),
            query.page,
            query.page_size,
        )
    })
    .await??;
    Ok(Json(rows.into_iter().map(TaskResponse::from).collect()))
}

/// Get a single task by id
#[utoipa::path(
    get,
    path = "/{id}",
    params(("id" = String, Path, description = "Task id")),
    responses(
        (status = 200, description = "Task found", body = TaskResponse),
        (status = 404, description = "Task not found"),
    )
)]
async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<TaskResponse>> {
    let mut conn = state.conn()?;
    let row = tokio::task::spawn_blocking(move || TaskRow::get(&mut conn, &id)).await??;
    Ok(Json(row.into()))
}

pub fn router() -> OpenApiRouter<AppState> {
    OpenApiRouter::new()
        .routes(routes!(list_tasks))
        .routes(routes!(get_task))
}
