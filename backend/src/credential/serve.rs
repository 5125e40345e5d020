use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

use crate::config::AppState;
use crate::error::{AppError, Result};

use super::model::Credential;

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateCredentialRequest {
    pub alias: String,
    pub username: String,
    pub password: String,
    pub description: Option<String>,
}

/// Create a guest-credential preset
#[utoipa::path(
    post,
    path = "",
    request_body = CreateCredentialRequest,
    responses(
        (status = 201, description = "Credential created", body = Credential),
        (status = 400, description = "Missing alias, username, or password"),
    )
)]
async fn create_credential(
    State(state): State<AppState>,
    Json(req): Json<CreateCredentialRequest>,
) -> Result<(StatusCode, Json<Credential>)> {
    if req.alias.trim().is_empty() {
        return Err(AppError::Validation("alias must not be empty".to_string()));
    }
    if req.username.trim().is_empty() || req.password.is_empty() {
        return Err(AppError::Validation(
            "username and password are required".to_string(),
        ));
    }
    let sealed = state.secrets.seal(&req.password);
    let mut conn = state.conn()?;
    let credential = tokio::task::spawn_blocking(move || {
        Credential::create(
            &mut conn,
            &req.alias,
            &req.username,
            &sealed,
            req.description.as_deref(),
        )
    })
    .await??;
    Ok((StatusCode::CREATED, Json(credential)))
}

/// List guest-credential presets
#[utoipa::path(
    get,
    path = "",
    responses((status = 200, description = "Credentials", body = Vec<Credential>))
)]
async fn list_credentials(State(state): State<AppState>) -> Result<Json<Vec<Credential>>> {
    let mut conn = state.conn()?;
    let rows = tokio::task::spawn_blocking(move || Credential::list(&mut conn)).await??;
    Ok(Json(rows))
}

/// Delete a guest-credential preset
#[utoipa::path(
    delete,
    path = "/{id}",
    params(("id" = i32, Path, description = "Credential id")),
    responses(
        (status = 204, description = "Deleted"),
        (status = 404, description = "Credential not found"),
    )
)]
async fn delete_credential(State(state): State<AppState>, Path(id): Path<i32>) -> Result<StatusCode> {
    let mut conn = state.conn()?;
    tokio::task::spawn_blocking(move || Credential::delete(&mut conn, id)).await??;
    Ok(StatusCode::NO_CONTENT)
}

pub fn router() -> OpenApiRouter<AppState> {
    OpenApiRouter::new()
        .routes(routes!(create_credential))
        .routes(routes!(list_credentials))
        .routes(routes!(delete_credential))
}
