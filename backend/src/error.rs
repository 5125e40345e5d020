use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// The system's error kinds (spec.md §7), each carrying a human-readable
/// message. Request handlers turn these into HTTP responses via
/// `IntoResponse`; background workers turn them into a terminal `Task` row
/// instead (see `virtualization::worker`).
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Auth(String),

    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    Hypervisor(String),

    /// Guest-ops script failure. Never fatal to an overall clone task
    /// (spec.md §7) — surfaced only inside the clone result.
    #[error("{0}")]
    GuestOps(String),

    #[error("{0}")]
    Exec(String),

    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Auth(_) => StatusCode::BAD_REQUEST,
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Hypervisor(_) => StatusCode::BAD_GATEWAY,
            AppError::GuestOps(_) => StatusCode::BAD_GATEWAY,
            AppError::Exec(_) => StatusCode::BAD_GATEWAY,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::error!(kind = ?self, "request failed");
        let status = self.status_code();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<diesel::result::Error> for AppError {
    fn from(err: diesel::result::Error) -> Self {
        match err {
            diesel::result::Error::NotFound => AppError::NotFound("not found".to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<diesel::r2d2::PoolError> for AppError {
    fn from(err: diesel::r2d2::PoolError) -> Self {
        AppError::Internal(format!("database pool error: {err}"))
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(err: tokio::task::JoinError) -> Self {
        AppError::Internal(format!("background task panicked: {err}"))
    }
}

impl From<esxi_client::HypervisorError> for AppError {
    fn from(err: esxi_client::HypervisorError) -> Self {
        match err {
            esxi_client::HypervisorError::Auth { .. } => AppError::Auth(err.to_string()),
            esxi_client::HypervisorError::Timeout { .. } => AppError::Timeout(err.to_string()),
            esxi_client::HypervisorError::VmNotFound { .. } => AppError::NotFound(err.to_string()),
            _ => AppError::Hypervisor(err.to_string()),
        }
    }
}
