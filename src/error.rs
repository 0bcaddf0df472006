//! Error types for lifecycle operations and API responses

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

/// Errors surfaced by the lifecycle manager and the control API.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// The configured llama-server binary does not exist on disk.
    #[error("llama-server binary not found at: {path}")]
    BinaryNotFound { path: String },

    /// The requested port is already bound or already claimed by a
    /// managed instance.
    #[error("port {port} is already in use")]
    PortUnavailable { port: u16 },

    /// The OS accepted the spawn but the server never came up, or the
    /// spawn itself failed.
    #[error("failed to spawn llama-server: {message}")]
    SpawnFailed { message: String },

    /// A referenced resource (model file) does not exist.
    #[error("{0}")]
    NotFound(String),

    /// The OS process-table query failed. Always recovered locally to an
    /// empty scan; never returned through the API.
    #[error("process table scan failed: {message}")]
    ScanFailure { message: String },

    /// Malformed or out-of-range request input.
    #[error("{0}")]
    InvalidInput(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ManagerError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ManagerError::InvalidInput(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ManagerError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ManagerError::PortUnavailable { .. } => (StatusCode::CONFLICT, self.to_string()),
            ManagerError::BinaryNotFound { .. }
            | ManagerError::SpawnFailed { .. }
            | ManagerError::ScanFailure { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            ManagerError::Internal(err) => {
                tracing::error!(error = %err, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(ErrorResponse {
            error: message,
            timestamp: chrono::Utc::now(),
        });

        (status, body).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    timestamp: chrono::DateTime<chrono::Utc>,
}
