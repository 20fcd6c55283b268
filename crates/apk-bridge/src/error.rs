use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::record::ArtifactStatus;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("APK not found or not downloaded")]
    NotFound,

    #[error("APK not downloaded yet")]
    NotDownloaded,

    #[error("APK file not found")]
    FileMissing,

    #[error("cannot move from {from} to {to}")]
    InvalidTransition {
        from: ArtifactStatus,
        to: ArtifactStatus,
    },

    #[error("download failed with HTTP {0}")]
    Http(reqwest::StatusCode),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("platform action failed: {0}")]
    Platform(#[source] anyhow::Error),

    #[error("storage error: {0}")]
    Storage(String),
}

impl BridgeError {
    fn status_code(&self) -> StatusCode {
        match self {
            BridgeError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            BridgeError::NotFound => StatusCode::NOT_FOUND,
            BridgeError::NotDownloaded
            | BridgeError::FileMissing
            | BridgeError::InvalidTransition { .. } => StatusCode::CONFLICT,
            BridgeError::Http(_) | BridgeError::Network(_) => StatusCode::BAD_GATEWAY,
            BridgeError::Io(_) | BridgeError::Platform(_) | BridgeError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("[Bridge] {self}");
        }
        (
            status,
            Json(json!({ "success": false, "error": self.to_string() })),
        )
            .into_response()
    }
}
