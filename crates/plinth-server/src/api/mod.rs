pub mod bundles;
pub mod dispatch;
pub mod plugins;

use axum::{http::StatusCode, Json};
use plinth_host::{DispatchError, HostError};

/// Error response shared by every endpoint: a status and `{"error": ...}`.
pub type ApiError = (StatusCode, Json<serde_json::Value>);

pub fn error_response(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(serde_json::json!({ "error": message.into() })),
    )
}

pub fn dispatch_error(err: &DispatchError) -> ApiError {
    let status = match err {
        DispatchError::NotFound { .. } => StatusCode::NOT_FOUND,
        DispatchError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        DispatchError::HandlerFault { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, err.to_string())
}

pub fn host_error(err: &HostError) -> ApiError {
    let status = match err {
        HostError::NotFound(_) => StatusCode::NOT_FOUND,
        HostError::ShutDown => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, err.to_string())
}
