//! UI bundle endpoints.

use axum::{
    extract::{Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use super::{error_response, ApiError};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct BundleListResponse {
    pub bundles: Vec<String>,
}

/// GET /api/bundles
pub async fn list_bundles(State(state): State<AppState>) -> Json<BundleListResponse> {
    Json(BundleListResponse {
        bundles: state.host.bundle_ids(),
    })
}

/// GET /api/bundles/{id}
pub async fn get_bundle(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let bundle = state.host.bundle(&id).ok_or_else(|| {
        error_response(StatusCode::NOT_FOUND, format!("no UI bundle for plugin {id}"))
    })?;
    let content_type = HeaderValue::from_str(&bundle.content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
        ],
        bundle.bytes,
    )
        .into_response())
}
