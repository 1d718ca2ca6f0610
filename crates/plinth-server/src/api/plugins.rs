//! Plugin administration endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use plinth_host::{PluginStatus, RescanReport, RoutesSnapshot, UnloadReport};
use serde::Serialize;

use super::{host_error, ApiError};
use crate::state::AppState;

// ─── Response types ─────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct PluginListResponse {
    pub plugins: Vec<PluginStatus>,
}

#[derive(Debug, Serialize)]
pub struct DisableResponse {
    pub plugin: String,
    #[serde(flatten)]
    pub report: UnloadReport,
}

// ─── Handlers ───────────────────────────────────────────────────────────

/// GET /api/admin/plugins
pub async fn list_plugins(State(state): State<AppState>) -> Json<PluginListResponse> {
    Json(PluginListResponse {
        plugins: state.host.statuses().await,
    })
}

/// GET /api/admin/plugins/{id}
pub async fn get_plugin(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PluginStatus>, ApiError> {
    state
        .host
        .status(&id)
        .await
        .map(Json)
        .map_err(|e| host_error(&e))
}

/// GET /api/admin/routes
pub async fn list_routes(State(state): State<AppState>) -> Json<RoutesSnapshot> {
    Json(state.host.routes())
}

/// POST /api/admin/plugins/rescan
pub async fn rescan(State(state): State<AppState>) -> Result<Json<RescanReport>, ApiError> {
    let report = state.host.rescan().await.map_err(|e| {
        tracing::error!("admin rescan failed: {e}");
        host_error(&e)
    })?;
    Ok(Json(report))
}

/// POST /api/admin/plugins/{id}/disable
///
/// 200 once unloaded, 202 while calls are still draining, 409 when the
/// library refused to close.
pub async fn disable_plugin(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<DisableResponse>), ApiError> {
    let report = state.host.disable(&id).await.map_err(|e| host_error(&e))?;
    let status = match report {
        UnloadReport::Unloaded => StatusCode::OK,
        UnloadReport::Pending { .. } => StatusCode::ACCEPTED,
        UnloadReport::Blocked { .. } => StatusCode::CONFLICT,
    };
    Ok((status, Json(DisableResponse { plugin: id, report })))
}

/// POST /api/admin/plugins/{id}/enable
pub async fn enable_plugin(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RescanReport>, ApiError> {
    state
        .host
        .enable(&id)
        .await
        .map(Json)
        .map_err(|e| host_error(&e))
}
