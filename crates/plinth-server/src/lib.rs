//! HTTP surface of the Plinth plugin host.
//!
//! Host routes (health, UI bundles, plugin administration) are registered
//! explicitly; every other request falls through to the plugin dispatcher.

pub mod api;
pub mod config;
pub mod state;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};

pub use config::ServerConfig;
pub use state::AppState;

#[derive(Serialize)]
struct ApiStatus {
    status: &'static str,
    version: &'static str,
}

async fn healthz() -> Json<ApiStatus> {
    Json(ApiStatus {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub fn build_router(state: AppState, config: &ServerConfig) -> Router {
    let api_routes = Router::new()
        .route("/bundles", get(api::bundles::list_bundles))
        .route("/bundles/{id}", get(api::bundles::get_bundle))
        .route("/admin/plugins", get(api::plugins::list_plugins))
        .route("/admin/plugins/rescan", post(api::plugins::rescan))
        .route("/admin/plugins/{id}", get(api::plugins::get_plugin))
        .route(
            "/admin/plugins/{id}/disable",
            post(api::plugins::disable_plugin),
        )
        .route(
            "/admin/plugins/{id}/enable",
            post(api::plugins::enable_plugin),
        )
        .route("/admin/routes", get(api::plugins::list_routes));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/api", api_routes)
        .fallback(api::dispatch::dispatch)
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&config.cors_origins))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::REFERRER_POLICY,
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        ))
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.is_empty() {
        tracing::warn!("PLINTH_CORS_ORIGINS not set, allowing any origin");
        AllowOrigin::any()
    } else {
        let origins: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|s| HeaderValue::from_str(s).ok())
            .collect();
        tracing::info!("CORS allowed origins: {:?}", origins);
        AllowOrigin::list(origins)
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(tower_http::cors::Any)
        .expose_headers(tower_http::cors::Any)
}
