//! API layer - routes, handlers, and middleware

pub mod extractors;
pub mod handlers;
pub mod middleware;
pub mod routes;

use crate::state::AppState;
use axum::{
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde_json::json;

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    let max_body_size = state.config.server.max_request_body_size;
    let cors_origins = state.config.server.cors_origins.clone();

    Router::new()
        .route("/health", get(health_check))
        .route("/", get(root))
        .route("/favicon.ico", get(favicon))
        .merge(routes::metrics::metrics_routes())
        .nest("/api", routes::api::api_routes())
        .nest("/admin", routes::admin::admin_routes())
        .with_state(state)
        // Applied in reverse order: the body limit runs first, security headers last
        .layer(axum::middleware::from_fn(
            middleware::security_headers_middleware,
        ))
        .layer(axum::middleware::from_fn(middleware::request_id_middleware))
        .layer(axum::middleware::from_fn(middleware::metrics_middleware))
        .layer(middleware::compression())
        .layer(middleware::cors(&cors_origins))
        .layer(middleware::trace())
        .layer(DefaultBodyLimit::max(max_body_size))
}

/// Liveness plus a storage round trip
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.list_wards().await {
        Ok(wards) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "service": "wardline",
                "wards": wards.len(),
            })),
        ),
        Err(e) => {
            tracing::error!(error = %e, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unavailable",
                    "service": "wardline",
                })),
            )
        }
    }
}

async fn root(State(state): State<AppState>) -> impl IntoResponse {
    let backend = state.store.backend();
    Json(json!({
        "server": "wardline",
        "version": env!("CARGO_PKG_VERSION"),
        "backend": backend,
        "status": "running"
    }))
}

async fn favicon() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}
