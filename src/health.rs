//! Liveness HTTP endpoint (C11): `/healthz` and `/metrics`.

use axum::{routing::get, Json, Router};
use tower_http::cors::CorsLayer;

use crate::metrics;

pub fn router() -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "callback-delivery",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn metrics_handler() -> Result<String, axum::http::StatusCode> {
    metrics::render().map_err(|e| {
        tracing::error!(error = %e, "failed to render metrics");
        axum::http::StatusCode::INTERNAL_SERVER_ERROR
    })
}
