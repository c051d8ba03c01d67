pub mod auth;
pub mod error;
pub mod matches;
pub mod proposals;
pub mod search;
pub mod ws;

use axum::{
    extract::State,
    http::{HeaderValue, Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::engine::MatchEngine;

pub use error::{ApiError, ApiResult};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<MatchEngine>,
    /// Absent when no Prometheus recorder was installed (tests).
    pub metrics_handle: Option<PrometheusHandle>,
}

pub fn create_router(state: AppState, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .route("/ws", get(ws::ws_handler))
        .route("/api/search/start", post(search::start_search))
        .route("/api/search/cancel", post(search::cancel_search))
        .route("/api/proposals/{id}/respond", post(proposals::respond_proposal))
        .route("/api/matches/{id}", get(matches::get_match))
        .route("/api/matches/{id}/reveal", post(matches::request_reveal))
        .route("/api/matches/{id}/end", post(matches::end_match))
        .route("/api/matches/{id}/messages", post(matches::record_message))
        .layer(create_cors_layer(allowed_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn create_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .allow_credentials(false);

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();

    if origins.is_empty() {
        // Default to permissive for development
        cors.allow_origin(Any)
    } else {
        cors.allow_origin(origins)
    }
}

/// Liveness plus shared-store reachability. A down store means new searches
/// fail closed, so the instance reports itself degraded.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let store_ok = state.engine.store().ping().await.is_ok();
    let status = if store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "status": if store_ok { "healthy" } else { "degraded" },
            "store": if store_ok { "reachable" } else { "unreachable" },
            "process_id": state.engine.dispatcher().process_id(),
            "local_connections": state.engine.dispatcher().local_connections(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })),
    )
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics_handle {
        Some(handle) => (StatusCode::OK, handle.render()).into_response(),
        None => Json(state.engine.metrics().snapshot()).into_response(),
    }
}
