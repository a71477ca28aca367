//! Axum router configuration

use axum::{
    http::{header, Method},
    routing::get,
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

use super::handlers::{
    cache_status, get_config, health_check, index_page, post_config, recordings, recordings_dates,
    stream_ws,
};

/// Create the Axum router with all routes
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::ACCEPT, header::CONTENT_TYPE, header::ORIGIN])
        .max_age(Duration::from_secs(3600));

    Router::new()
        .route("/", get(index_page))
        .route("/health", get(health_check))
        .route("/api/v1/config", get(get_config).post(post_config))
        .route("/api/v1/cache/status", get(cache_status))
        .route("/api/v1/recordings/dates", get(recordings_dates))
        .route("/api/v1/recordings", get(recordings))
        .route("/api/v1/stream", get(stream_ws))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
