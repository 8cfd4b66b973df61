//! API route definitions

use crate::lifecycle::NimManager;
use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::handlers;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<NimManager>,
    pub prometheus_handle: metrics_exporter_prometheus::PrometheusHandle,
}

/// Create the main API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health and status
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        // Model status
        .route("/models", get(handlers::list_models))
        .route("/models/{model}", get(handlers::get_model))
        .route("/models/{model}/port", get(handlers::get_port))
        // Model lifecycle
        .route("/models/{model}/deploy", post(handlers::deploy_model))
        .route("/models/{model}/stop", post(handlers::stop_model))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}
