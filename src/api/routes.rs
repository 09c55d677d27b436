//! API route definitions

use crate::config::EvictionConfig;
use crate::models::ModelResolver;
use axum::{
    Router,
    routing::{delete, get, post},
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::handlers;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub resolver: Arc<ModelResolver>,
    /// Defaults for on-demand eviction
    pub eviction: EvictionConfig,
    pub settle_delay_ms: u64,
    pub prometheus_handle: metrics_exporter_prometheus::PrometheusHandle,
}

/// Create the main API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health and status
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        // Request preparation
        .route("/models/prepare", post(handlers::prepare_models))
        // Cache administration
        .route("/cache/stats", get(handlers::cache_stats))
        .route("/cache/evict", post(handlers::evict))
        .route("/cache/{bucket}", get(handlers::list_bucket))
        .route("/cache/{bucket}/{name}", delete(handlers::delete_entry))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}
