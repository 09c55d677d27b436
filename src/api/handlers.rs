//! API request handlers

use super::models::{
    BucketListing, EvictRequest, EvictResponse, HealthResponse, PrepareRequest, PrepareResponse,
    StatsResponse,
};
use super::routes::AppState;
use crate::error::ApiError;
use crate::models::{Bucket, ModelRequest, build_prompt_fragment};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};

/// GET /health - Service health check
pub async fn health() -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            timestamp: chrono::Utc::now(),
        }),
    )
}

/// GET /metrics - Prometheus metrics
pub async fn metrics(State(state): State<AppState>) -> String {
    state.prometheus_handle.render()
}

/// POST /models/prepare - Resolve a request's models to local paths
pub async fn prepare_models(
    State(state): State<AppState>,
    Json(req): Json<PrepareRequest>,
) -> Json<PrepareResponse> {
    let request = ModelRequest {
        checkpoint: req.checkpoint,
        loras: req.loras,
        embeddings: req.embeddings,
    };

    let prepared = state.resolver.prepare(&request).await;
    let prompt = build_prompt_fragment(req.prompt.as_deref().unwrap_or_default(), &prepared.loras);
    let stats = state.resolver.stats().await;

    tracing::info!(
        checkpoint = ?prepared.checkpoint,
        loras = prepared.loras.len(),
        embeddings = prepared.embeddings.len(),
        downloaded = prepared.downloaded,
        failures = prepared.failures.len(),
        "Prepared models for request"
    );

    Json(PrepareResponse::new(
        prepared,
        prompt,
        state.settle_delay_ms,
        &stats,
    ))
}

/// GET /cache/stats - Per-bucket counts, sizes and volume usage
pub async fn cache_stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let stats = state.resolver.stats().await;
    let paths = state.resolver.paths();

    Json(StatsResponse {
        buckets: stats,
        total_size_bytes: stats.total_size_bytes(),
        registry_file: paths.registry_file.clone(),
        disk: crate::disk::disk_usage(&paths.root),
    })
}

/// GET /cache/{bucket} - List entries of one bucket
pub async fn list_bucket(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
) -> Result<Json<BucketListing>, ApiError> {
    let bucket: Bucket = bucket.parse()?;
    let entries = state.resolver.registry().entries(bucket).await;

    Ok(Json(BucketListing::new(bucket, entries)))
}

/// DELETE /cache/{bucket}/{name} - Drop an entry and its file
pub async fn delete_entry(
    State(state): State<AppState>,
    Path((bucket, name)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let bucket: Bucket = bucket.parse()?;

    match state.resolver.invalidate(bucket, &name).await? {
        Some(_) => Ok(StatusCode::NO_CONTENT),
        None => Err(ApiError::NotFound(format!(
            "No cached model '{}' in {}",
            name, bucket
        ))),
    }
}

/// POST /cache/evict - Run an eviction pass now
pub async fn evict(
    State(state): State<AppState>,
    body: Option<Json<EvictRequest>>,
) -> Result<Json<EvictResponse>, ApiError> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let max_age_days = req.max_age_days.unwrap_or(state.eviction.max_age_days);
    let keep_popular = req.keep_popular.unwrap_or(state.eviction.keep_popular);

    let report = state.resolver.evict(max_age_days, keep_popular).await?;

    Ok(Json(EvictResponse {
        max_age_days,
        keep_popular,
        report,
    }))
}
