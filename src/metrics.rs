//! Prometheus metrics

use crate::models::{Bucket, CacheStats};
use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Setup Prometheus metrics exporter
/// Returns a handle that can be used to retrieve metrics
pub fn setup_metrics() -> Result<metrics_exporter_prometheus::PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    tracing::info!("Prometheus metrics exporter installed");

    Ok(handle)
}

/// Record a reference served from the cache
pub fn record_cache_hit(bucket: Bucket) {
    metrics::counter!("sd_cache_hits_total", "bucket" => bucket.as_str()).increment(1);
}

/// Record a reference that needed a download
pub fn record_cache_miss(bucket: Bucket) {
    metrics::counter!("sd_cache_misses_total", "bucket" => bucket.as_str()).increment(1);
}

/// Record a finished download attempt
pub fn record_download(bucket: Bucket, success: bool) {
    let outcome = if success { "success" } else { "failure" };
    metrics::counter!("sd_cache_downloads_total",
        "bucket" => bucket.as_str(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_downloaded_bytes(bytes: u64) {
    metrics::counter!("sd_cache_downloaded_bytes_total").increment(bytes);
}

pub fn record_integrity_failure() {
    metrics::counter!("sd_cache_integrity_failures_total").increment(1);
}

pub fn record_registry_reset() {
    metrics::counter!("sd_cache_registry_resets_total").increment(1);
}

pub fn record_evictions(bucket: Bucket, count: usize) {
    metrics::counter!("sd_cache_evictions_total", "bucket" => bucket.as_str())
        .increment(count as u64);
}

/// Update per-bucket entry and size gauges
pub fn update_bucket_gauges(stats: &CacheStats) {
    for bucket in Bucket::ALL {
        let s = stats.bucket(bucket);
        metrics::gauge!("sd_cache_entries", "bucket" => bucket.as_str()).set(s.count as f64);
        metrics::gauge!("sd_cache_size_bytes", "bucket" => bucket.as_str())
            .set(s.total_size_bytes as f64);
    }
}
