//! Age and popularity based pruning of the cache
//!
//! Each bucket is handled on its own: the `keep_popular` most used entries
//! always stay, everything else unused for `max_age_days` is removed along
//! with its file. Runs inside the registry critical section.

use super::reference::Bucket;
use super::registry::{CacheEntry, ModelRegistry};
use super::resolver::remove_file_if_exists;
use crate::error::CacheResult;
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::{Duration, interval};

/// One removed entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictedModel {
    pub bucket: Bucket,
    pub name: String,
    pub file_size_bytes: u64,
}

/// What an eviction pass removed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictionReport {
    pub removed: Vec<EvictedModel>,
    pub freed_bytes: u64,
}

/// Prune every bucket of `registry`
pub async fn evict(
    registry: &ModelRegistry,
    max_age_days: u32,
    keep_popular: usize,
) -> CacheResult<EvictionReport> {
    let cutoff = Utc::now() - ChronoDuration::days(i64::from(max_age_days));
    let mut report = EvictionReport::default();
    let mut guard = registry.lock().await;

    for bucket in Bucket::ALL {
        let entries = guard.bucket_mut(bucket);
        let candidates = eviction_candidates(entries.iter(), keep_popular, cutoff);
        let mut removed_here = 0;

        for name in candidates {
            let Some(entry) = entries.get(&name) else {
                continue;
            };
            if let Err(e) = remove_file_if_exists(&entry.local_path) {
                tracing::warn!(bucket = %bucket, name = %name, error = %e, "Failed to remove cached file, keeping entry");
                continue;
            }
            if let Some(entry) = entries.remove(&name) {
                tracing::info!(bucket = %bucket, name = %name, last_used_at = %entry.last_used_at, "Evicted cached model");
                report.freed_bytes += entry.file_size_bytes;
                report.removed.push(EvictedModel {
                    bucket,
                    name,
                    file_size_bytes: entry.file_size_bytes,
                });
                removed_here += 1;
            }
        }

        if removed_here > 0 {
            crate::metrics::record_evictions(bucket, removed_here);
        }
    }

    if !report.removed.is_empty() {
        guard.persist().await?;
        tracing::info!(
            removed = report.removed.len(),
            freed_bytes = report.freed_bytes,
            "Cache eviction complete"
        );
    }

    Ok(report)
}

/// Names outside the popular set whose last use is at or before `cutoff`
fn eviction_candidates<'a>(
    entries: impl Iterator<Item = (&'a String, &'a CacheEntry)>,
    keep_popular: usize,
    cutoff: chrono::DateTime<Utc>,
) -> Vec<String> {
    let mut ranked: Vec<_> = entries.collect();
    ranked.sort_by(|(a_name, a), (b_name, b)| {
        b.usage_count
            .cmp(&a.usage_count)
            .then(b.last_used_at.cmp(&a.last_used_at))
            .then(a_name.cmp(b_name))
    });

    ranked
        .into_iter()
        .skip(keep_popular)
        .filter(|(_, entry)| entry.last_used_at <= cutoff)
        .map(|(name, _)| name.clone())
        .collect()
}

/// Periodic eviction driven by configuration
pub struct EvictionScheduler {
    registry: Arc<ModelRegistry>,
    interval: Duration,
    max_age_days: u32,
    keep_popular: usize,
}

impl EvictionScheduler {
    pub fn new(
        registry: Arc<ModelRegistry>,
        interval_secs: u64,
        max_age_days: u32,
        keep_popular: usize,
    ) -> Self {
        Self {
            registry,
            interval: Duration::from_secs(interval_secs.max(1)),
            max_age_days,
            keep_popular,
        }
    }

    /// Start eviction loop
    pub async fn run(self: Arc<Self>) {
        let mut ticker = interval(self.interval);
        // First tick fires immediately; skip it so startup is not slowed down
        ticker.tick().await;

        tracing::info!(
            interval_secs = self.interval.as_secs(),
            max_age_days = self.max_age_days,
            keep_popular = self.keep_popular,
            "Scheduled eviction started"
        );

        loop {
            ticker.tick().await;
            self.run_once().await;
        }
    }

    pub async fn run_once(&self) -> Option<EvictionReport> {
        match evict(&self.registry, self.max_age_days, self.keep_popular).await {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::error!(error = %e, "Scheduled eviction failed");
                None
            }
        }
    }
}
