//! API request and response models

use crate::disk::DiskUsage;
use crate::models::{
    Bucket, CacheEntry, CacheStats, EvictionReport, LoraReference, ModelReference,
    PreparedModels, ResolutionFailure,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Request to make a generation job's models available locally
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PrepareRequest {
    #[serde(default)]
    pub checkpoint: Option<ModelReference>,

    #[serde(default)]
    pub loras: Vec<LoraReference>,

    #[serde(default)]
    pub embeddings: Vec<ModelReference>,

    /// Base prompt; resolved LoRA tags are prepended to it
    #[serde(default)]
    pub prompt: Option<String>,
}

/// A resolved LoRA and the strength to apply it with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraPath {
    pub path: PathBuf,
    pub scale: f64,
}

/// Compact cache summary attached to prepare responses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheInfo {
    pub checkpoints_cached: usize,
    pub loras_cached: usize,
    pub total_cache_size_mb: f64,
}

impl From<&CacheStats> for CacheInfo {
    fn from(stats: &CacheStats) -> Self {
        Self {
            checkpoints_cached: stats.checkpoints.count,
            loras_cached: stats.loras.count,
            total_cache_size_mb: stats.total_size_bytes() as f64 / (1024.0 * 1024.0),
        }
    }
}

/// Prepare response
///
/// Always returned with 200; references that could not be resolved are
/// listed in `failures`.
#[derive(Debug, Serialize, Deserialize)]
pub struct PrepareResponse {
    pub checkpoint_path: Option<PathBuf>,
    pub loras: Vec<LoraPath>,
    pub embeddings: Vec<PathBuf>,
    pub prompt: String,
    pub downloaded: bool,
    /// Suggested wait before using freshly downloaded files, 0 on a full hit
    pub settle_delay_ms: u64,
    pub failures: Vec<ResolutionFailure>,
    pub cache_info: CacheInfo,
}

impl PrepareResponse {
    pub fn new(
        prepared: PreparedModels,
        prompt: String,
        settle_delay_ms: u64,
        stats: &CacheStats,
    ) -> Self {
        Self {
            checkpoint_path: prepared.checkpoint,
            loras: prepared
                .loras
                .into_iter()
                .map(|(path, scale)| LoraPath { path, scale })
                .collect(),
            embeddings: prepared.embeddings,
            prompt,
            downloaded: prepared.downloaded,
            settle_delay_ms: if prepared.downloaded { settle_delay_ms } else { 0 },
            failures: prepared.failures,
            cache_info: CacheInfo::from(stats),
        }
    }
}

/// Cache statistics response
#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub buckets: CacheStats,
    pub total_size_bytes: u64,
    pub registry_file: PathBuf,
    /// Volume usage, absent when the filesystem cannot report it
    pub disk: Option<DiskUsage>,
}

/// One registry entry with its logical name
#[derive(Debug, Serialize, Deserialize)]
pub struct EntryInfo {
    pub name: String,
    #[serde(flatten)]
    pub entry: CacheEntry,
}

/// Entries of one bucket
#[derive(Debug, Serialize, Deserialize)]
pub struct BucketListing {
    pub bucket: Bucket,
    pub count: usize,
    pub entries: Vec<EntryInfo>,
}

impl BucketListing {
    pub fn new(bucket: Bucket, entries: Vec<(String, CacheEntry)>) -> Self {
        let entries: Vec<EntryInfo> = entries
            .into_iter()
            .map(|(name, entry)| EntryInfo { name, entry })
            .collect();
        Self {
            bucket,
            count: entries.len(),
            entries,
        }
    }
}

/// Eviction request; missing fields fall back to configured defaults
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct EvictRequest {
    #[serde(default)]
    pub max_age_days: Option<u32>,
    #[serde(default)]
    pub keep_popular: Option<usize>,
}

/// Eviction response
#[derive(Debug, Serialize, Deserialize)]
pub struct EvictResponse {
    pub max_age_days: u32,
    pub keep_popular: usize,
    #[serde(flatten)]
    pub report: EvictionReport,
}
