//! Persisted registry of cached model artifacts
//!
//! The registry is the single source of truth for cache-hit decisions. It
//! lives in memory behind one async mutex and is written through to the
//! models volume on every mutation.

use super::reference::Bucket;
use crate::error::{CacheError, CacheResult};
use crate::storage::{FileSystemStorage, StorageBackend};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

/// Record for one cached artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Remote source the file was fetched from
    pub url: String,
    pub local_path: PathBuf,
    /// SHA-256 of the file content, hex encoded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    pub downloaded_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default)]
    pub file_size_bytes: u64,
}

impl CacheEntry {
    /// Entry for a file that was just downloaded and used once
    pub fn new(
        url: impl Into<String>,
        local_path: PathBuf,
        content_hash: Option<String>,
        file_size_bytes: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            url: url.into(),
            local_path,
            content_hash,
            downloaded_at: now,
            last_used_at: now,
            usage_count: 1,
            file_size_bytes,
        }
    }

    /// Whether the referenced file exists and is non-empty
    pub fn file_is_present(&self) -> bool {
        std::fs::metadata(&self.local_path)
            .map(|m| m.is_file() && m.len() > 0)
            .unwrap_or(false)
    }
}

/// Top-level persisted structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRegistry {
    #[serde(default)]
    pub checkpoints: BTreeMap<String, CacheEntry>,
    #[serde(default)]
    pub loras: BTreeMap<String, CacheEntry>,
    #[serde(default)]
    pub embeddings: BTreeMap<String, CacheEntry>,
    pub last_updated: DateTime<Utc>,
}

impl Default for CacheRegistry {
    fn default() -> Self {
        Self {
            checkpoints: BTreeMap::new(),
            loras: BTreeMap::new(),
            embeddings: BTreeMap::new(),
            last_updated: Utc::now(),
        }
    }
}

impl CacheRegistry {
    pub fn bucket(&self, bucket: Bucket) -> &BTreeMap<String, CacheEntry> {
        match bucket {
            Bucket::Checkpoints => &self.checkpoints,
            Bucket::Loras => &self.loras,
            Bucket::Embeddings => &self.embeddings,
        }
    }

    pub fn bucket_mut(&mut self, bucket: Bucket) -> &mut BTreeMap<String, CacheEntry> {
        match bucket {
            Bucket::Checkpoints => &mut self.checkpoints,
            Bucket::Loras => &mut self.loras,
            Bucket::Embeddings => &mut self.embeddings,
        }
    }

    pub fn stats(&self) -> CacheStats {
        let of = |bucket: Bucket| {
            let entries = self.bucket(bucket);
            BucketStats {
                count: entries.len(),
                total_size_bytes: entries.values().map(|e| e.file_size_bytes).sum(),
            }
        };

        CacheStats {
            checkpoints: of(Bucket::Checkpoints),
            loras: of(Bucket::Loras),
            embeddings: of(Bucket::Embeddings),
        }
    }
}

/// Count and size of one bucket
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketStats {
    pub count: usize,
    pub total_size_bytes: u64,
}

/// Aggregated registry statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub checkpoints: BucketStats,
    pub loras: BucketStats,
    pub embeddings: BucketStats,
}

impl CacheStats {
    pub fn bucket(&self, bucket: Bucket) -> BucketStats {
        match bucket {
            Bucket::Checkpoints => self.checkpoints,
            Bucket::Loras => self.loras,
            Bucket::Embeddings => self.embeddings,
        }
    }

    pub fn total_size_bytes(&self) -> u64 {
        self.checkpoints.total_size_bytes
            + self.loras.total_size_bytes
            + self.embeddings.total_size_bytes
    }
}

/// Registry handle with write-through persistence
pub struct ModelRegistry {
    path: PathBuf,
    storage: Arc<dyn StorageBackend>,
    state: Mutex<CacheRegistry>,
}

impl ModelRegistry {
    /// Load the registry from `path` on the local filesystem
    pub async fn open(path: PathBuf) -> Self {
        Self::load(path, Arc::new(FileSystemStorage::new())).await
    }

    /// Load the registry through a custom storage backend
    ///
    /// Never fails: a missing file yields an empty registry and unreadable or
    /// malformed content is logged and replaced by an empty registry, so every
    /// lookup becomes a miss and the cache rebuilds itself.
    pub async fn load(path: PathBuf, storage: Arc<dyn StorageBackend>) -> Self {
        let state = Self::read_state(&path, storage.as_ref()).await;
        crate::metrics::update_bucket_gauges(&state.stats());

        Self {
            path,
            storage,
            state: Mutex::new(state),
        }
    }

    async fn read_state(path: &Path, storage: &dyn StorageBackend) -> CacheRegistry {
        let content = match storage.load(path).await {
            Ok(Some(content)) => content,
            Ok(None) => {
                tracing::info!(path = ?path, "No cache registry found, starting empty");
                return CacheRegistry::default();
            }
            Err(e) => {
                tracing::warn!(path = ?path, error = %e, "Could not read cache registry, starting empty");
                return CacheRegistry::default();
            }
        };

        match serde_json::from_str::<CacheRegistry>(&content) {
            Ok(state) => {
                let stats = state.stats();
                tracing::info!(
                    path = ?path,
                    checkpoints = stats.checkpoints.count,
                    loras = stats.loras.count,
                    embeddings = stats.embeddings.count,
                    last_updated = %state.last_updated,
                    "Cache registry loaded"
                );
                state
            }
            Err(e) => {
                tracing::warn!(
                    path = ?path,
                    error = %e,
                    "Cache registry is corrupted, starting empty"
                );
                crate::metrics::record_registry_reset();
                CacheRegistry::default()
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Enter the registry critical section
    ///
    /// Everything done through the guard is serialized against other
    /// requests. Do not hold it across downloads.
    pub async fn lock(&self) -> RegistryGuard<'_> {
        RegistryGuard {
            state: self.state.lock().await,
            path: &self.path,
            storage: self.storage.as_ref(),
        }
    }

    pub async fn lookup(&self, bucket: Bucket, name: &str) -> Option<CacheEntry> {
        self.lock().await.lookup(bucket, name).cloned()
    }

    /// Insert or replace an entry, then persist
    pub async fn upsert(&self, bucket: Bucket, name: &str, entry: CacheEntry) -> CacheResult<()> {
        self.lock().await.upsert(bucket, name, entry).await
    }

    /// Record a use of an entry, then persist
    pub async fn touch(&self, bucket: Bucket, name: &str) -> CacheResult<Option<CacheEntry>> {
        self.lock().await.touch(bucket, name).await
    }

    /// Drop an entry, then persist. The file is left alone.
    pub async fn remove(&self, bucket: Bucket, name: &str) -> CacheResult<Option<CacheEntry>> {
        self.lock().await.remove(bucket, name).await
    }

    /// Write the current state back to the volume
    pub async fn save(&self) -> CacheResult<()> {
        self.lock().await.persist().await
    }

    pub async fn stats(&self) -> CacheStats {
        self.state.lock().await.stats()
    }

    /// Entries of one bucket, sorted by name
    pub async fn entries(&self, bucket: Bucket) -> Vec<(String, CacheEntry)> {
        self.state
            .lock()
            .await
            .bucket(bucket)
            .iter()
            .map(|(name, entry)| (name.clone(), entry.clone()))
            .collect()
    }

    pub async fn snapshot(&self) -> CacheRegistry {
        self.state.lock().await.clone()
    }
}

/// Exclusive access to the in-memory registry
pub struct RegistryGuard<'a> {
    state: MutexGuard<'a, CacheRegistry>,
    path: &'a Path,
    storage: &'a dyn StorageBackend,
}

impl RegistryGuard<'_> {
    pub fn lookup(&self, bucket: Bucket, name: &str) -> Option<&CacheEntry> {
        self.state.bucket(bucket).get(name)
    }

    pub async fn upsert(&mut self, bucket: Bucket, name: &str, entry: CacheEntry) -> CacheResult<()> {
        self.state.bucket_mut(bucket).insert(name.to_string(), entry);
        self.persist().await
    }

    pub async fn touch(&mut self, bucket: Bucket, name: &str) -> CacheResult<Option<CacheEntry>> {
        let touched = match self.state.bucket_mut(bucket).get_mut(name) {
            Some(entry) => {
                entry.usage_count += 1;
                entry.last_used_at = Utc::now();
                entry.clone()
            }
            None => return Ok(None),
        };

        self.persist().await?;
        Ok(Some(touched))
    }

    pub async fn remove(&mut self, bucket: Bucket, name: &str) -> CacheResult<Option<CacheEntry>> {
        let removed = self.state.bucket_mut(bucket).remove(name);
        if removed.is_some() {
            self.persist().await?;
        }
        Ok(removed)
    }

    /// Direct access for batch edits; call [`RegistryGuard::persist`] afterwards
    pub(crate) fn bucket_mut(&mut self, bucket: Bucket) -> &mut BTreeMap<String, CacheEntry> {
        self.state.bucket_mut(bucket)
    }

    pub fn stats(&self) -> CacheStats {
        self.state.stats()
    }

    /// Serialize and atomically write the registry
    pub async fn persist(&mut self) -> CacheResult<()> {
        self.state.last_updated = Utc::now();

        let content = serde_json::to_string_pretty(&*self.state)
            .map_err(|e| CacheError::Persist(e.to_string()))?;

        self.storage
            .save(self.path, &content)
            .await
            .map_err(|e| CacheError::Persist(format!("{:#}", e)))?;

        crate::metrics::update_bucket_gauges(&self.state.stats());
        tracing::debug!(path = ?self.path, "Cache registry saved");

        Ok(())
    }
}
