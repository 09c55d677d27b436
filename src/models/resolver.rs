//! Turns model references into verified local files
//!
//! Per reference: consult the registry, serve a hit if the file is still
//! present and matches the requested hash, otherwise download, record the
//! new entry and report that something changed. Downloads never run inside
//! the registry critical section.

use super::download::ArtifactFetcher;
use super::eviction::{EvictionReport, evict};
use super::reference::{Bucket, LoraReference, ModelReference};
use super::registry::{CacheEntry, CacheStats, ModelRegistry};
use super::verify::{hashes_match, verify_file};
use crate::config::CachePaths;
use crate::error::{CacheError, CacheResult};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// A successfully resolved reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub path: PathBuf,
    /// True when this call fetched the file
    pub downloaded: bool,
}

/// A reference that could not be made available locally
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionFailure {
    pub bucket: Bucket,
    pub name: String,
    pub kind: String,
    pub reason: String,
}

impl ResolutionFailure {
    fn new(bucket: Bucket, name: &str, error: &CacheError) -> Self {
        Self {
            bucket,
            name: name.to_string(),
            kind: error.kind().to_string(),
            reason: error.to_string(),
        }
    }
}

/// Everything a generation request asks the cache for
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    #[serde(default)]
    pub checkpoint: Option<ModelReference>,
    #[serde(default)]
    pub loras: Vec<LoraReference>,
    #[serde(default)]
    pub embeddings: Vec<ModelReference>,
}

/// Result of preparing a request's models
///
/// Partial failure is normal: whatever resolved is returned and every
/// reference that did not is listed in `failures`. Deciding whether a
/// missing checkpoint aborts the request is up to the caller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreparedModels {
    pub checkpoint: Option<PathBuf>,
    /// Resolved LoRAs with their scales, in request order
    pub loras: Vec<(PathBuf, f64)>,
    pub embeddings: Vec<PathBuf>,
    /// At least one file was fetched
    pub downloaded: bool,
    pub failures: Vec<ResolutionFailure>,
}

enum HitCheck {
    Hit(PathBuf),
    /// Stored entry has no digest yet; verify the file against the request
    NeedsVerify(CacheEntry),
    Miss,
}

/// Cache front door for the request handler
pub struct ModelResolver {
    registry: Arc<ModelRegistry>,
    fetcher: Arc<dyn ArtifactFetcher>,
    paths: CachePaths,
    single_flight: bool,
    in_flight: DashMap<(Bucket, String), Arc<Mutex<()>>>,
}

impl ModelResolver {
    pub fn new(
        registry: Arc<ModelRegistry>,
        fetcher: Arc<dyn ArtifactFetcher>,
        paths: CachePaths,
    ) -> Self {
        Self {
            registry,
            fetcher,
            paths,
            single_flight: false,
            in_flight: DashMap::new(),
        }
    }

    /// Serialize hit-check through registry update per logical name
    pub fn with_single_flight(mut self, enabled: bool) -> Self {
        self.single_flight = enabled;
        self
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn paths(&self) -> &CachePaths {
        &self.paths
    }

    pub async fn stats(&self) -> CacheStats {
        self.registry.stats().await
    }

    pub async fn resolve_checkpoint(&self, reference: &ModelReference) -> Option<PathBuf> {
        self.resolve_logged(Bucket::Checkpoints, reference).await.ok().map(|r| r.path)
    }

    pub async fn resolve_lora(&self, reference: &ModelReference) -> Option<PathBuf> {
        self.resolve_logged(Bucket::Loras, reference).await.ok().map(|r| r.path)
    }

    pub async fn resolve_embedding(&self, reference: &ModelReference) -> Option<PathBuf> {
        self.resolve_logged(Bucket::Embeddings, reference).await.ok().map(|r| r.path)
    }

    /// Resolve a list of embeddings, skipping the ones that fail
    pub async fn resolve_embeddings(&self, references: &[ModelReference]) -> Vec<PathBuf> {
        let mut paths = Vec::with_capacity(references.len());
        for reference in references {
            if let Some(path) = self.resolve_embedding(reference).await {
                paths.push(path);
            }
        }
        paths
    }

    /// Run one eviction pass over the registry
    pub async fn evict(&self, max_age_days: u32, keep_popular: usize) -> CacheResult<EvictionReport> {
        evict(&self.registry, max_age_days, keep_popular).await
    }

    /// Checkpoint plus LoRAs, the shape generation requests use
    pub async fn prepare_for_request(
        &self,
        checkpoint: Option<&ModelReference>,
        loras: &[LoraReference],
    ) -> PreparedModels {
        let request = ModelRequest {
            checkpoint: checkpoint.cloned(),
            loras: loras.to_vec(),
            embeddings: Vec::new(),
        };
        self.prepare(&request).await
    }

    /// Resolve every reference in `request`, in request order
    pub async fn prepare(&self, request: &ModelRequest) -> PreparedModels {
        let mut prepared = PreparedModels::default();

        if let Some(checkpoint) = &request.checkpoint {
            match self.resolve_logged(Bucket::Checkpoints, checkpoint).await {
                Ok(resolved) => {
                    prepared.downloaded |= resolved.downloaded;
                    prepared.checkpoint = Some(resolved.path);
                }
                Err(e) => prepared.failures.push(ResolutionFailure::new(
                    Bucket::Checkpoints,
                    &checkpoint.name,
                    &e,
                )),
            }
        }

        for lora in &request.loras {
            match self.resolve_logged(Bucket::Loras, &lora.model()).await {
                Ok(resolved) => {
                    prepared.downloaded |= resolved.downloaded;
                    prepared.loras.push((resolved.path, lora.scale));
                }
                Err(e) => prepared
                    .failures
                    .push(ResolutionFailure::new(Bucket::Loras, &lora.name, &e)),
            }
        }

        for embedding in &request.embeddings {
            match self.resolve_logged(Bucket::Embeddings, embedding).await {
                Ok(resolved) => {
                    prepared.downloaded |= resolved.downloaded;
                    prepared.embeddings.push(resolved.path);
                }
                Err(e) => prepared.failures.push(ResolutionFailure::new(
                    Bucket::Embeddings,
                    &embedding.name,
                    &e,
                )),
            }
        }

        prepared
    }

    async fn resolve_logged(
        &self,
        bucket: Bucket,
        reference: &ModelReference,
    ) -> CacheResult<Resolved> {
        let result = self.resolve(bucket, reference).await;
        if let Err(e) = &result {
            tracing::warn!(
                bucket = %bucket,
                name = %reference.name,
                error = %e,
                "Failed to prepare model"
            );
        }
        result
    }

    /// Resolve one reference to a local path, downloading on a miss
    pub async fn resolve(&self, bucket: Bucket, reference: &ModelReference) -> CacheResult<Resolved> {
        let destination = reference.destination(bucket, &self.paths)?;

        // Held until this call returns or its future is dropped
        let _flight = if self.single_flight {
            Some(self.enter_flight(bucket, &reference.name).await)
        } else {
            None
        };

        self.resolve_inner(bucket, reference, &destination).await
    }

    async fn resolve_inner(
        &self,
        bucket: Bucket,
        reference: &ModelReference,
        destination: &Path,
    ) -> CacheResult<Resolved> {
        if let Some(path) = self.check_cache(bucket, reference).await? {
            crate::metrics::record_cache_hit(bucket);
            tracing::info!(bucket = %bucket, name = %reference.name, path = ?path, "Using cached model");
            return Ok(Resolved {
                path,
                downloaded: false,
            });
        }

        crate::metrics::record_cache_miss(bucket);
        tracing::info!(bucket = %bucket, name = %reference.name, url = %reference.url, "Cache miss, downloading");

        let result = self
            .fetcher
            .download(&reference.url, destination, reference.expected_hash())
            .await;
        crate::metrics::record_download(bucket, result.success);

        if !result.success {
            return Err(CacheError::DownloadFailed {
                url: reference.url.clone(),
                reason: result.error.unwrap_or_else(|| "unknown error".to_string()),
            });
        }

        let entry = CacheEntry::new(
            reference.url.clone(),
            result.path.clone(),
            result.digest,
            result.size_bytes,
        );

        let mut guard = self.registry.lock().await;
        let replaced = guard.lookup(bucket, &reference.name).cloned();

        // The file is already in place; a failed save only costs durability
        if let Err(e) = guard.upsert(bucket, &reference.name, entry).await {
            tracing::warn!(bucket = %bucket, name = %reference.name, error = %e, "Downloaded model but could not persist registry");
        }

        // A new extension means a new file name; the old file has no owner left
        if let Some(old) = replaced
            && old.local_path != result.path
        {
            tracing::info!(bucket = %bucket, name = %reference.name, path = ?old.local_path, "Removing replaced model file");
            discard_file(&old.local_path);
        }
        drop(guard);

        Ok(Resolved {
            path: result.path,
            downloaded: true,
        })
    }

    /// Hit-or-miss decision; returns the cached path on a hit
    async fn check_cache(
        &self,
        bucket: Bucket,
        reference: &ModelReference,
    ) -> CacheResult<Option<PathBuf>> {
        let name = reference.name.as_str();
        let expected = reference.expected_hash();

        let decision = {
            let mut guard = self.registry.lock().await;
            let Some(entry) = guard.lookup(bucket, name).cloned() else {
                return Ok(None);
            };

            let decision = if !entry.file_is_present() {
                tracing::warn!(bucket = %bucket, name = %name, path = ?entry.local_path, "Cached file missing or empty, dropping stale entry");
                if let Err(e) = guard.remove(bucket, name).await {
                    tracing::warn!(error = %e, "Failed to persist stale entry removal");
                }
                HitCheck::Miss
            } else if entry.url != reference.url {
                tracing::info!(bucket = %bucket, name = %name, old_url = %entry.url, new_url = %reference.url, "Source URL changed, forcing re-download");
                HitCheck::Miss
            } else {
                match (expected, entry.content_hash.as_deref()) {
                    (None, _) => HitCheck::Hit(entry.local_path.clone()),
                    (Some(want), Some(stored)) if hashes_match(want, stored) => {
                        HitCheck::Hit(entry.local_path.clone())
                    }
                    (Some(_), Some(_)) => {
                        tracing::info!(bucket = %bucket, name = %name, "Requested hash differs from cached content");
                        HitCheck::Miss
                    }
                    (Some(_), None) => HitCheck::NeedsVerify(entry),
                }
            };

            if let HitCheck::Hit(path) = &decision {
                if let Err(e) = guard.touch(bucket, name).await {
                    tracing::warn!(bucket = %bucket, name = %name, error = %e, "Failed to persist cache hit");
                }
                return Ok(Some(path.clone()));
            }
            decision
        };

        match decision {
            HitCheck::Hit(path) => Ok(Some(path)),
            HitCheck::Miss => Ok(None),
            HitCheck::NeedsVerify(entry) => {
                let Some(expected) = expected else {
                    return Ok(None);
                };
                let verified =
                    verify_file(entry.local_path.clone(), Some(expected.to_string())).await;

                let mut guard = self.registry.lock().await;
                // Another request may have replaced the entry meanwhile
                if guard.lookup(bucket, name) != Some(&entry) {
                    return Ok(None);
                }

                if verified {
                    if let Some(current) = guard.bucket_mut(bucket).get_mut(name) {
                        current.content_hash = Some(expected.to_ascii_lowercase());
                    }
                    if let Err(e) = guard.touch(bucket, name).await {
                        tracing::warn!(error = %e, "Failed to persist cache hit");
                    }
                    Ok(Some(entry.local_path))
                } else {
                    crate::metrics::record_integrity_failure();
                    tracing::warn!(bucket = %bucket, name = %name, path = ?entry.local_path, "Cached file failed verification, invalidating");
                    if let Err(e) = guard.remove(bucket, name).await {
                        tracing::warn!(error = %e, "Failed to persist invalidation");
                    }
                    discard_file(&entry.local_path);
                    Ok(None)
                }
            }
        }
    }

    /// Drop an entry and delete its file
    pub async fn invalidate(&self, bucket: Bucket, name: &str) -> CacheResult<Option<CacheEntry>> {
        let mut guard = self.registry.lock().await;
        let removed = guard.remove(bucket, name).await?;
        if let Some(entry) = &removed {
            remove_file_if_exists(&entry.local_path)?;
            tracing::info!(bucket = %bucket, name = %name, path = ?entry.local_path, "Invalidated cached model");
        }
        Ok(removed)
    }

    async fn enter_flight(&self, bucket: Bucket, name: &str) -> Flight<'_> {
        let key = (bucket, name.to_string());
        let lock = self
            .in_flight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let mut flight = Flight {
            in_flight: &self.in_flight,
            key,
            guard: None,
        };
        flight.guard = Some(lock.lock_owned().await);
        flight
    }
}

/// Per-name download slot; releases the lock and prunes the map on drop
struct Flight<'a> {
    in_flight: &'a DashMap<(Bucket, String), Arc<Mutex<()>>>,
    key: (Bucket, String),
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        // The guard owns a clone of the lock, so release it before counting
        drop(self.guard.take());
        self.in_flight
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

pub(crate) fn remove_file_if_exists(path: &Path) -> CacheResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CacheError::disk(path, e)),
    }
}

/// Best-effort delete for files whose registry entry is already gone
fn discard_file(path: &Path) {
    if let Err(e) = remove_file_if_exists(path) {
        tracing::warn!(path = ?path, error = %e, "Failed to delete cached file");
    }
}

/// Short LoRA name used in prompt tags: file name without directory or extension
pub fn lora_tag_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Prefix `base_prompt` with `<lora:NAME:SCALE>` tags, in list order
///
/// The base prompt is kept verbatim after the tags.
pub fn build_prompt_fragment(base_prompt: &str, loras: &[(PathBuf, f64)]) -> String {
    if loras.is_empty() {
        return base_prompt.to_string();
    }

    let tags = loras
        .iter()
        .map(|(path, scale)| format!("<lora:{}:{:?}>", lora_tag_name(path), scale))
        .collect::<Vec<_>>()
        .join(" ");

    if base_prompt.is_empty() {
        tags
    } else {
        format!("{} {}", tags, base_prompt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::download::DownloadResult;
    use crate::storage::mock::MockStorage;
    use async_trait::async_trait;
    use sha2::{Digest, Sha256};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Serves fixed payloads by URL and counts calls
    #[derive(Default)]
    struct MockFetcher {
        payloads: HashMap<String, Vec<u8>>,
        calls: AtomicUsize,
    }

    impl MockFetcher {
        fn with(mut self, url: &str, body: &[u8]) -> Self {
            self.payloads.insert(url.to_string(), body.to_vec());
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ArtifactFetcher for MockFetcher {
        async fn download(
            &self,
            url: &str,
            destination: &Path,
            expected_hash: Option<&str>,
        ) -> DownloadResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let Some(body) = self.payloads.get(url) else {
                return DownloadResult::failed(
                    destination.to_path_buf(),
                    &CacheError::HttpStatus {
                        url: url.to_string(),
                        status: 404,
                    },
                );
            };
            let digest = hex::encode(Sha256::digest(body));
            if let Some(expected) = expected_hash
                && !hashes_match(&digest, expected)
            {
                return DownloadResult::failed(
                    destination.to_path_buf(),
                    &CacheError::Integrity {
                        path: destination.to_path_buf(),
                        expected: expected.to_string(),
                        actual: digest,
                    },
                );
            }
            std::fs::create_dir_all(destination.parent().unwrap()).unwrap();
            std::fs::write(destination, body).unwrap();
            DownloadResult::ok(destination.to_path_buf(), body.len() as u64, digest)
        }
    }

    const CKPT_URL: &str = "https://host/sdxl.safetensors";
    const LORA_URL: &str = "https://host/detail.safetensors";

    fn sha(body: &[u8]) -> String {
        hex::encode(Sha256::digest(body))
    }

    async fn resolver_with(fetcher: MockFetcher) -> (ModelResolver, Arc<MockFetcher>, TempDir) {
        let dir = TempDir::new().unwrap();
        let paths = CachePaths::new(dir.path());
        let registry = Arc::new(
            ModelRegistry::load(paths.registry_file.clone(), Arc::new(MockStorage::new())).await,
        );
        let fetcher = Arc::new(fetcher);
        let resolver = ModelResolver::new(registry, fetcher.clone(), paths);
        (resolver, fetcher, dir)
    }

    fn default_fetcher() -> MockFetcher {
        MockFetcher::default()
            .with(CKPT_URL, b"checkpoint weights")
            .with(LORA_URL, b"lora weights")
    }

    #[tokio::test]
    async fn test_second_resolve_is_a_hit() {
        let (resolver, fetcher, dir) = resolver_with(default_fetcher()).await;
        let reference = ModelReference::new("sdxl", CKPT_URL);

        let first = resolver.resolve(Bucket::Checkpoints, &reference).await.unwrap();
        assert!(first.downloaded);
        assert_eq!(first.path, dir.path().join("checkpoints/sdxl.safetensors"));

        let second = resolver.resolve(Bucket::Checkpoints, &reference).await.unwrap();
        assert!(!second.downloaded);
        assert_eq!(second.path, first.path);
        assert_eq!(fetcher.calls(), 1);

        let entry = resolver
            .registry()
            .lookup(Bucket::Checkpoints, "sdxl")
            .await
            .unwrap();
        assert_eq!(entry.usage_count, 2);
        assert_eq!(entry.file_size_bytes, b"checkpoint weights".len() as u64);
        assert_eq!(entry.content_hash, Some(sha(b"checkpoint weights")));
    }

    #[tokio::test]
    async fn test_hash_mismatch_creates_nothing() {
        let (resolver, _fetcher, dir) = resolver_with(default_fetcher()).await;
        let reference = ModelReference::new("detail", LORA_URL).with_hash("00ff");

        assert!(resolver.resolve_lora(&reference).await.is_none());
        assert!(resolver.registry().lookup(Bucket::Loras, "detail").await.is_none());
        assert!(!dir.path().join("loras/detail.safetensors").exists());
    }

    #[tokio::test]
    async fn test_deleted_file_triggers_redownload() {
        let (resolver, fetcher, _dir) = resolver_with(default_fetcher()).await;
        let reference = ModelReference::new("detail", LORA_URL);

        let path = resolver.resolve_lora(&reference).await.unwrap();
        std::fs::remove_file(&path).unwrap();

        let resolved = resolver.resolve(Bucket::Loras, &reference).await.unwrap();
        assert!(resolved.downloaded);
        assert!(path.exists());
        assert_eq!(fetcher.calls(), 2);
        // Fresh entry, usage restarted
        let entry = resolver.registry().lookup(Bucket::Loras, "detail").await.unwrap();
        assert_eq!(entry.usage_count, 1);
    }

    #[tokio::test]
    async fn test_truncated_file_triggers_redownload() {
        let (resolver, fetcher, _dir) = resolver_with(default_fetcher()).await;
        let reference = ModelReference::new("detail", LORA_URL);

        let path = resolver.resolve_lora(&reference).await.unwrap();
        std::fs::write(&path, "").unwrap();

        assert!(resolver.resolve(Bucket::Loras, &reference).await.unwrap().downloaded);
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_matching_hash_is_a_hit() {
        let (resolver, fetcher, _dir) = resolver_with(default_fetcher()).await;
        let hash = sha(b"lora weights").to_uppercase();
        let reference = ModelReference::new("detail", LORA_URL).with_hash(hash);

        assert!(resolver.resolve(Bucket::Loras, &reference).await.unwrap().downloaded);
        assert!(!resolver.resolve(Bucket::Loras, &reference).await.unwrap().downloaded);
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_different_requested_hash_is_a_miss() {
        let (resolver, fetcher, _dir) = resolver_with(default_fetcher()).await;
        resolver
            .resolve(Bucket::Loras, &ModelReference::new("detail", LORA_URL))
            .await
            .unwrap();

        let other = ModelReference::new("detail", LORA_URL).with_hash("abcd");
        assert!(resolver.resolve(Bucket::Loras, &other).await.is_err());
        assert_eq!(fetcher.calls(), 2);
        // Previous consistent entry survives the failed replacement
        let entry = resolver.registry().lookup(Bucket::Loras, "detail").await.unwrap();
        assert!(entry.file_is_present());
    }

    #[tokio::test]
    async fn test_legacy_entry_without_hash_is_verified() {
        let (resolver, fetcher, dir) = resolver_with(default_fetcher()).await;
        let path = dir.path().join("loras/detail.safetensors");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"lora weights").unwrap();
        resolver
            .registry()
            .upsert(
                Bucket::Loras,
                "detail",
                CacheEntry::new(LORA_URL, path.clone(), None, 12),
            )
            .await
            .unwrap();

        let reference = ModelReference::new("detail", LORA_URL).with_hash(sha(b"lora weights"));
        let resolved = resolver.resolve(Bucket::Loras, &reference).await.unwrap();
        assert!(!resolved.downloaded);
        assert_eq!(fetcher.calls(), 0);

        let entry = resolver.registry().lookup(Bucket::Loras, "detail").await.unwrap();
        assert_eq!(entry.content_hash, Some(sha(b"lora weights")));
        assert_eq!(entry.usage_count, 2);
    }

    #[tokio::test]
    async fn test_legacy_entry_failing_verification_is_invalidated() {
        let (resolver, fetcher, dir) = resolver_with(default_fetcher()).await;
        let path = dir.path().join("loras/detail.safetensors");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"corrupted bytes").unwrap();
        resolver
            .registry()
            .upsert(
                Bucket::Loras,
                "detail",
                CacheEntry::new(LORA_URL, path.clone(), None, 15),
            )
            .await
            .unwrap();

        let reference = ModelReference::new("detail", LORA_URL).with_hash(sha(b"lora weights"));
        let resolved = resolver.resolve(Bucket::Loras, &reference).await.unwrap();
        assert!(resolved.downloaded);
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(std::fs::read(&path).unwrap(), b"lora weights");
    }

    #[tokio::test]
    async fn test_url_change_forces_redownload() {
        let fetcher = default_fetcher().with("https://mirror/detail-v2.safetensors", b"v2 weights");
        let (resolver, fetcher, _dir) = resolver_with(fetcher).await;

        resolver
            .resolve(Bucket::Loras, &ModelReference::new("detail", LORA_URL))
            .await
            .unwrap();
        let moved = ModelReference::new("detail", "https://mirror/detail-v2.safetensors");
        let resolved = resolver.resolve(Bucket::Loras, &moved).await.unwrap();

        assert!(resolved.downloaded);
        assert_eq!(fetcher.calls(), 2);
        let entry = resolver.registry().lookup(Bucket::Loras, "detail").await.unwrap();
        assert_eq!(entry.url, "https://mirror/detail-v2.safetensors");
        assert_eq!(std::fs::read(&resolved.path).unwrap(), b"v2 weights");
    }

    #[tokio::test]
    async fn test_partial_batch_resolution() {
        let (resolver, _fetcher, _dir) = resolver_with(default_fetcher()).await;
        let checkpoint = ModelReference::new("sdxl", CKPT_URL);
        let loras = vec![LoraReference::new(
            "ghost",
            "https://unreachable/ghost.safetensors",
            0.5,
        )];

        let prepared = resolver.prepare_for_request(Some(&checkpoint), &loras).await;
        assert!(prepared.checkpoint.is_some());
        assert!(prepared.loras.is_empty());
        assert!(prepared.downloaded);
        assert_eq!(prepared.failures.len(), 1);
        assert_eq!(prepared.failures[0].name, "ghost");
        assert_eq!(prepared.failures[0].bucket, Bucket::Loras);
        assert_eq!(prepared.failures[0].kind, "download");
    }

    #[tokio::test]
    async fn test_prepare_keeps_lora_order_and_scales() {
        let fetcher = default_fetcher().with("https://host/skin.safetensors", b"skin");
        let (resolver, _fetcher, _dir) = resolver_with(fetcher).await;
        let loras = vec![
            LoraReference::new("skin", "https://host/skin.safetensors", 0.3),
            LoraReference::new("detail", LORA_URL, 0.8),
        ];

        let prepared = resolver.prepare_for_request(None, &loras).await;
        assert!(prepared.checkpoint.is_none());
        let names: Vec<_> = prepared
            .loras
            .iter()
            .map(|(p, s)| (lora_tag_name(p), *s))
            .collect();
        assert_eq!(names, vec![("skin".to_string(), 0.3), ("detail".to_string(), 0.8)]);

        let again = resolver.prepare_for_request(None, &loras).await;
        assert!(!again.downloaded);
    }

    #[tokio::test]
    async fn test_prepare_embeddings() {
        let fetcher = default_fetcher().with("https://host/bad-hands.pt", b"embedding");
        let (resolver, _fetcher, dir) = resolver_with(fetcher).await;
        let request = ModelRequest {
            embeddings: vec![ModelReference::new("bad-hands", "https://host/bad-hands.pt")],
            ..Default::default()
        };

        let prepared = resolver.prepare(&request).await;
        assert_eq!(prepared.embeddings, vec![dir.path().join("embeddings/bad-hands.pt")]);
        assert!(
            resolver
                .resolve_embedding(&request.embeddings[0])
                .await
                .is_some()
        );

        let mut batch = request.embeddings.clone();
        batch.push(ModelReference::new("missing", "https://host/missing.pt"));
        let paths = resolver.resolve_embeddings(&batch).await;
        assert_eq!(paths, vec![dir.path().join("embeddings/bad-hands.pt")]);
    }

    #[tokio::test]
    async fn test_invalid_name_is_reported() {
        let (resolver, fetcher, _dir) = resolver_with(default_fetcher()).await;
        let prepared = resolver
            .prepare_for_request(Some(&ModelReference::new("../escape", CKPT_URL)), &[])
            .await;
        assert!(prepared.checkpoint.is_none());
        assert_eq!(prepared.failures[0].kind, "invalid_reference");
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_invalidate_removes_file_and_entry() {
        let (resolver, _fetcher, _dir) = resolver_with(default_fetcher()).await;
        let path = resolver
            .resolve_checkpoint(&ModelReference::new("sdxl", CKPT_URL))
            .await
            .unwrap();

        let removed = resolver.invalidate(Bucket::Checkpoints, "sdxl").await.unwrap();
        assert!(removed.is_some());
        assert!(!path.exists());
        assert!(resolver.invalidate(Bucket::Checkpoints, "sdxl").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_single_flight_collapses_downloads() {
        let dir = TempDir::new().unwrap();
        let paths = CachePaths::new(dir.path());
        let registry = Arc::new(
            ModelRegistry::load(paths.registry_file.clone(), Arc::new(MockStorage::new())).await,
        );
        let fetcher = Arc::new(default_fetcher());
        let resolver = Arc::new(
            ModelResolver::new(registry, fetcher.clone(), paths).with_single_flight(true),
        );

        let mut handles = Vec::new();
        for _ in 0..8 {
            let resolver = resolver.clone();
            handles.push(tokio::spawn(async move {
                resolver
                    .resolve(Bucket::Checkpoints, &ModelReference::new("sdxl", CKPT_URL))
                    .await
                    .unwrap()
            }));
        }
        let results = futures::future::join_all(handles).await;

        assert_eq!(fetcher.calls(), 1);
        assert_eq!(results.into_iter().filter(|r| r.as_ref().unwrap().downloaded).count(), 1);
        assert!(resolver.in_flight.is_empty());
        let entry = resolver.registry().lookup(Bucket::Checkpoints, "sdxl").await.unwrap();
        assert_eq!(entry.usage_count, 8);
    }

    #[tokio::test]
    async fn test_extension_change_removes_old_file() {
        let fetcher = MockFetcher::default()
            .with("https://a/detail.safetensors", b"safetensors weights")
            .with("https://b/detail.pt", b"pickled weights");
        let (resolver, _fetcher, dir) = resolver_with(fetcher).await;
        let loras = dir.path().join("loras");

        resolver
            .resolve(Bucket::Loras, &ModelReference::new("detail", "https://a/detail.safetensors"))
            .await
            .unwrap();
        let resolved = resolver
            .resolve(Bucket::Loras, &ModelReference::new("detail", "https://b/detail.pt"))
            .await
            .unwrap();

        assert_eq!(resolved.path, loras.join("detail.pt"));
        assert!(!loras.join("detail.safetensors").exists());
        assert_eq!(std::fs::read_dir(&loras).unwrap().count(), 1);
        assert_eq!(resolver.stats().await.loras.count, 1);

        // Nothing is left behind once the single entry is evicted
        resolver.evict(0, 0).await.unwrap();
        assert_eq!(std::fs::read_dir(&loras).unwrap().count(), 0);
    }

    /// Never finishes a download
    struct HangingFetcher {
        started: AtomicUsize,
    }

    #[async_trait]
    impl ArtifactFetcher for HangingFetcher {
        async fn download(&self, _: &str, _: &Path, _: Option<&str>) -> DownloadResult {
            self.started.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_cancelled_resolve_releases_flight_slot() {
        let dir = TempDir::new().unwrap();
        let paths = CachePaths::new(dir.path());
        let registry = Arc::new(
            ModelRegistry::load(paths.registry_file.clone(), Arc::new(MockStorage::new())).await,
        );
        let fetcher = Arc::new(HangingFetcher {
            started: AtomicUsize::new(0),
        });
        let resolver = Arc::new(
            ModelResolver::new(registry, fetcher.clone(), paths).with_single_flight(true),
        );

        let task = {
            let resolver = resolver.clone();
            tokio::spawn(async move {
                resolver
                    .resolve(Bucket::Checkpoints, &ModelReference::new("sdxl", CKPT_URL))
                    .await
            })
        };
        for _ in 0..100 {
            if fetcher.started.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(resolver.in_flight.len(), 1);

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert!(resolver.in_flight.is_empty());
    }

    #[test]
    fn test_discard_file_tolerates_errors() {
        let dir = TempDir::new().unwrap();
        // Unlinking a directory fails with something other than NotFound
        discard_file(dir.path());
        assert!(dir.path().is_dir());
        discard_file(&dir.path().join("never-existed.safetensors"));
    }

    #[test]
    fn test_prompt_fragment() {
        let loras = vec![
            (PathBuf::from("/x/detail.safetensors"), 0.8),
            (PathBuf::from("/x/skin.safetensors"), 0.3),
        ];
        assert_eq!(
            build_prompt_fragment("a cat", &loras),
            "<lora:detail:0.8> <lora:skin:0.3> a cat"
        );
    }

    #[test]
    fn test_prompt_fragment_edge_cases() {
        assert_eq!(build_prompt_fragment("a cat", &[]), "a cat");
        assert_eq!(
            build_prompt_fragment("", &[(PathBuf::from("/x/a.pt"), 1.0)]),
            "<lora:a:1.0>"
        );
        assert_eq!(
            build_prompt_fragment("  spaced ", &[(PathBuf::from("b.safetensors"), 0.25)]),
            "<lora:b:0.25>   spaced "
        );
    }
}
