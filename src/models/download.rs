//! Streaming artifact downloads over HTTP
//!
//! Content is streamed into `<destination>.part`, hashed on the fly and only
//! renamed onto the destination once the transfer (and the optional digest
//! check) succeeds. Failures are returned as values, never raised.

use super::verify::hashes_match;
use crate::config::AdapterConfig;
use crate::error::{CacheError, CacheResult};
use async_trait::async_trait;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufWriter};

/// Outcome of a single fetch, consumed immediately by the resolver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadResult {
    pub success: bool,
    pub path: PathBuf,
    /// Bytes written to `path`
    pub size_bytes: u64,
    /// SHA-256 of what was written, hex encoded
    pub digest: Option<String>,
    pub error: Option<String>,
}

impl DownloadResult {
    pub fn ok(path: PathBuf, size_bytes: u64, digest: String) -> Self {
        Self {
            success: true,
            path,
            size_bytes,
            digest: Some(digest),
            error: None,
        }
    }

    pub fn failed(path: PathBuf, error: &CacheError) -> Self {
        Self {
            success: false,
            path,
            size_bytes: 0,
            digest: None,
            error: Some(error.to_string()),
        }
    }
}

/// Source of model artifacts
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Fetch `url` into `destination`, verifying against `expected_hash` if given
    async fn download(
        &self,
        url: &str,
        destination: &Path,
        expected_hash: Option<&str>,
    ) -> DownloadResult;

    async fn fetch(&self, url: &str, destination: &Path, expected_hash: Option<&str>) -> bool {
        self.download(url, destination, expected_hash)
            .await
            .success
    }
}

/// Removes an in-progress file unless the download completes
///
/// Also covers cancellation: dropping the download future drops the guard.
struct PartialFile {
    path: PathBuf,
    armed: bool,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.armed {
            match std::fs::remove_file(&self.path) {
                Ok(()) => tracing::debug!(path = ?self.path, "Removed partial download"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = ?self.path, error = %e, "Failed to remove partial download")
                }
            }
        }
    }
}

/// `<destination>.part` next to the destination
pub fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}

/// HTTP implementation backed by a shared reqwest client
pub struct HttpDownloader {
    client: reqwest::Client,
    progress_interval_bytes: u64,
}

impl HttpDownloader {
    /// `read_timeout` bounds the idle gap between chunks, not the whole
    /// transfer, so multi-gigabyte files on slow links still complete
    pub fn new(
        read_timeout: Duration,
        connect_timeout: Duration,
        progress_interval_bytes: u64,
    ) -> CacheResult<Self> {
        let client = reqwest::Client::builder()
            .read_timeout(read_timeout)
            .connect_timeout(connect_timeout)
            .user_agent(concat!("sd-model-cache/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CacheError::Network {
                url: String::new(),
                source: e,
            })?;

        Ok(Self {
            client,
            progress_interval_bytes: progress_interval_bytes.max(1),
        })
    }

    pub fn from_config(config: &AdapterConfig) -> CacheResult<Self> {
        Self::new(
            Duration::from_secs(config.download_timeout_secs),
            Duration::from_secs(config.connect_timeout_secs),
            config.progress_interval_bytes,
        )
    }

    async fn try_download(
        &self,
        url: &str,
        destination: &Path,
        expected_hash: Option<&str>,
    ) -> CacheResult<(u64, String)> {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| CacheError::disk(parent, e))?;
        }

        let part_path = partial_path(destination);
        let guard = PartialFile::new(part_path.clone());

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CacheError::Network {
                url: url.to_string(),
                source: e,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(CacheError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let total_size = response.content_length().unwrap_or(0);
        let file = fs::File::create(&part_path)
            .await
            .map_err(|e| CacheError::disk(&part_path, e))?;
        let mut writer = BufWriter::new(file);

        let mut stream = response.bytes_stream();
        let mut hasher = Sha256::new();
        let mut downloaded: u64 = 0;
        let mut next_report = self.progress_interval_bytes;
        let started = Instant::now();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| CacheError::Network {
                url: url.to_string(),
                source: e,
            })?;

            writer
                .write_all(&chunk)
                .await
                .map_err(|e| CacheError::disk(&part_path, e))?;
            hasher.update(&chunk);
            downloaded += chunk.len() as u64;

            if downloaded >= next_report {
                let percent = if total_size > 0 {
                    downloaded as f64 / total_size as f64 * 100.0
                } else {
                    0.0
                };
                tracing::info!(
                    url = %url,
                    downloaded_mb = downloaded / (1024 * 1024),
                    total_mb = total_size / (1024 * 1024),
                    percent = %format!("{:.1}", percent),
                    "Download progress"
                );
                next_report = downloaded + self.progress_interval_bytes;
            }
        }

        writer
            .flush()
            .await
            .map_err(|e| CacheError::disk(&part_path, e))?;
        writer
            .get_ref()
            .sync_all()
            .await
            .map_err(|e| CacheError::disk(&part_path, e))?;
        drop(writer);

        if downloaded == 0 {
            return Err(CacheError::EmptyBody {
                url: url.to_string(),
            });
        }

        let digest = hex::encode(hasher.finalize());
        if let Some(expected) = expected_hash
            && !hashes_match(&digest, expected)
        {
            crate::metrics::record_integrity_failure();
            return Err(CacheError::Integrity {
                path: destination.to_path_buf(),
                expected: expected.to_string(),
                actual: digest,
            });
        }

        fs::rename(&part_path, destination)
            .await
            .map_err(|e| CacheError::disk(destination, e))?;
        guard.disarm();

        crate::metrics::record_downloaded_bytes(downloaded);
        tracing::info!(
            url = %url,
            path = ?destination,
            size_bytes = downloaded,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Download complete"
        );

        Ok((downloaded, digest))
    }
}

#[async_trait]
impl ArtifactFetcher for HttpDownloader {
    async fn download(
        &self,
        url: &str,
        destination: &Path,
        expected_hash: Option<&str>,
    ) -> DownloadResult {
        tracing::info!(url = %url, path = ?destination, "Starting download");

        match self.try_download(url, destination, expected_hash).await {
            Ok((size_bytes, digest)) => {
                DownloadResult::ok(destination.to_path_buf(), size_bytes, digest)
            }
            Err(e) => {
                tracing::warn!(url = %url, path = ?destination, error = %e, "Download failed");
                DownloadResult::failed(destination.to_path_buf(), &e)
            }
        }
    }
}
