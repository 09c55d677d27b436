//! Configuration structures and loading logic

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main adapter configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AdapterConfig {
    pub api_port: u16,
    /// Durable volume holding the buckets and the registry file
    pub models_root: PathBuf,
    /// Longest silence tolerated while streaming a download
    pub download_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Bytes between download progress log lines
    pub progress_interval_bytes: u64,
    /// Collapse concurrent downloads of the same logical name
    pub single_flight: bool,
    /// Pause suggested to callers after new files land, so the generation
    /// service can notice them
    pub settle_delay_ms: u64,
    pub eviction: EvictionConfig,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            models_root: default_models_root(),
            download_timeout_secs: default_download_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            progress_interval_bytes: default_progress_interval(),
            single_flight: true,
            settle_delay_ms: default_settle_delay(),
            eviction: EvictionConfig::default(),
        }
    }
}

/// Defaults for out-of-band cache pruning
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct EvictionConfig {
    pub max_age_days: u32,
    pub keep_popular: usize,
    /// Seconds between scheduled evictions; 0 disables the scheduler
    pub interval_secs: u64,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            max_age_days: 30,
            keep_popular: 10,
            interval_secs: 0,
        }
    }
}

impl AdapterConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        // Environment variable overrides
        if let Ok(port) = std::env::var("SD_CACHE_API_PORT") {
            config.api_port = port.parse().context("Invalid SD_CACHE_API_PORT value")?;
        }
        if let Ok(root) = std::env::var("SD_CACHE_MODELS_ROOT") {
            config.models_root = PathBuf::from(root);
        }
        if let Ok(timeout) = std::env::var("SD_CACHE_DOWNLOAD_TIMEOUT") {
            config.download_timeout_secs = timeout
                .parse()
                .context("Invalid SD_CACHE_DOWNLOAD_TIMEOUT value")?;
        }
        if let Ok(interval) = std::env::var("SD_CACHE_EVICTION_INTERVAL") {
            config.eviction.interval_secs = interval
                .parse()
                .context("Invalid SD_CACHE_EVICTION_INTERVAL value")?;
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.api_port < 1024 {
            anyhow::bail!("API port must be >= 1024 (got {})", self.api_port);
        }
        if self.download_timeout_secs == 0 {
            anyhow::bail!("download_timeout_secs must be greater than zero");
        }
        if self.connect_timeout_secs == 0 {
            anyhow::bail!("connect_timeout_secs must be greater than zero");
        }
        if self.progress_interval_bytes == 0 {
            anyhow::bail!("progress_interval_bytes must be greater than zero");
        }

        if !self.models_root.exists() {
            std::fs::create_dir_all(&self.models_root).with_context(|| {
                format!("Cannot create models root: {:?}", self.models_root)
            })?;
        }

        Ok(())
    }

    pub fn paths(&self) -> CachePaths {
        CachePaths::new(&self.models_root)
    }
}

/// Fixed layout of the durable models volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePaths {
    pub root: PathBuf,
    pub checkpoints: PathBuf,
    pub loras: PathBuf,
    pub embeddings: PathBuf,
    pub registry_file: PathBuf,
}

impl CachePaths {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            checkpoints: root.join("checkpoints"),
            loras: root.join("loras"),
            embeddings: root.join("embeddings"),
            registry_file: root.join("cache_registry.json"),
        }
    }

    /// Create the bucket directories if they don't exist
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [&self.checkpoints, &self.loras, &self.embeddings] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Cannot create bucket directory: {:?}", dir))?;
        }
        Ok(())
    }
}

// Default functions
fn default_api_port() -> u16 {
    9000
}
fn default_models_root() -> PathBuf {
    PathBuf::from("/workspace/models")
}
fn default_download_timeout() -> u64 {
    300
}
fn default_connect_timeout() -> u64 {
    30
}
fn default_progress_interval() -> u64 {
    100 * 1024 * 1024
}
fn default_settle_delay() -> u64 {
    2000
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_config() {
        let config = AdapterConfig::default();
        assert_eq!(config.api_port, 9000);
        assert_eq!(config.download_timeout_secs, 300);
        assert_eq!(config.eviction.max_age_days, 30);
        assert_eq!(config.eviction.keep_popular, 10);
        assert!(config.single_flight);
    }

    #[test]
    fn test_port_validation() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = AdapterConfig {
            api_port: 500,
            models_root: temp_dir.path().to_path_buf(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = AdapterConfig {
            download_timeout_secs: 0,
            models_root: temp_dir.path().to_path_buf(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_creates_models_root() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path().join("nested/models");
        let config = AdapterConfig {
            models_root: root.clone(),
            ..Default::default()
        };
        config.validate().unwrap();
        assert!(root.is_dir());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: AdapterConfig = toml::from_str(
            r#"
            api_port = 9100

            [eviction]
            keep_popular = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.api_port, 9100);
        assert_eq!(config.eviction.keep_popular, 3);
        assert_eq!(config.eviction.max_age_days, 30);
        assert_eq!(config.models_root, PathBuf::from("/workspace/models"));
    }

    #[test]
    fn test_cache_paths_layout() {
        let paths = CachePaths::new(Path::new("/workspace/models"));
        assert_eq!(paths.loras, PathBuf::from("/workspace/models/loras"));
        assert_eq!(
            paths.registry_file,
            PathBuf::from("/workspace/models/cache_registry.json")
        );
    }

    #[test]
    fn test_ensure_directories() {
        let temp_dir = tempfile::tempdir().unwrap();
        let paths = CachePaths::new(temp_dir.path());
        paths.ensure_directories().unwrap();
        assert!(paths.checkpoints.is_dir());
        assert!(paths.loras.is_dir());
        assert!(paths.embeddings.is_dir());
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        unsafe {
            std::env::set_var("SD_CACHE_API_PORT", "9500");
            std::env::set_var("SD_CACHE_MODELS_ROOT", "/tmp/sd-models");
        }
        let config = AdapterConfig::load(None);
        unsafe {
            std::env::remove_var("SD_CACHE_API_PORT");
            std::env::remove_var("SD_CACHE_MODELS_ROOT");
        }
        let config = config.unwrap();
        assert_eq!(config.api_port, 9500);
        assert_eq!(config.models_root, PathBuf::from("/tmp/sd-models"));
    }

    #[test]
    #[serial]
    fn test_invalid_env_override() {
        unsafe {
            std::env::set_var("SD_CACHE_API_PORT", "not-a-port");
        }
        let result = AdapterConfig::load(None);
        unsafe {
            std::env::remove_var("SD_CACHE_API_PORT");
        }
        assert!(result.is_err());
    }
}
