//! Caller-supplied model references and the buckets they land in

use crate::config::CachePaths;
use crate::error::{CacheError, CacheResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const DEFAULT_EXTENSION: &str = "safetensors";
const MAX_EXTENSION_LEN: usize = 16;

/// Logical category of a cached artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    Checkpoints,
    Loras,
    Embeddings,
}

impl Bucket {
    pub const ALL: [Bucket; 3] = [Bucket::Checkpoints, Bucket::Loras, Bucket::Embeddings];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Checkpoints => "checkpoints",
            Self::Loras => "loras",
            Self::Embeddings => "embeddings",
        }
    }

    /// Directory on the models volume that holds this bucket's files
    pub fn dir(&self, paths: &CachePaths) -> PathBuf {
        match self {
            Self::Checkpoints => paths.checkpoints.clone(),
            Self::Loras => paths.loras.clone(),
            Self::Embeddings => paths.embeddings.clone(),
        }
    }
}

impl std::fmt::Display for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Bucket {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "checkpoints" | "checkpoint" => Ok(Self::Checkpoints),
            "loras" | "lora" => Ok(Self::Loras),
            "embeddings" | "embedding" => Ok(Self::Embeddings),
            other => Err(CacheError::InvalidReference(format!(
                "unknown bucket '{}'",
                other
            ))),
        }
    }
}

/// Declarative reference to a checkpoint, LoRA or embedding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelReference {
    /// Logical cache key, unique within its bucket
    pub name: String,
    /// Canonical remote source
    pub url: String,
    /// Expected SHA-256 of the content, hex encoded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl ModelReference {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            hash: None,
        }
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }

    /// Requested hash, ignoring blank strings sent by sloppy callers
    pub fn expected_hash(&self) -> Option<&str> {
        self.hash.as_deref().map(str::trim).filter(|h| !h.is_empty())
    }

    /// Reject names that would escape the bucket directory
    pub fn validate(&self) -> CacheResult<()> {
        let name = self.name.as_str();
        if name.trim().is_empty() {
            return Err(CacheError::InvalidReference(
                "model name cannot be empty".to_string(),
            ));
        }
        // The name is both the registry key and the file stem; they must agree
        if name != name.trim() {
            return Err(CacheError::InvalidReference(format!(
                "model name '{}' has leading or trailing whitespace",
                self.name
            )));
        }
        if name.contains('/') || name.contains('\\') || name.contains("..") || name.contains('\0')
        {
            return Err(CacheError::InvalidReference(format!(
                "model name '{}' cannot contain path separators",
                self.name
            )));
        }
        if self.url.trim().is_empty() {
            return Err(CacheError::InvalidReference(format!(
                "model '{}' has no source URL",
                self.name
            )));
        }
        Ok(())
    }

    /// File extension of the remote artifact, falling back to `safetensors`
    pub fn extension(&self) -> String {
        let path = match reqwest::Url::parse(&self.url) {
            Ok(url) => url.path().to_string(),
            Err(_) => self
                .url
                .split(['?', '#'])
                .next()
                .unwrap_or_default()
                .to_string(),
        };

        path.rsplit('/')
            .next()
            .and_then(|segment| segment.rsplit_once('.'))
            .map(|(_, ext)| ext)
            .filter(|ext| {
                !ext.is_empty()
                    && ext.len() <= MAX_EXTENSION_LEN
                    && ext.chars().all(|c| c.is_ascii_alphanumeric())
            })
            .map(|ext| ext.to_ascii_lowercase())
            .unwrap_or_else(|| DEFAULT_EXTENSION.to_string())
    }

    /// Deterministic location of this reference inside `bucket`
    pub fn destination(&self, bucket: Bucket, paths: &CachePaths) -> CacheResult<PathBuf> {
        self.validate()?;
        let file_name = format!("{}.{}", self.name, self.extension());
        Ok(bucket.dir(paths).join(file_name))
    }
}

/// LoRA entry in a generation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraReference {
    pub name: String,
    pub url: String,
    /// Influence applied in the prompt tag; not used by the cache
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl LoraReference {
    pub fn new(name: impl Into<String>, url: impl Into<String>, scale: f64) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            scale,
            hash: None,
        }
    }

    pub fn model(&self) -> ModelReference {
        ModelReference {
            name: self.name.clone(),
            url: self.url.clone(),
            hash: self.hash.clone(),
        }
    }
}

fn default_scale() -> f64 {
    1.0
}
