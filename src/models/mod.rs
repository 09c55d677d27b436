//! Model cache module
//!
//! Provides functionality for:
//! - Describing model references and where they land on the volume
//! - Downloading artifacts over HTTP with integrity checks
//! - Tracking cached files in a persisted registry
//! - Resolving generation requests to local paths
//! - Pruning stale, unpopular entries

pub mod download;
pub mod eviction;
pub mod reference;
pub mod registry;
pub mod resolver;
pub mod verify;

pub use download::{ArtifactFetcher, DownloadResult, HttpDownloader, partial_path};
pub use eviction::{EvictedModel, EvictionReport, EvictionScheduler, evict};
pub use reference::{Bucket, LoraReference, ModelReference};
pub use registry::{BucketStats, CacheEntry, CacheRegistry, CacheStats, ModelRegistry};
pub use resolver::{
    ModelRequest, ModelResolver, PreparedModels, ResolutionFailure, Resolved,
    build_prompt_fragment, lora_tag_name,
};
pub use verify::{digest, digest_file, verify, verify_file};
