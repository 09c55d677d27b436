//! SD Model Cache - checkpoint and LoRA cache for image-generation workers
//!
//! Resolves declarative model references to verified files on a durable
//! volume, downloading on a miss and tracking usage in a persisted registry
//! so repeated jobs start without refetching multi-gigabyte artifacts.

pub mod api;
pub mod config;
pub mod disk;
pub mod error;
pub mod metrics;
pub mod models;
pub mod storage;

pub use config::{AdapterConfig, CachePaths, EvictionConfig};
pub use error::{ApiError, CacheError, CacheResult};
pub use models::{
    ArtifactFetcher, Bucket, CacheEntry, CacheStats, EvictionScheduler, HttpDownloader,
    LoraReference, ModelReference, ModelRegistry, ModelRequest, ModelResolver, PreparedModels,
    build_prompt_fragment,
};
pub use storage::{FileSystemStorage, StorageBackend};
