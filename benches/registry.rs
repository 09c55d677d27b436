//! Cache registry and digest benchmarks
//!
//! Benchmarks for:
//! - Lookup against registries of increasing size
//! - Touch (usage update plus write-through persistence)
//! - Hit path through the resolver
//! - SHA-256 digest of artifact files

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use sd_model_cache::models::{
    ArtifactFetcher, Bucket, CacheEntry, DownloadResult, ModelReference, ModelRegistry,
    ModelResolver, digest,
};
use sd_model_cache::CachePaths;
use std::hint::black_box;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::runtime::Runtime;

/// Fetcher that must never be called on the hit path
struct NoNetwork;

#[async_trait::async_trait]
impl ArtifactFetcher for NoNetwork {
    async fn download(&self, url: &str, destination: &Path, _: Option<&str>) -> DownloadResult {
        panic!("unexpected download of {} to {:?}", url, destination);
    }
}

/// Create a registry with `count` LoRA entries backed by real files
async fn create_populated_registry(count: usize) -> (Arc<ModelRegistry>, CachePaths, TempDir) {
    let dir = TempDir::new().unwrap();
    let paths = CachePaths::new(dir.path());
    paths.ensure_directories().unwrap();
    let registry = Arc::new(ModelRegistry::open(paths.registry_file.clone()).await);

    for i in 0..count {
        let name = format!("lora-{}", i);
        let path = paths.loras.join(format!("{}.safetensors", name));
        std::fs::write(&path, &name).unwrap();
        registry
            .upsert(
                Bucket::Loras,
                &name,
                CacheEntry::new(format!("http://host/{}.safetensors", name), path, None, 1),
            )
            .await
            .unwrap();
    }

    (registry, paths, dir)
}

/// Benchmark registry lookup
fn bench_registry_lookup(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("registry_lookup");

    for entry_count in [10, 100, 1000] {
        let (registry, _paths, _dir) = rt.block_on(create_populated_registry(entry_count));
        let name = format!("lora-{}", entry_count / 2);

        group.bench_with_input(
            BenchmarkId::new("entries", entry_count),
            &registry,
            |b, registry| {
                b.to_async(&rt).iter(|| async {
                    black_box(registry.lookup(Bucket::Loras, &name).await);
                });
            },
        );
    }
    group.finish();
}

/// Benchmark touch, which persists the whole registry
fn bench_registry_touch(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("registry_touch");
    group.sample_size(20);

    for entry_count in [10, 100, 1000] {
        let (registry, _paths, _dir) = rt.block_on(create_populated_registry(entry_count));

        group.bench_with_input(
            BenchmarkId::new("entries", entry_count),
            &registry,
            |b, registry| {
                b.to_async(&rt).iter(|| async {
                    registry.touch(Bucket::Loras, "lora-0").await.unwrap();
                });
            },
        );
    }
    group.finish();
}

/// Benchmark a full cache hit through the resolver
fn bench_resolver_hit(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let (registry, paths, _dir) = rt.block_on(create_populated_registry(100));
    let resolver = ModelResolver::new(registry, Arc::new(NoNetwork), paths);
    let reference = ModelReference::new("lora-7", "http://host/lora-7.safetensors");

    c.bench_function("resolver_hit", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(resolver.resolve(Bucket::Loras, &reference).await.unwrap());
        });
    });
}

/// Benchmark SHA-256 over files of increasing size
fn bench_digest(c: &mut Criterion) {
    let mut group = c.benchmark_group("digest");
    let dir = TempDir::new().unwrap();

    for size_mb in [1usize, 16, 64] {
        let path = dir.path().join(format!("{}mb.safetensors", size_mb));
        std::fs::write(&path, vec![0xABu8; size_mb * 1024 * 1024]).unwrap();

        group.throughput(Throughput::Bytes((size_mb * 1024 * 1024) as u64));
        group.bench_with_input(BenchmarkId::new("mb", size_mb), &path, |b, path| {
            b.iter(|| black_box(digest(path).unwrap()));
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_registry_lookup,
    bench_registry_touch,
    bench_resolver_hit,
    bench_digest
);
criterion_main!(benches);
