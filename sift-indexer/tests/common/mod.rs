//! Shared fixtures for the pipeline integration tests.
#![allow(dead_code)]

use sift_embed::{EmbedConfig, EmbeddingProvider, HashingEmbeddingProvider};
use sift_indexer::config::{SiftConfig, StoreKind};
use sift_indexer::fs::{Filesystem, LocalFilesystem};
use sift_indexer::pipeline::Pipeline;
use sift_indexer::retrieval::change_tracker::ChangeTracker;
use sift_indexer::storage::{VectorPoint, VectorStore, memory_store::MemoryVectorStore};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

pub const DIMS: usize = 64;

/// Hashing embeddings, in-memory store, no lock waits.
pub fn test_config() -> SiftConfig {
    let mut config = SiftConfig::default();
    config.embedding.provider = EmbedConfig::hashing(DIMS);
    config.embedding.retry_backoff_ms = 1;
    config.vector_store.kind = StoreKind::Memory;
    config.indexing.workers = 2;
    config.indexing.lock_retry_attempts = 0;
    config.indexing.lock_retry_backoff_ms = 1;
    config
}

pub async fn build(
    config: &SiftConfig,
    fs: Arc<dyn Filesystem>,
    provider: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorStore>,
) -> Pipeline {
    let tracker = Arc::new(ChangeTracker::open_memory(fs.clone()).await.unwrap());
    Pipeline::assemble(config, fs, provider, store, tracker)
        .await
        .unwrap()
}

/// The default setup: local disk, hashing provider and a memory store the test can inspect.
pub async fn memory_pipeline(config: &SiftConfig) -> (Pipeline, Arc<MemoryVectorStore>) {
    let store = Arc::new(MemoryVectorStore::new());
    let pipeline = build(
        config,
        Arc::new(LocalFilesystem),
        Arc::new(HashingEmbeddingProvider::new(DIMS)),
        store.clone(),
    )
    .await;
    (pipeline, store)
}

pub fn payload_str<'a>(point: &'a VectorPoint, key: &str) -> &'a str {
    point.payload.get(key).and_then(|v| v.as_str()).unwrap_or("")
}

pub fn texts(points: &[VectorPoint]) -> Vec<String> {
    let mut texts: Vec<String> = points
        .iter()
        .map(|p| payload_str(p, "text").to_string())
        .collect();
    texts.sort();
    texts
}

/// Rewrites `path` and moves its mtime forward, so the change is seen even on
/// filesystems with coarse timestamps.
pub fn rewrite(path: &Path, content: &str) {
    std::fs::write(path, content).unwrap();
    let file = std::fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(5))
        .unwrap();
}
