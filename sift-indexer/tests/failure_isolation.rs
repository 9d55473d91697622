//! Failures stay contained: a broken unit, file or collection never stops the
//! rest of a run, and the tracker records what actually happened.

mod common;

use anyhow::Result;
use async_trait::async_trait;
use common::{DIMS, build, memory_pipeline, payload_str, test_config};
use sift_embed::{EmbedError, EmbeddingProvider, EmbeddingResult, HashingEmbeddingProvider};
use sift_indexer::fs::{FileMetadata, Filesystem, LocalFilesystem};
use sift_indexer::retrieval::{
    change_tracker::FileStatus,
    orchestrator::{FileOutcome, IndexOptions},
    progress::CancellationFlag,
    writer::Collection,
};
use sift_indexer::storage::{
    CollectionInfo, PayloadFilter, ScoredPoint, StoreError, VectorPoint, VectorStore,
    memory_store::MemoryVectorStore,
};
use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tempfile::tempdir;

const PEOPLE_CSV: &str = "Name,Age\nAda,36\nGrace,45\nAlan,41\n";

/// Hashing embeddings, except for texts starting with `prefix`, which get a 400.
struct RefusingProvider {
    inner: HashingEmbeddingProvider,
    prefix: &'static str,
}

impl RefusingProvider {
    fn new(prefix: &'static str) -> Self {
        Self {
            inner: HashingEmbeddingProvider::new(DIMS),
            prefix,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for RefusingProvider {
    async fn embed_texts(&self, texts: &[String]) -> sift_embed::Result<EmbeddingResult> {
        if texts.iter().any(|t| t.starts_with(self.prefix)) {
            return Err(EmbedError::Service {
                status: 400,
                body: "input rejected".to_string(),
            });
        }
        self.inner.embed_texts(texts).await
    }

    fn embedding_dimension(&self) -> usize {
        DIMS
    }

    fn provider_name(&self) -> &str {
        "refusing"
    }
}

/// Memory store that rejects upserts into one collection while `broken` is set.
struct BrokenCollectionStore {
    inner: MemoryVectorStore,
    collection: &'static str,
    broken: AtomicBool,
}

impl BrokenCollectionStore {
    fn new(collection: &'static str) -> Self {
        Self {
            inner: MemoryVectorStore::new(),
            collection,
            broken: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl VectorStore for BrokenCollectionStore {
    async fn ensure_collection(&self, name: &str, vector_size: usize) -> Result<(), StoreError> {
        self.inner.ensure_collection(name, vector_size).await
    }

    async fn upsert(&self, collection: &str, points: &[VectorPoint]) -> Result<(), StoreError> {
        if collection == self.collection && self.broken.load(Ordering::SeqCst) {
            return Err(StoreError::Status {
                status: 503,
                body: "shard unavailable".to_string(),
            });
        }
        self.inner.upsert(collection, points).await
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        score_threshold: f32,
    ) -> Result<Vec<ScoredPoint>, StoreError> {
        self.inner
            .search(collection, vector, limit, score_threshold)
            .await
    }

    async fn collection_info(&self, collection: &str) -> Result<Option<CollectionInfo>, StoreError> {
        self.inner.collection_info(collection).await
    }

    async fn delete_where(&self, collection: &str, filter: &PayloadFilter) -> Result<(), StoreError> {
        self.inner.delete_where(collection, filter).await
    }

    fn store_name(&self) -> &'static str {
        "broken-collection"
    }
}

/// Local disk that reports every file whose name contains `locked` as held open.
struct LockingFilesystem;

#[async_trait]
impl Filesystem for LockingFilesystem {
    async fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        LocalFilesystem.read(path).await
    }

    async fn metadata(&self, path: &Path) -> io::Result<FileMetadata> {
        LocalFilesystem.metadata(path).await
    }

    async fn try_open_exclusive(&self, path: &Path) -> bool {
        !path.to_string_lossy().contains("locked")
    }

    async fn canonicalize(&self, path: &Path) -> PathBuf {
        LocalFilesystem.canonicalize(path).await
    }
}

/// Local disk that raises the cancellation flag on the first read.
struct CancellingFilesystem {
    cancel: CancellationFlag,
    reads: AtomicUsize,
}

#[async_trait]
impl Filesystem for CancellingFilesystem {
    async fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.cancel.cancel();
        LocalFilesystem.read(path).await
    }

    async fn metadata(&self, path: &Path) -> io::Result<FileMetadata> {
        LocalFilesystem.metadata(path).await
    }

    async fn try_open_exclusive(&self, path: &Path) -> bool {
        LocalFilesystem.try_open_exclusive(path).await
    }

    async fn canonicalize(&self, path: &Path) -> PathBuf {
        LocalFilesystem.canonicalize(path).await
    }
}

#[tokio::test]
async fn test_failed_unit_makes_file_partial() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("people.csv");
    std::fs::write(&path, PEOPLE_CSV)?;

    let mut config = test_config();
    config.embedding.batch_size = 1;
    let store = Arc::new(MemoryVectorStore::new());
    let pipeline = build(
        &config,
        Arc::new(LocalFilesystem),
        Arc::new(RefusingProvider::new("Data summary")),
        store.clone(),
    )
    .await;

    let result = pipeline
        .orchestrator()
        .index_file(&path, IndexOptions::default())
        .await;
    assert_eq!(result.files_partial, 1);
    assert_eq!(result.units_total, 6);
    assert_eq!(result.units_succeeded, 5);
    assert_eq!(result.units_failed, 1);
    assert_eq!(
        result.collections_touched,
        BTreeSet::from([Collection::StructuredRows, Collection::StructuredColumns])
    );
    assert_eq!(store.point_count("structured_summaries").await, 0);

    let canonical = LocalFilesystem.canonicalize(&path).await;
    let tracker = pipeline.orchestrator().tracker();
    let stored = tracker.get(&canonical).await?.unwrap();
    assert_eq!(stored.status, FileStatus::Partial);
    assert_eq!(stored.units_failed, 1);
    assert!(stored.last_error.unwrap().contains("400"));

    // Partial files wait for a forced run
    let again = pipeline
        .orchestrator()
        .index_file(&path, IndexOptions::default())
        .await;
    assert_eq!(again.files_skipped, 1);
    Ok(())
}

#[tokio::test]
async fn test_embedding_outage_fails_file_and_retries_next_pass() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("notes.txt");
    std::fs::write(&path, "Every text is refused here. Nothing gets embedded.")?;

    let store = Arc::new(MemoryVectorStore::new());
    let pipeline = build(
        &test_config(),
        Arc::new(LocalFilesystem),
        Arc::new(RefusingProvider::new("")),
        store.clone(),
    )
    .await;
    let orchestrator = pipeline.orchestrator();

    let result = orchestrator.index_file(&path, IndexOptions::default()).await;
    assert_eq!(result.files_failed, 1);
    assert_eq!(result.failures.len(), 1);
    assert!(result.failures[0].error.contains("Embedding service"));
    assert_eq!(store.point_count("documents").await, 0);

    let canonical = LocalFilesystem.canonicalize(&path).await;
    let stored = orchestrator.tracker().get(&canonical).await?.unwrap();
    assert_eq!(stored.status, FileStatus::Failed);
    assert!(orchestrator.tracker().needs_indexing(&canonical).await?.0);

    // Not skipped: failed files are retried without force
    let again = orchestrator.index_file(&path, IndexOptions::default()).await;
    assert_eq!(again.files_failed, 1);
    assert_eq!(again.files_skipped, 0);
    Ok(())
}

#[tokio::test]
async fn test_broken_collection_does_not_stop_the_run() -> Result<()> {
    let dir = tempdir()?;
    std::fs::write(dir.path().join("people.csv"), PEOPLE_CSV)?;
    std::fs::write(
        dir.path().join("notes.txt"),
        "A plain document. It should index without trouble.",
    )?;
    // A single column is not a table
    std::fs::write(dir.path().join("broken.csv"), "only\n1\n2\n")?;

    let store = Arc::new(BrokenCollectionStore::new("structured_columns"));
    let pipeline = build(
        &test_config(),
        Arc::new(LocalFilesystem),
        Arc::new(HashingEmbeddingProvider::new(DIMS)),
        store.clone(),
    )
    .await;
    let orchestrator = pipeline.orchestrator();
    let cancel = CancellationFlag::new();

    let result = orchestrator
        .index_directory(dir.path(), true, IndexOptions::default(), &cancel)
        .await?;
    assert_eq!(result.files_total, 3);
    assert_eq!(result.files_indexed, 1);
    assert_eq!(result.files_partial, 1);
    assert_eq!(result.files_failed, 1);
    assert!(result.failures[0].path.ends_with("broken.csv"));
    assert_eq!(store.inner.point_count("structured_rows").await, 3);
    assert_eq!(store.inner.point_count("structured_columns").await, 0);
    assert_eq!(store.inner.point_count("documents").await, 1);

    let partial = orchestrator.tracker().list_by_status(FileStatus::Partial).await?;
    assert_eq!(partial.len(), 1);
    assert!(partial[0].path.ends_with("people.csv"));

    // Once the collection recovers, a forced re-run of partial files completes
    // them and clears the points of the earlier run
    store.broken.store(false, Ordering::SeqCst);
    let rerun = orchestrator.reindex_status(FileStatus::Partial, &cancel).await?;
    assert_eq!(rerun.files_total, 1);
    assert_eq!(rerun.files_indexed, 1);
    assert_eq!(store.inner.point_count("structured_rows").await, 3);
    assert_eq!(store.inner.point_count("structured_columns").await, 2);
    assert!(
        orchestrator
            .tracker()
            .list_by_status(FileStatus::Partial)
            .await?
            .is_empty()
    );
    Ok(())
}

#[tokio::test]
async fn test_locked_file_is_deferred_and_not_recorded() -> Result<()> {
    let dir = tempdir()?;
    let locked = dir.path().join("locked.txt");
    let free = dir.path().join("free.txt");
    std::fs::write(&locked, "Someone has this open. It cannot be read yet.")?;
    std::fs::write(&free, "Nobody holds this one. It indexes fine.")?;

    let store = Arc::new(MemoryVectorStore::new());
    let pipeline = build(
        &test_config(),
        Arc::new(LockingFilesystem),
        Arc::new(HashingEmbeddingProvider::new(DIMS)),
        store.clone(),
    )
    .await;
    let orchestrator = pipeline.orchestrator();

    let result = orchestrator
        .index_directory(dir.path(), true, IndexOptions::default(), &CancellationFlag::new())
        .await?;
    assert_eq!(result.files_locked, 1);
    assert_eq!(result.files_indexed, 1);
    assert!(result.failures.is_empty());

    let points = store.points("documents").await;
    assert_eq!(points.len(), 1);
    assert_eq!(payload_str(&points[0], "file_name"), "free.txt");

    let canonical = LocalFilesystem.canonicalize(&locked).await;
    assert!(orchestrator.tracker().get(&canonical).await?.is_none());

    let report = orchestrator
        .process_file(&locked, IndexOptions::default())
        .await;
    assert_eq!(report.outcome, FileOutcome::Locked);
    Ok(())
}

#[tokio::test]
async fn test_cancellation_stops_dispatch_and_reports() -> Result<()> {
    let dir = tempdir()?;
    for name in ["a.txt", "b.txt", "c.txt"] {
        std::fs::write(
            dir.path().join(name),
            format!("Contents of {name}. Enough words for a chunk."),
        )?;
    }

    let cancel = CancellationFlag::new();
    let fs = Arc::new(CancellingFilesystem {
        cancel: cancel.clone(),
        reads: AtomicUsize::new(0),
    });
    let mut config = test_config();
    config.indexing.workers = 1;
    let store = Arc::new(MemoryVectorStore::new());
    let pipeline = build(
        &config,
        fs.clone(),
        Arc::new(HashingEmbeddingProvider::new(DIMS)),
        store.clone(),
    )
    .await;

    let result = pipeline
        .orchestrator()
        .index_directory(dir.path(), true, IndexOptions::default(), &cancel)
        .await?;
    assert!(result.cancelled);
    assert_eq!(result.files_total, 3);
    // The file in flight finishes; the rest never start
    assert_eq!(result.files_indexed, 1);
    assert_eq!(result.files_not_dispatched, 2);
    assert_eq!(fs.reads.load(Ordering::SeqCst), 1);
    assert_eq!(store.point_count("documents").await, 1);
    Ok(())
}

#[tokio::test]
async fn test_unsupported_and_decode_failures_are_reported() -> Result<()> {
    let dir = tempdir()?;
    let archive = dir.path().join("bundle.zip");
    std::fs::write(&archive, [0x50u8, 0x4b, 0x03, 0x04])?;

    let (pipeline, _store) = memory_pipeline(&test_config()).await;
    let result = pipeline
        .orchestrator()
        .index_file(&archive, IndexOptions::default())
        .await;
    assert_eq!(result.files_unsupported, 1);
    assert_eq!(result.files_failed, 0);
    let report = pipeline.status().await?;
    assert_eq!(report.total_tracked, 0);
    Ok(())
}
