//! Drives files through extraction, shaping, embedding and writing.
//!
//! The orchestrator owns the per-file state machine and the fan-out over many
//! files. Every file ends in exactly one terminal outcome, and every outcome
//! that reflects real work (indexed, partial, failed) is recorded in the
//! change tracker exactly once.
//!
//! ## Per-file States
//!
//! ```text
//! pending → extracting → chunking ──┐
//!                      → analyzing ─┴→ embedding → writing → indexed | partial
//!                ↘ failed (decode, I/O, all batches failed, nothing written)
//! ```
//!
//! A file whose fingerprint is unchanged ends `skipped`; an unknown extension
//! ends `unsupported`; a file another process keeps locked ends `locked`.
//! None of those three touch the tracker, so the next pass sees them again.
//!
//! ## Concurrency
//!
//! - Up to `workers` files are processed at once.
//! - Work on any single path is serialized through the tracker's path lock.
//! - Cancellation stops dispatch; files already started run to completion.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use sift_indexer::retrieval::orchestrator::IndexOptions;
//! use sift_indexer::retrieval::progress::CancellationFlag;
//! use std::path::Path;
//!
//! # async fn example(orchestrator: sift_indexer::retrieval::orchestrator::IndexOrchestrator) -> anyhow::Result<()> {
//! let cancel = CancellationFlag::new();
//! let result = orchestrator
//!     .index_directory(Path::new("./reports"), true, IndexOptions::default(), &cancel)
//!     .await?;
//! println!("{} indexed, {} skipped", result.files_indexed, result.files_skipped);
//! # Ok(())
//! # }
//! ```

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use futures::future;
use futures::stream::{self, StreamExt};
use itertools::Itertools;
use serde::Serialize;
use sift_context::{
    Chunker, ChunkingConfig, ExtractedContent, SchemaAnalyzer, extract, is_supported_extension,
};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::batcher::EmbeddingBatcher;
use super::change_tracker::{ChangeTracker, FileFingerprint, FileStatus, hash_bytes};
use super::progress::{CancellationFlag, ProgressEvent};
use super::writer::{BaseMetadata, Collection, VectorIndexWriter};
use crate::error::IndexError;
use crate::fs::{FileMetadata, Filesystem};

/// Configuration for the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Files processed concurrently
    pub workers: usize,
    /// Larger files are recorded as failed without being read
    pub max_file_bytes: u64,
    /// Re-checks of a locked file before giving up on it for this pass
    pub lock_retry_attempts: u32,
    /// Delay before the first lock re-check; doubles each time
    pub lock_retry_backoff: Duration,
    /// Honour `.gitignore` and `.ignore` files during directory walks
    pub follow_gitignore: bool,
    pub chunking: ChunkingConfig,
    pub analyzer: SchemaAnalyzer,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_file_bytes: 100 * 1024 * 1024,
            lock_retry_attempts: 5,
            lock_retry_backoff: Duration::from_millis(500),
            follow_gitignore: true,
            chunking: ChunkingConfig::default(),
            analyzer: SchemaAnalyzer::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_max_file_bytes(mut self, bytes: u64) -> Self {
        self.max_file_bytes = bytes;
        self
    }

    pub fn with_lock_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.lock_retry_attempts = attempts;
        self.lock_retry_backoff = backoff;
        self
    }

    pub fn with_follow_gitignore(mut self, follow: bool) -> Self {
        self.follow_gitignore = follow;
        self
    }

    pub fn with_chunking(mut self, chunking: ChunkingConfig) -> Self {
        self.chunking = chunking;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexOptions {
    /// Bypass the change check and re-index unconditionally
    pub force: bool,
}

impl IndexOptions {
    pub fn forced() -> Self {
        Self { force: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileState {
    Pending,
    Extracting,
    Chunking,
    Analyzing,
    Embedding,
    Writing,
}

impl FileState {
    fn as_str(&self) -> &'static str {
        match self {
            FileState::Pending => "pending",
            FileState::Extracting => "extracting",
            FileState::Chunking => "chunking",
            FileState::Analyzing => "analyzing",
            FileState::Embedding => "embedding",
            FileState::Writing => "writing",
        }
    }
}

/// Terminal outcome of one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOutcome {
    Indexed,
    Partial,
    Failed,
    Skipped,
    Unsupported,
    Locked,
}

impl FileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileOutcome::Indexed => "indexed",
            FileOutcome::Partial => "partial",
            FileOutcome::Failed => "failed",
            FileOutcome::Skipped => "skipped",
            FileOutcome::Unsupported => "unsupported",
            FileOutcome::Locked => "locked",
        }
    }
}

impl std::fmt::Display for FileOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to one file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileReport {
    pub path: PathBuf,
    pub outcome: FileOutcome,
    pub units_total: usize,
    pub units_succeeded: usize,
    pub units_failed: usize,
    pub collections_touched: BTreeSet<Collection>,
    pub error: Option<String>,
}

impl FileReport {
    fn new(path: &Path, outcome: FileOutcome) -> Self {
        Self {
            path: path.to_path_buf(),
            outcome,
            units_total: 0,
            units_succeeded: 0,
            units_failed: 0,
            collections_touched: BTreeSet::new(),
            error: None,
        }
    }

    fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileFailure {
    pub path: PathBuf,
    pub error: String,
}

/// Aggregate over one `index_file`, `index_directory` or `reindex_status` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndexingResult {
    /// Files considered, including unsupported ones found by the walk
    pub files_total: usize,
    pub files_indexed: usize,
    pub files_partial: usize,
    pub files_failed: usize,
    pub files_skipped: usize,
    pub files_unsupported: usize,
    pub files_locked: usize,
    /// Files never started because the run was cancelled
    pub files_not_dispatched: usize,
    pub units_total: usize,
    pub units_succeeded: usize,
    pub units_failed: usize,
    pub collections_touched: BTreeSet<Collection>,
    pub elapsed_ms: u64,
    pub cancelled: bool,
    pub failures: Vec<FileFailure>,
}

impl IndexingResult {
    /// Files that reached a terminal outcome.
    pub fn files_attempted(&self) -> usize {
        self.files_indexed
            + self.files_partial
            + self.files_failed
            + self.files_skipped
            + self.files_unsupported
            + self.files_locked
    }

    fn absorb(&mut self, report: &FileReport) {
        match report.outcome {
            FileOutcome::Indexed => self.files_indexed += 1,
            FileOutcome::Partial => self.files_partial += 1,
            FileOutcome::Failed => self.files_failed += 1,
            FileOutcome::Skipped => self.files_skipped += 1,
            FileOutcome::Unsupported => self.files_unsupported += 1,
            FileOutcome::Locked => self.files_locked += 1,
        }
        self.units_total += report.units_total;
        self.units_succeeded += report.units_succeeded;
        self.units_failed += report.units_failed;
        self.collections_touched
            .extend(report.collections_touched.iter().copied());
        if report.outcome == FileOutcome::Failed {
            self.failures.push(FileFailure {
                path: report.path.clone(),
                error: report.error.clone().unwrap_or_default(),
            });
        }
    }
}

/// Running totals since the orchestrator was built.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessingStats {
    pub files_processed: usize,
    pub units_written: usize,
    pub errors: usize,
}

pub struct IndexOrchestrator {
    config: OrchestratorConfig,
    fs: Arc<dyn Filesystem>,
    tracker: Arc<ChangeTracker>,
    chunker: Chunker,
    batcher: EmbeddingBatcher,
    writer: VectorIndexWriter,
    progress: broadcast::Sender<ProgressEvent>,
    stats: RwLock<ProcessingStats>,
}

impl IndexOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        fs: Arc<dyn Filesystem>,
        tracker: Arc<ChangeTracker>,
        batcher: EmbeddingBatcher,
        writer: VectorIndexWriter,
    ) -> Self {
        let (progress, _) = broadcast::channel(256);
        Self {
            chunker: Chunker::new(config.chunking.clone()),
            config,
            fs,
            tracker,
            batcher,
            writer,
            progress,
            stats: RwLock::new(ProcessingStats::default()),
        }
    }

    /// Receives one [`ProgressEvent`] per finished file.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress.subscribe()
    }

    pub fn tracker(&self) -> &Arc<ChangeTracker> {
        &self.tracker
    }

    pub fn writer(&self) -> &VectorIndexWriter {
        &self.writer
    }

    pub fn batcher(&self) -> &EmbeddingBatcher {
        &self.batcher
    }

    pub async fn stats(&self) -> ProcessingStats {
        self.stats.read().await.clone()
    }

    pub async fn index_file(&self, path: &Path, options: IndexOptions) -> IndexingResult {
        let start = Instant::now();
        let report = self.process_file(path, options).await;
        self.publish(1, 1, &report);

        let mut result = IndexingResult {
            files_total: 1,
            ..IndexingResult::default()
        };
        result.absorb(&report);
        result.elapsed_ms = start.elapsed().as_millis() as u64;
        result
    }

    pub async fn index_directory(
        &self,
        root: &Path,
        recursive: bool,
        options: IndexOptions,
        cancel: &CancellationFlag,
    ) -> Result<IndexingResult> {
        let start = Instant::now();
        if !root.is_dir() {
            bail!("{} is not a directory", root.display());
        }

        let walk_root = root.to_path_buf();
        let follow_gitignore = self.config.follow_gitignore;
        let discovery =
            tokio::task::spawn_blocking(move || discover(&walk_root, recursive, follow_gitignore))
                .await
                .context("Directory walk panicked")?;
        info!(
            root = %root.display(),
            files = discovery.files.len(),
            unsupported = discovery.unsupported,
            "Discovered files"
        );

        let mut result = self.run_many(discovery.files, options, cancel).await;
        result.files_total += discovery.unsupported;
        result.files_unsupported += discovery.unsupported;
        result.elapsed_ms = start.elapsed().as_millis() as u64;
        log_summary(root, &result);
        Ok(result)
    }

    /// Force re-indexes every tracked file whose last run ended with `status`.
    pub async fn reindex_status(
        &self,
        status: FileStatus,
        cancel: &CancellationFlag,
    ) -> Result<IndexingResult> {
        let start = Instant::now();
        let files = self
            .tracker
            .list_by_status(status)
            .await
            .context("Failed to list tracked files")?
            .into_iter()
            .map(|fingerprint| fingerprint.path)
            .collect();
        let mut result = self.run_many(files, IndexOptions::forced(), cancel).await;
        result.elapsed_ms = start.elapsed().as_millis() as u64;
        Ok(result)
    }

    /// Deletes the file's points from every collection and forgets its
    /// fingerprint. Returns whether the tracker knew the file.
    pub async fn remove_file(&self, path: &Path) -> Result<bool> {
        let path = self.fs.canonicalize(path).await;
        let _guard = self.tracker.lock_path(&path).await;
        self.writer
            .remove_file(&path.to_string_lossy())
            .await
            .with_context(|| format!("Failed to delete points of {}", path.display()))?;
        let existed = self.tracker.remove(&path).await?;
        info!(path = %path.display(), "Removed file from the index");
        Ok(existed)
    }

    async fn run_many(
        &self,
        files: Vec<PathBuf>,
        options: IndexOptions,
        cancel: &CancellationFlag,
    ) -> IndexingResult {
        let total = files.len();
        let done = AtomicUsize::new(0);
        let done = &done;

        let reports: Vec<FileReport> = stream::iter(files)
            .take_while(|_| future::ready(!cancel.is_cancelled()))
            .map(|path| async move {
                let report = self.process_file(&path, options).await;
                let files_done = done.fetch_add(1, Ordering::SeqCst) + 1;
                self.publish(files_done, total, &report);
                report
            })
            .buffer_unordered(self.config.workers.max(1))
            .collect()
            .await;

        let mut result = IndexingResult {
            files_total: total,
            files_not_dispatched: total - reports.len(),
            cancelled: cancel.is_cancelled(),
            ..IndexingResult::default()
        };
        for report in &reports {
            result.absorb(report);
        }
        result
    }

    fn publish(&self, files_done: usize, files_total: usize, report: &FileReport) {
        // No subscribers is fine
        let _ = self.progress.send(ProgressEvent {
            files_done,
            files_total,
            current_path: report.path.clone(),
            outcome: report.outcome,
        });
    }

    /// Runs one file to a terminal outcome. Never fails; errors become the outcome.
    pub async fn process_file(&self, path: &Path, options: IndexOptions) -> FileReport {
        let path = self.fs.canonicalize(path).await;
        let _guard = self.tracker.lock_path(&path).await;
        let report = self.run_pipeline(&path, options).await;

        match report.outcome {
            FileOutcome::Indexed | FileOutcome::Partial => info!(
                path = %path.display(),
                outcome = %report.outcome,
                units = report.units_succeeded,
                failed_units = report.units_failed,
                "Indexed file"
            ),
            FileOutcome::Failed => warn!(
                path = %path.display(),
                error = report.error.as_deref().unwrap_or(""),
                "Failed to index file"
            ),
            FileOutcome::Locked => warn!(path = %path.display(), "File is locked, deferred"),
            FileOutcome::Skipped | FileOutcome::Unsupported => {
                debug!(path = %path.display(), outcome = %report.outcome, "Not indexed")
            }
        }

        let mut stats = self.stats.write().await;
        stats.files_processed += 1;
        stats.units_written += report.units_succeeded;
        if report.outcome == FileOutcome::Failed {
            stats.errors += 1;
        }
        report
    }

    async fn run_pipeline(&self, path: &Path, options: IndexOptions) -> FileReport {
        enter(path, FileState::Pending);
        let extension = extension_of(path);
        if !is_supported_extension(&extension) {
            let err = IndexError::UnsupportedFormat { extension };
            info!(path = %path.display(), "Skipping file: {err}");
            return FileReport::new(path, FileOutcome::Unsupported).with_error(err);
        }

        if !options.force {
            match self.tracker.needs_indexing(path).await {
                Ok((false, _)) => return FileReport::new(path, FileOutcome::Skipped),
                Ok((true, _)) => {}
                Err(err) => return FileReport::new(path, FileOutcome::Failed).with_error(err),
            }
        }

        let metadata = match self.fs.metadata(path).await {
            Ok(metadata) => metadata,
            Err(err) => {
                let err = IndexError::io(path, err);
                return self.record_failure(path, None, String::new(), err, 0).await;
            }
        };
        if metadata.size > self.config.max_file_bytes {
            let err = IndexError::io(
                path,
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!(
                        "file too large: {} bytes exceeds the {} byte limit",
                        metadata.size, self.config.max_file_bytes
                    ),
                ),
            );
            return self
                .record_failure(path, Some(&metadata), String::new(), err, 0)
                .await;
        }

        if !self.wait_until_unlocked(path).await {
            return FileReport::new(path, FileOutcome::Locked);
        }

        enter(path, FileState::Extracting);
        let bytes = match self.fs.read(path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                let err = IndexError::io(path, err);
                return self
                    .record_failure(path, Some(&metadata), String::new(), err, 0)
                    .await;
            }
        };
        let content_hash = hash_bytes(&bytes);
        let content = match extract(&bytes, &extension) {
            Ok(content) => content,
            Err(err) => {
                return self
                    .record_failure(path, Some(&metadata), content_hash, err.into(), 0)
                    .await;
            }
        };
        drop(bytes);

        let base = BaseMetadata::new(path, &metadata).with_extraction(content.metadata());
        let units = match &content {
            ExtractedContent::Prose(document) => {
                enter(path, FileState::Chunking);
                self.chunker.chunk(&document.text, &base.file_path)
            }
            ExtractedContent::Tabular(document) => {
                enter(path, FileState::Analyzing);
                self.config.analyzer.decompose(document, &base.file_path)
            }
        };
        let units_total = units.len();

        let mut report = FileReport::new(path, FileOutcome::Indexed);
        report.units_total = units_total;
        if units.is_empty() {
            debug!(path = %path.display(), "No content units produced");
            if let Err(err) = self.writer.remove_file(&base.file_path).await {
                warn!(path = %path.display(), "Could not delete points of emptied file: {err}");
            }
            let fingerprint =
                fingerprint(path, &metadata, content_hash, FileStatus::Indexed, &report);
            return self.record(fingerprint, report).await;
        }

        enter(path, FileState::Embedding);
        let embedded = self.batcher.embed(units).await;
        if embedded.all_failed() {
            let source = embedded.last_error.unwrap_or_else(|| {
                sift_embed::EmbedError::malformed("every embedding batch failed")
            });
            return self
                .record_failure(path, Some(&metadata), content_hash, source.into(), units_total)
                .await;
        }

        enter(path, FileState::Writing);
        let run_id = Uuid::now_v7().to_string();
        let written = self.writer.write(&embedded.embedded, &base, &run_id).await;

        report.units_succeeded = written.succeeded;
        report.units_failed = embedded.failed.len() + written.failed;
        report.collections_touched = written.collections_touched;
        report.error = written
            .last_error
            .or_else(|| embedded.last_error.map(|err| err.to_string()));
        report.outcome = if report.units_failed == 0 {
            FileOutcome::Indexed
        } else if report.units_succeeded == 0 {
            FileOutcome::Failed
        } else {
            FileOutcome::Partial
        };

        if report.outcome == FileOutcome::Indexed {
            if let Err(err) = self.writer.remove_superseded(&base.file_path, &run_id).await {
                warn!(path = %path.display(), "Could not delete superseded points: {err}");
            }
        }

        let status = match report.outcome {
            FileOutcome::Indexed => FileStatus::Indexed,
            FileOutcome::Partial => FileStatus::Partial,
            _ => FileStatus::Failed,
        };
        let fingerprint = fingerprint(path, &metadata, content_hash, status, &report);
        self.record(fingerprint, report).await
    }

    async fn record(&self, fingerprint: FileFingerprint, report: FileReport) -> FileReport {
        match self.tracker.record_result(&fingerprint).await {
            Ok(()) => report,
            Err(err) => FileReport {
                outcome: FileOutcome::Failed,
                error: Some(err.to_string()),
                ..report
            },
        }
    }

    async fn record_failure(
        &self,
        path: &Path,
        metadata: Option<&FileMetadata>,
        content_hash: String,
        err: IndexError,
        units_total: usize,
    ) -> FileReport {
        debug!(path = %path.display(), kind = err.kind(), "Entering failed state");
        let mut report = FileReport::new(path, FileOutcome::Failed).with_error(&err);
        report.units_total = units_total;
        report.units_failed = units_total;

        let fingerprint = FileFingerprint {
            path: path.to_path_buf(),
            content_hash,
            last_modified: metadata.map_or(DateTime::UNIX_EPOCH, |m| m.modified),
            last_indexed: Utc::now(),
            unit_count: units_total,
            units_failed: units_total,
            status: FileStatus::Failed,
            target_collection: String::new(),
            last_error: Some(err.to_string()),
        };
        self.record(fingerprint, report).await
    }

    async fn wait_until_unlocked(&self, path: &Path) -> bool {
        for attempt in 0..=self.config.lock_retry_attempts {
            if self.fs.try_open_exclusive(path).await {
                return true;
            }
            if attempt == self.config.lock_retry_attempts {
                break;
            }
            let delay = self.config.lock_retry_backoff * 2u32.pow(attempt.min(6));
            debug!(
                path = %path.display(),
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "File is locked, waiting"
            );
            tokio::time::sleep(delay).await;
        }
        false
    }
}

fn enter(path: &Path, state: FileState) {
    debug!(path = %path.display(), state = state.as_str(), "File state");
}

fn fingerprint(
    path: &Path,
    metadata: &FileMetadata,
    content_hash: String,
    status: FileStatus,
    report: &FileReport,
) -> FileFingerprint {
    FileFingerprint {
        path: path.to_path_buf(),
        content_hash,
        last_modified: metadata.modified,
        last_indexed: Utc::now(),
        unit_count: report.units_total,
        units_failed: report.units_failed,
        status,
        target_collection: report
            .collections_touched
            .iter()
            .map(Collection::name)
            .join(","),
        last_error: report.error.clone(),
    }
}

fn log_summary(root: &Path, result: &IndexingResult) {
    info!(
        root = %root.display(),
        indexed = result.files_indexed,
        partial = result.files_partial,
        failed = result.files_failed,
        skipped = result.files_skipped,
        unsupported = result.files_unsupported,
        locked = result.files_locked,
        units = result.units_succeeded,
        elapsed_ms = result.elapsed_ms,
        cancelled = result.cancelled,
        "Indexing run finished"
    );
}

/// Lowercased extension without the dot; empty when there is none.
pub fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Editor and office temp files that never hold real content.
pub fn is_temp_file(path: &Path) -> bool {
    let Some(name) = path.file_name().map(|n| n.to_string_lossy()) else {
        return false;
    };
    name.starts_with("~$")
        || name.starts_with(".#")
        || name.ends_with('~')
        || name.starts_with('~')
        || matches!(extension_of(path).as_str(), "tmp" | "swp" | "swx" | "part")
}

/// Whether a path is worth handing to the orchestrator at all.
pub fn is_candidate_file(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .is_some_and(|name| name.to_string_lossy().starts_with('.'));
    !hidden && !is_temp_file(path) && is_supported_extension(&extension_of(path))
}

struct Discovery {
    files: Vec<PathBuf>,
    unsupported: usize,
}

fn discover(root: &Path, recursive: bool, follow_gitignore: bool) -> Discovery {
    let mut builder = ignore::WalkBuilder::new(root);
    builder
        .hidden(true)
        .git_ignore(follow_gitignore)
        .git_global(follow_gitignore)
        .git_exclude(follow_gitignore)
        .ignore(follow_gitignore)
        .parents(follow_gitignore)
        .require_git(false);
    if !recursive {
        builder.max_depth(Some(1));
    }

    let mut discovery = Discovery {
        files: Vec::new(),
        unsupported: 0,
    };
    for entry in builder.build() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!("Skipping unreadable directory entry: {err}");
                continue;
            }
        };
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        let path = entry.into_path();
        if is_temp_file(&path) {
            continue;
        }
        if is_supported_extension(&extension_of(&path)) {
            discovery.files.push(path);
        } else {
            debug!(path = %path.display(), "Skipping unsupported file");
            discovery.unsupported += 1;
        }
    }
    discovery.files.sort();
    discovery
}
