//! Watches directories and feeds changed files to the indexer.
//!
//! Filesystem events are debounced, so a burst of writes to one file becomes a
//! single event, then pushed through a channel to a listener that indexes up to
//! `concurrency` files at once. Temp files, hidden files and unsupported
//! extensions are dropped before they reach the indexer. A file that is still
//! locked by another process is re-queued with a growing delay.
//!
//! Deleting a file does not remove its points; use `sift forget` for that.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use notify_debouncer_mini::{DebounceEventResult, Debouncer, new_debouncer};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::orchestrator::{FileOutcome, IndexOptions, IndexOrchestrator, is_candidate_file};

/// Anything that can index one path. The orchestrator in production, a
/// recorder in tests.
#[async_trait]
pub trait FileIndexer: Send + Sync {
    async fn index_path(&self, path: &Path) -> FileOutcome;
}

#[async_trait]
impl FileIndexer for IndexOrchestrator {
    async fn index_path(&self, path: &Path) -> FileOutcome {
        self.process_file(path, IndexOptions::default()).await.outcome
    }
}

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub debounce: Duration,
    pub recursive: bool,
    /// Files indexed at once
    pub concurrency: usize,
    /// Times a locked file is re-queued before it is left for the next change
    pub max_deferrals: u32,
    /// Delay before the first re-queue; grows linearly with each deferral
    pub deferral_delay: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(2),
            recursive: true,
            concurrency: 4,
            max_deferrals: 3,
            deferral_delay: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct WatchEvent {
    path: PathBuf,
    deferrals: u32,
}

pub struct FileWatcher {
    debouncer: Debouncer<RecommendedWatcher>,
    shutdown: oneshot::Sender<()>,
    listener: JoinHandle<()>,
}

impl FileWatcher {
    /// Starts watching `directories`. Must be called inside a tokio runtime.
    pub fn start<I: FileIndexer + 'static>(
        directories: &[PathBuf],
        config: WatcherConfig,
        indexer: Arc<I>,
    ) -> Result<Self> {
        let (events_tx, events_rx) = flume::unbounded();
        let (shutdown, stop) = oneshot::channel();

        // The listener needs to exist before events start arriving
        let listener = tokio::spawn(listen(
            events_rx,
            events_tx.clone(),
            indexer,
            config.clone(),
            stop,
        ));

        let mut debouncer = new_debouncer(config.debounce, move |res: DebounceEventResult| {
            match res {
                Ok(events) => {
                    for event in events {
                        let event = WatchEvent {
                            path: event.path,
                            deferrals: 0,
                        };
                        if events_tx.send(event).is_err() {
                            break;
                        }
                    }
                }
                Err(err) => warn!("File watch error: {err}"),
            }
        })
        .context("Failed to create file watcher")?;

        let mode = if config.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        for directory in directories {
            debouncer
                .watcher()
                .watch(directory, mode)
                .with_context(|| format!("Failed to watch {}", directory.display()))?;
            info!(directory = %directory.display(), "Watching for changes");
        }

        Ok(Self {
            debouncer,
            shutdown,
            listener,
        })
    }

    /// Stops watching and waits for files already being indexed.
    pub async fn shutdown(self) -> Result<()> {
        let FileWatcher {
            debouncer,
            shutdown,
            listener,
        } = self;
        drop(debouncer);
        let _ = shutdown.send(());
        listener.await.context("Watch listener panicked")?;
        Ok(())
    }
}

async fn listen<I: FileIndexer + ?Sized>(
    events: flume::Receiver<WatchEvent>,
    requeue: flume::Sender<WatchEvent>,
    indexer: Arc<I>,
    config: WatcherConfig,
    stop: oneshot::Receiver<()>,
) {
    let indexer = &indexer;
    let requeue = &requeue;
    let config = &config;
    events
        .into_stream()
        .take_until(stop)
        .for_each_concurrent(config.concurrency.max(1), |event| async move {
            if !is_candidate_file(&event.path) {
                debug!(path = %event.path.display(), "Ignoring change");
                return;
            }
            // Deleted or renamed away before the debounce fired
            if !tokio::fs::metadata(&event.path)
                .await
                .is_ok_and(|m| m.is_file())
            {
                return;
            }

            match indexer.index_path(&event.path).await {
                FileOutcome::Locked if event.deferrals < config.max_deferrals => {
                    let deferrals = event.deferrals + 1;
                    let delay = config.deferral_delay * deferrals;
                    info!(
                        path = %event.path.display(),
                        deferrals,
                        delay_ms = delay.as_millis() as u64,
                        "File is locked, re-queued"
                    );
                    let requeue = requeue.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = requeue
                            .send_async(WatchEvent {
                                path: event.path,
                                deferrals,
                            })
                            .await;
                    });
                }
                FileOutcome::Locked => {
                    warn!(path = %event.path.display(), "File stayed locked, giving up until it changes again");
                }
                outcome => debug!(path = %event.path.display(), %outcome, "Handled change"),
            }
        })
        .await;
}
