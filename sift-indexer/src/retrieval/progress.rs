//! Progress events and cooperative cancellation for long indexing runs.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::orchestrator::FileOutcome;

/// Published once per finished file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub files_done: usize,
    pub files_total: usize,
    pub current_path: PathBuf,
    pub outcome: FileOutcome,
}

/// Shared stop signal. Files already dispatched run to completion; no new
/// files are started once it is set.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
