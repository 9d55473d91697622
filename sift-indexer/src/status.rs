//! Index status: what the vector store holds and what the tracker remembers.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::retrieval::change_tracker::{ChangeTracker, FileFingerprint, FileStatus};
use crate::retrieval::writer::Collection;
use crate::storage::VectorStore;

/// Files listed under "recently indexed".
pub const RECENT_FILES: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionStatus {
    pub name: String,
    pub exists: bool,
    pub point_count: u64,
    pub vector_size: Option<usize>,
    /// Backend health, `missing`, or `unreachable`
    pub status: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub store: String,
    pub collections: Vec<CollectionStatus>,
    pub tracked_files: BTreeMap<FileStatus, usize>,
    pub total_tracked: usize,
    pub recent_files: Vec<FileFingerprint>,
}

impl StatusReport {
    pub fn total_points(&self) -> u64 {
        self.collections.iter().map(|c| c.point_count).sum()
    }
}

/// Collects the report. An unreachable collection is reported, not fatal;
/// a broken tracker is.
pub async fn status(store: &dyn VectorStore, tracker: &ChangeTracker) -> Result<StatusReport> {
    let mut collections = Vec::with_capacity(Collection::ALL.len());
    for collection in Collection::ALL {
        let name = collection.name().to_string();
        let entry = match store.collection_info(collection.name()).await {
            Ok(Some(info)) => CollectionStatus {
                name,
                exists: true,
                point_count: info.point_count,
                vector_size: Some(info.vector_size),
                status: info.status,
                error: None,
            },
            Ok(None) => CollectionStatus {
                name,
                exists: false,
                point_count: 0,
                vector_size: None,
                status: "missing".to_string(),
                error: None,
            },
            Err(err) => {
                tracing::warn!(collection = collection.name(), "Collection status unavailable: {err}");
                CollectionStatus {
                    name,
                    exists: false,
                    point_count: 0,
                    vector_size: None,
                    status: "unreachable".to_string(),
                    error: Some(err.to_string()),
                }
            }
        };
        collections.push(entry);
    }

    let tracked_files = tracker
        .counts_by_status()
        .await
        .context("Failed to count tracked files")?;
    let recent_files = tracker
        .recent(RECENT_FILES)
        .await
        .context("Failed to list recent files")?;

    Ok(StatusReport {
        store: store.store_name().to_string(),
        total_tracked: tracked_files.values().sum(),
        collections,
        tracked_files,
        recent_files,
    })
}
