//! Routes embedded units to their collection and writes them as vector points.
//!
//! Each [`ContentCategory`] has exactly one [`Collection`]; the mapping is an
//! exhaustive `match`, so a new category cannot be written anywhere until it is
//! routed. Points carry the file's base metadata, the unit's attributes, and the
//! `run_id` of the indexing run that produced them.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use itertools::Itertools;
use serde::Serialize;
use serde_json::{Value, json};
use sift_context::{Attributes, ContentCategory, ContentUnit};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use super::batcher::EmbeddedUnit;
use crate::error::IndexError;
use crate::fs::FileMetadata;
use crate::storage::{Payload, PayloadFilter, StoreError, VectorPoint, VectorStore};

/// The four named vector collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Documents,
    StructuredRows,
    StructuredColumns,
    StructuredSummaries,
}

impl Collection {
    pub const ALL: [Collection; 4] = [
        Collection::Documents,
        Collection::StructuredRows,
        Collection::StructuredColumns,
        Collection::StructuredSummaries,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Collection::Documents => "documents",
            Collection::StructuredRows => "structured_rows",
            Collection::StructuredColumns => "structured_columns",
            Collection::StructuredSummaries => "structured_summaries",
        }
    }

    pub fn for_category(category: ContentCategory) -> Self {
        match category {
            ContentCategory::ProseChunk => Collection::Documents,
            ContentCategory::TableRow => Collection::StructuredRows,
            ContentCategory::TableColumn => Collection::StructuredColumns,
            ContentCategory::TableSummary => Collection::StructuredSummaries,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// File-level fields stamped on every point of one file.
#[derive(Debug, Clone, PartialEq)]
pub struct BaseMetadata {
    pub file_path: String,
    pub file_name: String,
    pub file_extension: String,
    pub file_size: u64,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: DateTime<Utc>,
    /// Decoder details (encoding, delimiter, table count)
    pub extraction: Attributes,
}

impl BaseMetadata {
    pub fn new(path: &Path, metadata: &FileMetadata) -> Self {
        Self {
            file_path: path.to_string_lossy().into_owned(),
            file_name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            file_extension: path
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase())
                .unwrap_or_default(),
            file_size: metadata.size,
            created_at: metadata.created,
            modified_at: metadata.modified,
            extraction: Attributes::new(),
        }
    }

    pub fn with_extraction(mut self, extraction: Attributes) -> Self {
        self.extraction = extraction;
        self
    }
}

/// Result of writing one file's units.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WriteReport {
    pub succeeded: usize,
    pub failed: usize,
    pub collections_touched: BTreeSet<Collection>,
    pub last_error: Option<String>,
}

pub struct VectorIndexWriter {
    store: Arc<dyn VectorStore>,
    upsert_batch_size: usize,
}

impl VectorIndexWriter {
    /// Ensures every collection exists with `vector_size` dimensions.
    pub async fn new(
        store: Arc<dyn VectorStore>,
        vector_size: usize,
        upsert_batch_size: usize,
    ) -> Result<Self, StoreError> {
        for collection in Collection::ALL {
            store.ensure_collection(collection.name(), vector_size).await?;
        }
        tracing::debug!(store = store.store_name(), vector_size, "Vector collections ready");
        Ok(Self {
            store,
            upsert_batch_size: upsert_batch_size.max(1),
        })
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    pub async fn write(
        &self,
        units: &[EmbeddedUnit],
        base: &BaseMetadata,
        run_id: &str,
    ) -> WriteReport {
        let indexed_at = Utc::now();
        let groups = units
            .iter()
            .map(|embedded| {
                let collection = Collection::for_category(embedded.unit.category);
                let point = VectorPoint {
                    id: Uuid::now_v7(),
                    vector: embedded.vector.clone(),
                    payload: build_payload(&embedded.unit, collection, base, run_id, indexed_at),
                };
                (collection, point)
            })
            .into_group_map();

        let writes = groups
            .into_iter()
            .map(|(collection, points)| async move {
                let result = self.write_collection(collection, &points).await;
                (collection, result)
            });

        let mut report = WriteReport::default();
        for (collection, (succeeded, failure)) in join_all(writes).await {
            report.succeeded += succeeded;
            if succeeded > 0 {
                report.collections_touched.insert(collection);
            }
            if let Some((failed, err)) = failure {
                report.failed += failed;
                report.last_error = Some(err.to_string());
            }
        }
        report
    }

    /// Upserts in batches. A failed batch is retried point by point so only
    /// the points that fail on their own are lost.
    async fn write_collection(
        &self,
        collection: Collection,
        points: &[VectorPoint],
    ) -> (usize, Option<(usize, IndexError)>) {
        let mut succeeded = 0;
        let mut failed = 0;
        let mut last_error = None;

        for batch in points.chunks(self.upsert_batch_size) {
            match self.store.upsert(collection.name(), batch).await {
                Ok(()) => succeeded += batch.len(),
                Err(err) if batch.len() == 1 => {
                    failed += 1;
                    last_error = Some(err);
                }
                Err(err) => {
                    tracing::debug!(
                        collection = collection.name(),
                        points = batch.len(),
                        "Batch upsert failed, writing points individually: {err}"
                    );
                    for point in batch {
                        match self
                            .store
                            .upsert(collection.name(), std::slice::from_ref(point))
                            .await
                        {
                            Ok(()) => succeeded += 1,
                            Err(err) => {
                                failed += 1;
                                last_error = Some(err);
                            }
                        }
                    }
                }
            }
        }

        let failure = last_error.map(|source| {
            let err = IndexError::VectorWrite {
                collection: collection.name().to_string(),
                source,
            };
            tracing::warn!(failed, "{err}");
            (failed, err)
        });
        (succeeded, failure)
    }

    /// Deletes points of `file_path` left by runs other than `keep_run`.
    pub async fn remove_superseded(&self, file_path: &str, keep_run: &str) -> Result<(), StoreError> {
        let filter = PayloadFilter::default()
            .must("file_path", file_path)
            .must_not("run_id", keep_run);
        for collection in Collection::ALL {
            self.store.delete_where(collection.name(), &filter).await?;
        }
        Ok(())
    }

    /// Deletes every point of `file_path` from every collection.
    pub async fn remove_file(&self, file_path: &str) -> Result<(), StoreError> {
        let filter = PayloadFilter::default().must("file_path", file_path);
        for collection in Collection::ALL {
            self.store.delete_where(collection.name(), &filter).await?;
        }
        Ok(())
    }
}

fn build_payload(
    unit: &ContentUnit,
    collection: Collection,
    base: &BaseMetadata,
    run_id: &str,
    indexed_at: DateTime<Utc>,
) -> Payload {
    let mut payload = Payload::new();
    for (key, value) in base.extraction.iter().chain(&unit.attributes) {
        if let Ok(value) = serde_json::to_value(value) {
            payload.insert(key.clone(), value);
        }
    }

    // Base keys win over attributes of the same name
    let base_fields = json!({
        "text": unit.text,
        "category": unit.category.as_str(),
        "collection": collection.name(),
        "file_path": base.file_path,
        "file_name": base.file_name,
        "file_extension": base.file_extension,
        "file_size": base.file_size,
        "created_at": base.created_at.map(|t| t.to_rfc3339()),
        "modified_at": base.modified_at.to_rfc3339(),
        "content_hash": unit.content_hash,
        "sequence_index": unit.sequence_index,
        "source_file": unit.source_file,
        "run_id": run_id,
        "indexed_at": indexed_at.to_rfc3339(),
    });
    if let Value::Object(fields) = base_fields {
        payload.extend(fields);
    }
    payload
}
