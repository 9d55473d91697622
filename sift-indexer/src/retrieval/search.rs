//! Semantic search across the vector collections.
//!
//! The query is embedded once and sent to every collection the scope selects.
//! A collection that fails to answer is logged and reported, and the others
//! still contribute. Hits are merged into one list ordered by score, ties
//! keeping collection order.

use anyhow::{Result, bail};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use sift_embed::EmbeddingProvider;
use std::sync::Arc;
use tracing::{debug, warn};

use super::batcher::{BatcherConfig, EmbeddingBatcher};
use super::writer::Collection;
use crate::config::SearchConfig;
use crate::storage::{Payload, VectorStore};

/// Which collections a query goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchScope {
    #[default]
    All,
    Documents,
    /// Rows, columns and summaries
    Structured,
    Rows,
    Columns,
    Summaries,
}

impl SearchScope {
    pub fn collections(&self) -> Vec<Collection> {
        match self {
            SearchScope::All => Collection::ALL.to_vec(),
            SearchScope::Documents => vec![Collection::Documents],
            SearchScope::Structured => vec![
                Collection::StructuredRows,
                Collection::StructuredColumns,
                Collection::StructuredSummaries,
            ],
            SearchScope::Rows => vec![Collection::StructuredRows],
            SearchScope::Columns => vec![Collection::StructuredColumns],
            SearchScope::Summaries => vec![Collection::StructuredSummaries],
        }
    }
}

impl std::fmt::Display for SearchScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SearchScope::All => write!(f, "all"),
            SearchScope::Documents => write!(f, "documents"),
            SearchScope::Structured => write!(f, "structured"),
            SearchScope::Rows => write!(f, "rows"),
            SearchScope::Columns => write!(f, "columns"),
            SearchScope::Summaries => write!(f, "summaries"),
        }
    }
}

impl std::str::FromStr for SearchScope {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "all" => Ok(SearchScope::All),
            "documents" | "docs" => Ok(SearchScope::Documents),
            "structured" => Ok(SearchScope::Structured),
            "rows" => Ok(SearchScope::Rows),
            "columns" => Ok(SearchScope::Columns),
            "summaries" => Ok(SearchScope::Summaries),
            _ => Err(format!(
                "Invalid search scope: {s}. Valid options: all, documents, structured, rows, columns, summaries"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub collection: Collection,
    pub score: f32,
    pub text: String,
    pub file_path: Option<String>,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionFailure {
    pub collection: Collection,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub hits: Vec<SearchHit>,
    /// Collections that could not be searched
    pub failures: Vec<CollectionFailure>,
}

pub struct SearchRouter {
    embedder: EmbeddingBatcher,
    store: Arc<dyn VectorStore>,
    defaults: SearchConfig,
}

impl SearchRouter {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        retry: BatcherConfig,
        store: Arc<dyn VectorStore>,
        defaults: SearchConfig,
    ) -> Self {
        Self {
            embedder: EmbeddingBatcher::new(provider, retry),
            store,
            defaults,
        }
    }

    /// Searches the collections of `scope`. `limit` applies per collection;
    /// `None` takes the configured defaults.
    pub async fn search(
        &self,
        query: &str,
        scope: SearchScope,
        limit: Option<usize>,
        score_threshold: Option<f32>,
    ) -> Result<SearchResponse> {
        let query = query.trim();
        if query.is_empty() {
            bail!("search query must not be empty");
        }
        let limit = limit.unwrap_or(self.defaults.limit_per_collection);
        let threshold = score_threshold.unwrap_or(self.defaults.score_threshold);

        let vector = self.embedder.embed_query(query).await?;
        let collections = scope.collections();
        let searches = collections.iter().map(|collection| {
            let vector = &vector;
            async move {
                let result = self
                    .store
                    .search(collection.name(), vector, limit, threshold)
                    .await;
                (*collection, result)
            }
        });

        let mut hits = Vec::new();
        let mut failures = Vec::new();
        for (collection, result) in join_all(searches).await {
            match result {
                Ok(points) => {
                    debug!(collection = collection.name(), hits = points.len(), "Searched collection");
                    hits.extend(points.into_iter().map(|point| SearchHit {
                        collection,
                        score: point.score,
                        text: point
                            .payload
                            .get("text")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        file_path: point
                            .payload
                            .get("file_path")
                            .and_then(|v| v.as_str())
                            .map(str::to_string),
                        payload: point.payload,
                    }));
                }
                Err(err) => {
                    warn!(collection = collection.name(), "Search failed, skipping collection: {err}");
                    failures.push(CollectionFailure {
                        collection,
                        error: err.to_string(),
                    });
                }
            }
        }
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));

        Ok(SearchResponse {
            query: query.to_string(),
            hits,
            failures,
        })
    }
}
