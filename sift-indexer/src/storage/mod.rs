//! Vector storage abstraction for the indexer
//!
//! The pipeline writes every embedded unit as a [`VectorPoint`] into one of a
//! fixed set of named collections, and the search router reads them back. The
//! [`VectorStore`] trait is the seam between the two and the backing database.
//!
//! ## Implementations
//!
//! - [`qdrant_store::QdrantStore`]: Qdrant's REST API over `reqwest`
//! - [`memory_store::MemoryVectorStore`]: brute-force cosine search in process memory,
//!   used by tests and `kind = "memory"` runs
//!
//! ## Architecture
//!
//! ```text
//! VectorIndexWriter ──┐
//!                     ├── VectorStore ── QdrantStore | MemoryVectorStore
//! SearchRouter ───────┘
//! ```

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

pub mod memory_store;
pub mod qdrant_store;

/// Payload attached to a point: flat JSON scalars keyed by field name.
pub type Payload = Map<String, Value>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("vector store request failed: {source}")]
    Request {
        #[from]
        source: reqwest::Error,
    },

    #[error("vector store returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("collection '{name}' does not exist")]
    MissingCollection { name: String },

    #[error("collection '{name}' holds {existing}-dimensional vectors, expected {expected}")]
    DimensionMismatch {
        name: String,
        existing: usize,
        expected: usize,
    },

    #[error("malformed vector store response: {message}")]
    Malformed { message: String },
}

/// One embedded unit ready for storage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorPoint {
    pub id: Uuid,
    pub vector: Vec<f32>,
    pub payload: Payload,
}

/// A point returned by similarity search.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f32,
    pub payload: Payload,
}

/// Size and health of one collection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionInfo {
    pub name: String,
    pub point_count: u64,
    pub vector_size: usize,
    /// Backend-reported health, e.g. `green`
    pub status: String,
}

/// Exact-match conditions on payload keys.
///
/// A point matches when every `must` pair equals its payload value and no
/// `must_not` pair does.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PayloadFilter {
    pub must: Vec<(String, Value)>,
    pub must_not: Vec<(String, Value)>,
}

impl PayloadFilter {
    pub fn must(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.must.push((key.into(), value.into()));
        self
    }

    pub fn must_not(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.must_not.push((key.into(), value.into()));
        self
    }

    pub fn matches(&self, payload: &Payload) -> bool {
        self.must
            .iter()
            .all(|(key, value)| payload.get(key) == Some(value))
            && !self
                .must_not
                .iter()
                .any(|(key, value)| payload.get(key) == Some(value))
    }
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Creates the collection if missing. An existing collection with a
    /// different vector size is an error.
    async fn ensure_collection(&self, name: &str, vector_size: usize) -> Result<(), StoreError>;

    async fn upsert(&self, collection: &str, points: &[VectorPoint]) -> Result<(), StoreError>;

    /// Up to `limit` points scoring at least `score_threshold`, best first.
    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        score_threshold: f32,
    ) -> Result<Vec<ScoredPoint>, StoreError>;

    /// `None` when the collection does not exist.
    async fn collection_info(&self, collection: &str) -> Result<Option<CollectionInfo>, StoreError>;

    async fn delete_where(&self, collection: &str, filter: &PayloadFilter)
    -> Result<(), StoreError>;

    fn store_name(&self) -> &'static str;
}
