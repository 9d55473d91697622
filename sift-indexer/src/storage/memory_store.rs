//! In-memory vector store with brute-force cosine similarity.
//!
//! Holds everything in a map behind an async lock. Search scans every point of
//! the collection, which is fine for tests and small `kind = "memory"` runs.

use super::{CollectionInfo, PayloadFilter, ScoredPoint, StoreError, VectorPoint, VectorStore};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Default)]
struct MemoryCollection {
    vector_size: usize,
    points: BTreeMap<Uuid, VectorPoint>,
}

#[derive(Debug, Default)]
pub struct MemoryVectorStore {
    collections: RwLock<HashMap<String, MemoryCollection>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every point of `collection`, ordered by id. Empty if it does not exist.
    pub async fn points(&self, collection: &str) -> Vec<VectorPoint> {
        let collections = self.collections.read().await;
        collections
            .get(collection)
            .map(|c| c.points.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn point_count(&self, collection: &str) -> usize {
        let collections = self.collections.read().await;
        collections.get(collection).map_or(0, |c| c.points.len())
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn ensure_collection(&self, name: &str, vector_size: usize) -> Result<(), StoreError> {
        let mut collections = self.collections.write().await;
        let collection = collections
            .entry(name.to_string())
            .or_insert_with(|| MemoryCollection {
                vector_size,
                points: BTreeMap::new(),
            });
        if collection.vector_size != vector_size {
            return Err(StoreError::DimensionMismatch {
                name: name.to_string(),
                existing: collection.vector_size,
                expected: vector_size,
            });
        }
        Ok(())
    }

    async fn upsert(&self, collection: &str, points: &[VectorPoint]) -> Result<(), StoreError> {
        let mut collections = self.collections.write().await;
        let target = collections
            .get_mut(collection)
            .ok_or_else(|| StoreError::MissingCollection {
                name: collection.to_string(),
            })?;

        // Validate the whole batch first so a bad point leaves nothing behind
        if let Some(bad) = points.iter().find(|p| p.vector.len() != target.vector_size) {
            return Err(StoreError::DimensionMismatch {
                name: collection.to_string(),
                existing: target.vector_size,
                expected: bad.vector.len(),
            });
        }
        for point in points {
            target.points.insert(point.id, point.clone());
        }
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        score_threshold: f32,
    ) -> Result<Vec<ScoredPoint>, StoreError> {
        let collections = self.collections.read().await;
        let target = collections
            .get(collection)
            .ok_or_else(|| StoreError::MissingCollection {
                name: collection.to_string(),
            })?;

        let mut scored: Vec<ScoredPoint> = target
            .points
            .values()
            .map(|point| ScoredPoint {
                id: point.id.to_string(),
                score: cosine_similarity(vector, &point.vector),
                payload: point.payload.clone(),
            })
            .filter(|hit| hit.score >= score_threshold)
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(limit);
        Ok(scored)
    }

    async fn collection_info(&self, collection: &str) -> Result<Option<CollectionInfo>, StoreError> {
        let collections = self.collections.read().await;
        Ok(collections.get(collection).map(|c| CollectionInfo {
            name: collection.to_string(),
            point_count: c.points.len() as u64,
            vector_size: c.vector_size,
            status: "green".to_string(),
        }))
    }

    async fn delete_where(
        &self,
        collection: &str,
        filter: &PayloadFilter,
    ) -> Result<(), StoreError> {
        let mut collections = self.collections.write().await;
        if let Some(target) = collections.get_mut(collection) {
            target.points.retain(|_, point| !filter.matches(&point.payload));
        }
        Ok(())
    }

    fn store_name(&self) -> &'static str {
        "memory"
    }
}

/// Cosine similarity; zero when either vector has no magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn point(vector: Vec<f32>, file: &str, run: &str) -> VectorPoint {
        VectorPoint {
            id: Uuid::now_v7(),
            vector,
            payload: json!({"file_path": file, "run_id": run})
                .as_object()
                .cloned()
                .unwrap(),
        }
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn test_search_orders_and_thresholds() {
        let store = MemoryVectorStore::new();
        store.ensure_collection("documents", 2).await.unwrap();
        store
            .upsert(
                "documents",
                &[
                    point(vec![1.0, 0.0], "/a", "r"),
                    point(vec![0.8, 0.6], "/b", "r"),
                    point(vec![0.0, 1.0], "/c", "r"),
                ],
            )
            .await
            .unwrap();

        let hits = store.search("documents", &[1.0, 0.0], 10, 0.5).await.unwrap();
        let files: Vec<_> = hits.iter().map(|h| h.payload["file_path"].clone()).collect();
        assert_eq!(files, vec![json!("/a"), json!("/b")]);
        assert!(hits[0].score >= hits[1].score);

        let top = store.search("documents", &[1.0, 0.0], 1, -1.0).await.unwrap();
        assert_eq!(top.len(), 1);
    }

    #[tokio::test]
    async fn test_dimension_checks() {
        let store = MemoryVectorStore::new();
        store.ensure_collection("documents", 2).await.unwrap();
        store.ensure_collection("documents", 2).await.unwrap();
        assert!(matches!(
            store.ensure_collection("documents", 3).await,
            Err(StoreError::DimensionMismatch { existing: 2, expected: 3, .. })
        ));

        let err = store
            .upsert("documents", &[point(vec![1.0, 0.0], "/a", "r"), point(vec![1.0], "/b", "r")])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DimensionMismatch { .. }));
        assert_eq!(store.point_count("documents").await, 0);
    }

    #[tokio::test]
    async fn test_missing_collection() {
        let store = MemoryVectorStore::new();
        assert!(store.collection_info("nope").await.unwrap().is_none());
        assert!(matches!(
            store.search("nope", &[1.0], 5, 0.0).await,
            Err(StoreError::MissingCollection { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_where_keeps_current_run() {
        let store = MemoryVectorStore::new();
        store.ensure_collection("documents", 2).await.unwrap();
        store
            .upsert(
                "documents",
                &[
                    point(vec![1.0, 0.0], "/a", "old"),
                    point(vec![1.0, 0.0], "/a", "new"),
                    point(vec![1.0, 0.0], "/b", "old"),
                ],
            )
            .await
            .unwrap();

        let filter = PayloadFilter::default()
            .must("file_path", "/a")
            .must_not("run_id", "new");
        store.delete_where("documents", &filter).await.unwrap();

        let remaining = store.points("documents").await;
        assert_eq!(remaining.len(), 2);
        assert!(!remaining
            .iter()
            .any(|p| p.payload["file_path"] == "/a" && p.payload["run_id"] == "old"));
        let info = store.collection_info("documents").await.unwrap().unwrap();
        assert_eq!(info.point_count, 2);
        assert_eq!(info.vector_size, 2);
    }
}
