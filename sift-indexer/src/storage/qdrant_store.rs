//! Qdrant backend over its REST API.
//!
//! Collections are created with cosine distance. Point ids are UUID strings and
//! every write waits for the operation to be applied (`?wait=true`), so a search
//! issued after `upsert` returns sees the new points.

use super::{
    CollectionInfo, Payload, PayloadFilter, ScoredPoint, StoreError, VectorPoint, VectorStore,
};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::time::Duration;

pub struct QdrantStore {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct Envelope<T> {
    result: T,
}

#[derive(Deserialize)]
struct CollectionDescription {
    status: String,
    #[serde(default)]
    points_count: Option<u64>,
    config: CollectionConfig,
}

#[derive(Deserialize)]
struct CollectionConfig {
    params: CollectionParams,
}

#[derive(Deserialize)]
struct CollectionParams {
    vectors: Value,
}

#[derive(Deserialize)]
struct Hit {
    id: Value,
    score: f32,
    #[serde(default)]
    payload: Option<Payload>,
}

impl QdrantStore {
    pub fn new(
        url: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        match &self.api_key {
            Some(key) => builder.header("api-key", key),
            None => builder,
        }
    }

    async fn send<T: DeserializeOwned>(builder: RequestBuilder) -> Result<T, StoreError> {
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let bytes = response.bytes().await?;
        let envelope: Envelope<T> =
            serde_json::from_slice(&bytes).map_err(|e| StoreError::Malformed {
                message: e.to_string(),
            })?;
        Ok(envelope.result)
    }
}

fn filter_json(filter: &PayloadFilter) -> Value {
    let conditions = |pairs: &[(String, Value)]| -> Vec<Value> {
        pairs
            .iter()
            .map(|(key, value)| json!({"key": key, "match": {"value": value}}))
            .collect()
    };
    json!({
        "must": conditions(&filter.must),
        "must_not": conditions(&filter.must_not),
    })
}

/// Reads the vector size from an unnamed-vector collection config.
fn vector_size(vectors: &Value) -> Result<usize, StoreError> {
    vectors
        .get("size")
        .and_then(Value::as_u64)
        .map(|size| size as usize)
        .ok_or_else(|| StoreError::Malformed {
            message: format!("collection has no single vector size: {vectors}"),
        })
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn ensure_collection(&self, name: &str, vector_size: usize) -> Result<(), StoreError> {
        if let Some(info) = self.collection_info(name).await? {
            if info.vector_size != vector_size {
                return Err(StoreError::DimensionMismatch {
                    name: name.to_string(),
                    existing: info.vector_size,
                    expected: vector_size,
                });
            }
            return Ok(());
        }

        let body = json!({"vectors": {"size": vector_size, "distance": "Cosine"}});
        let _: Value =
            Self::send(self.request(Method::PUT, &format!("/collections/{name}")).json(&body))
                .await?;
        tracing::info!(collection = name, vector_size, "Created Qdrant collection");
        Ok(())
    }

    async fn upsert(&self, collection: &str, points: &[VectorPoint]) -> Result<(), StoreError> {
        if points.is_empty() {
            return Ok(());
        }
        let body = json!({
            "points": points
                .iter()
                .map(|p| json!({"id": p.id.to_string(), "vector": p.vector, "payload": p.payload}))
                .collect::<Vec<_>>(),
        });
        let path = format!("/collections/{collection}/points?wait=true");
        let _: Value = Self::send(self.request(Method::PUT, &path).json(&body)).await?;
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
        score_threshold: f32,
    ) -> Result<Vec<ScoredPoint>, StoreError> {
        let body = json!({
            "vector": vector,
            "limit": limit,
            "score_threshold": score_threshold,
            "with_payload": true,
        });
        let path = format!("/collections/{collection}/points/search");
        let hits: Vec<Hit> = Self::send(self.request(Method::POST, &path).json(&body)).await?;
        Ok(hits
            .into_iter()
            .map(|hit| ScoredPoint {
                id: match hit.id {
                    Value::String(id) => id,
                    other => other.to_string(),
                },
                score: hit.score,
                payload: hit.payload.unwrap_or_default(),
            })
            .collect())
    }

    async fn collection_info(&self, collection: &str) -> Result<Option<CollectionInfo>, StoreError> {
        let request = self.request(Method::GET, &format!("/collections/{collection}"));
        let description: CollectionDescription = match Self::send(request).await {
            Ok(description) => description,
            Err(StoreError::Status { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        Ok(Some(CollectionInfo {
            name: collection.to_string(),
            point_count: description.points_count.unwrap_or(0),
            vector_size: vector_size(&description.config.params.vectors)?,
            status: description.status,
        }))
    }

    async fn delete_where(
        &self,
        collection: &str,
        filter: &PayloadFilter,
    ) -> Result<(), StoreError> {
        let body = json!({"filter": filter_json(filter)});
        let path = format!("/collections/{collection}/points/delete?wait=true");
        let _: Value = Self::send(self.request(Method::POST, &path).json(&body)).await?;
        Ok(())
    }

    fn store_name(&self) -> &'static str {
        "qdrant"
    }
}
