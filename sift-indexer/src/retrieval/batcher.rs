//! Groups content units into provider calls with retry and per-batch isolation.
//!
//! Units are split into fixed-size batches in order. Up to `concurrency` batches
//! of one file are in flight at once, and results come back in input order, so
//! every unit is paired with the vector produced for its own text. A batch that
//! still fails after retries only fails its own units.

use futures::stream::{self, StreamExt};
use itertools::Itertools;
use sift_context::ContentUnit;
use sift_embed::{EmbedError, EmbeddingProvider};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct BatcherConfig {
    pub batch_size: usize,
    /// Retries after the first attempt, for transient errors only
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further retry
    pub retry_backoff: Duration,
    /// Batches of one call to [`EmbeddingBatcher::embed`] in flight at once
    pub concurrency: usize,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
            concurrency: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedUnit {
    pub unit: ContentUnit,
    pub vector: Vec<f32>,
}

#[derive(Debug, Default)]
pub struct EmbeddingOutcome {
    /// Successfully embedded units, in input order
    pub embedded: Vec<EmbeddedUnit>,
    /// Units of batches that failed after retries, in input order
    pub failed: Vec<ContentUnit>,
    pub batches: usize,
    pub failed_batches: usize,
    /// Error of the last batch that failed
    pub last_error: Option<EmbedError>,
}

impl EmbeddingOutcome {
    /// True when there was work and none of it succeeded.
    pub fn all_failed(&self) -> bool {
        self.embedded.is_empty() && !self.failed.is_empty()
    }
}

pub struct EmbeddingBatcher {
    provider: Arc<dyn EmbeddingProvider>,
    config: BatcherConfig,
}

impl EmbeddingBatcher {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, mut config: BatcherConfig) -> Self {
        config.batch_size = config.batch_size.max(1);
        config.concurrency = config.concurrency.max(1);
        Self { provider, config }
    }

    pub fn dimension(&self) -> usize {
        self.provider.embedding_dimension()
    }

    pub fn provider_name(&self) -> &str {
        self.provider.provider_name()
    }

    pub async fn embed(&self, units: Vec<ContentUnit>) -> EmbeddingOutcome {
        let batches: Vec<Vec<ContentUnit>> = units
            .into_iter()
            .chunks(self.config.batch_size)
            .into_iter()
            .map(|chunk| chunk.collect())
            .collect();

        let results: Vec<_> = stream::iter(batches)
            .map(|batch| async move {
                let texts: Vec<String> = batch.iter().map(|u| u.text.clone()).collect();
                let result = self.embed_with_retry(&texts).await;
                (batch, result)
            })
            .buffered(self.config.concurrency)
            .collect()
            .await;

        let mut outcome = EmbeddingOutcome {
            batches: results.len(),
            ..EmbeddingOutcome::default()
        };
        for (batch, result) in results {
            match result {
                Ok(vectors) => outcome.embedded.extend(
                    batch
                        .into_iter()
                        .zip(vectors)
                        .map(|(unit, vector)| EmbeddedUnit { unit, vector }),
                ),
                Err(err) => {
                    tracing::warn!(units = batch.len(), "Embedding batch failed: {err}");
                    outcome.failed_batches += 1;
                    outcome.last_error = Some(err);
                    outcome.failed.extend(batch);
                }
            }
        }
        outcome
    }

    /// Embeds a single query text with the same retry policy.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let mut vectors = self.embed_with_retry(&[text.to_string()]).await?;
        vectors.pop().ok_or(EmbedError::CountMismatch {
            expected: 1,
            actual: 0,
        })
    }

    async fn embed_with_retry(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let mut attempt = 0;
        loop {
            match self.provider.embed_texts(texts).await {
                Ok(result) if result.embeddings.len() == texts.len() => {
                    return Ok(result.embeddings);
                }
                Ok(result) => {
                    return Err(EmbedError::CountMismatch {
                        expected: texts.len(),
                        actual: result.embeddings.len(),
                    });
                }
                Err(err) if err.is_transient() && attempt < self.config.max_retries => {
                    let delay = self.backoff(attempt);
                    tracing::warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Transient embedding error, retrying: {err}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.config.retry_backoff * 2u32.pow(attempt.min(6))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sift_context::{Attributes, ContentCategory};
    use sift_embed::{EmbeddingResult, HashingEmbeddingProvider};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn units(texts: &[&str]) -> Vec<ContentUnit> {
        texts
            .iter()
            .enumerate()
            .map(|(i, text)| {
                ContentUnit::new(
                    text.to_string(),
                    ContentCategory::ProseChunk,
                    "/a.txt",
                    i,
                    Attributes::new(),
                )
            })
            .collect()
    }

    fn config(batch_size: usize) -> BatcherConfig {
        BatcherConfig {
            batch_size,
            max_retries: 3,
            retry_backoff: Duration::from_millis(1),
            concurrency: 2,
        }
    }

    /// Fails with a 503 for the first `failures` calls.
    struct FlakyProvider {
        inner: HashingEmbeddingProvider,
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for FlakyProvider {
        async fn embed_texts(&self, texts: &[String]) -> sift_embed::Result<EmbeddingResult> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(EmbedError::Service {
                    status: 503,
                    body: "busy".to_string(),
                });
            }
            self.inner.embed_texts(texts).await
        }

        fn embedding_dimension(&self) -> usize {
            self.inner.embedding_dimension()
        }

        fn provider_name(&self) -> &str {
            "flaky"
        }
    }

    /// Rejects any batch containing "poison" with a permanent 400.
    struct PoisonProvider {
        inner: HashingEmbeddingProvider,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for PoisonProvider {
        async fn embed_texts(&self, texts: &[String]) -> sift_embed::Result<EmbeddingResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if texts.iter().any(|t| t.contains("poison")) {
                return Err(EmbedError::Service {
                    status: 400,
                    body: "rejected".to_string(),
                });
            }
            self.inner.embed_texts(texts).await
        }

        fn embedding_dimension(&self) -> usize {
            self.inner.embedding_dimension()
        }

        fn provider_name(&self) -> &str {
            "poison"
        }
    }

    #[tokio::test]
    async fn test_vectors_pair_with_their_own_units() {
        let hashing = HashingEmbeddingProvider::new(32);
        let batcher = EmbeddingBatcher::new(Arc::new(hashing.clone()), config(2));
        let texts = ["alpha one", "beta two", "gamma three", "delta four", "epsilon five"];

        let outcome = batcher.embed(units(&texts)).await;
        assert_eq!(outcome.batches, 3);
        assert_eq!(outcome.failed_batches, 0);
        assert_eq!(outcome.embedded.len(), 5);
        for (embedded, text) in outcome.embedded.iter().zip(texts) {
            assert_eq!(embedded.unit.text, text);
            assert_eq!(embedded.vector, hashing.embed_sync(text));
        }
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let provider = Arc::new(FlakyProvider {
            inner: HashingEmbeddingProvider::new(8),
            failures: 2,
            calls: AtomicUsize::new(0),
        });
        let batcher = EmbeddingBatcher::new(provider.clone(), config(10));

        let outcome = batcher.embed(units(&["one", "two"])).await;
        assert_eq!(outcome.embedded.len(), 2);
        assert!(outcome.failed.is_empty());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let provider = Arc::new(FlakyProvider {
            inner: HashingEmbeddingProvider::new(8),
            failures: usize::MAX,
            calls: AtomicUsize::new(0),
        });
        let batcher = EmbeddingBatcher::new(provider.clone(), config(10));

        let outcome = batcher.embed(units(&["one", "two"])).await;
        assert!(outcome.all_failed());
        assert_eq!(outcome.failed.len(), 2);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 4);
        assert!(outcome.last_error.unwrap().to_string().contains("503"));
    }

    #[tokio::test]
    async fn test_failed_batch_is_isolated_and_not_retried() {
        let provider = Arc::new(PoisonProvider {
            inner: HashingEmbeddingProvider::new(8),
            calls: AtomicUsize::new(0),
        });
        let batcher = EmbeddingBatcher::new(provider.clone(), config(2));

        let outcome = batcher
            .embed(units(&["one", "two", "poison three", "four", "five"]))
            .await;
        assert_eq!(outcome.batches, 3);
        assert_eq!(outcome.failed_batches, 1);
        assert!(!outcome.all_failed());
        let embedded: Vec<_> = outcome.embedded.iter().map(|e| e.unit.text.as_str()).collect();
        assert_eq!(embedded, vec!["one", "two", "five"]);
        let failed: Vec<_> = outcome.failed.iter().map(|u| u.text.as_str()).collect();
        assert_eq!(failed, vec!["poison three", "four"]);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_no_units_no_calls() {
        let provider = Arc::new(PoisonProvider {
            inner: HashingEmbeddingProvider::new(8),
            calls: AtomicUsize::new(0),
        });
        let batcher = EmbeddingBatcher::new(provider.clone(), config(4));
        let outcome = batcher.embed(Vec::new()).await;
        assert_eq!(outcome.batches, 0);
        assert!(!outcome.all_failed());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_embed_query() {
        let hashing = HashingEmbeddingProvider::new(16);
        let batcher = EmbeddingBatcher::new(Arc::new(hashing.clone()), config(4));
        let vector = batcher.embed_query("total revenue").await.unwrap();
        assert_eq!(vector, hashing.embed_sync("total revenue"));
        assert_eq!(batcher.dimension(), 16);
    }
}
