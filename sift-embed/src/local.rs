//! Local ONNX embeddings through fastembed.
//!
//! Uses the built-in all-MiniLM-L6-v2 sentence-transformer (384 dimensions).
//! The model is downloaded to `cache_dir` on first use; after that inference runs
//! entirely offline on a blocking thread.

use crate::config::EmbedConfig;
use crate::error::{EmbedError, Result};
use crate::provider::{EmbeddingProvider, EmbeddingResult};
use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use std::sync::{Arc, Mutex};

/// FastEmbed-based embedding provider. Each instance owns its model handle.
#[derive(Clone)]
pub struct FastEmbedProvider {
    config: EmbedConfig,
    model: Arc<Mutex<TextEmbedding>>,
    dimension: usize,
}

impl std::fmt::Debug for FastEmbedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastEmbedProvider")
            .field("model", &self.config.model)
            .field("dimension", &self.dimension)
            .finish()
    }
}

impl FastEmbedProvider {
    /// Loads the model (downloading it if needed) and measures its dimension.
    pub async fn create(config: EmbedConfig) -> Result<Self> {
        tracing::info!("Loading local embedding model: all-MiniLM-L6-v2");

        let cache_dir = config.cache_dir.clone();
        let (model, dimension) =
            tokio::task::spawn_blocking(move || -> Result<(TextEmbedding, usize)> {
                let mut options = InitOptions::new(EmbeddingModel::AllMiniLML6V2)
                    .with_show_download_progress(false);
                if let Some(dir) = cache_dir {
                    options = options.with_cache_dir(dir);
                }

                let mut model =
                    TextEmbedding::try_new(options).map_err(|e| EmbedError::External { source: e })?;
                let probe = model
                    .embed(vec!["dimension probe".to_string()], None)
                    .map_err(|e| EmbedError::External { source: e })?;
                let dimension = probe.first().map(Vec::len).unwrap_or(0);
                if dimension == 0 {
                    return Err(EmbedError::malformed("local model produced an empty vector"));
                }
                Ok((model, dimension))
            })
            .await??;

        if let Some(expected) = config.dims {
            if expected != dimension {
                return Err(EmbedError::DimensionMismatch {
                    expected,
                    actual: dimension,
                });
            }
        }

        tracing::info!("Local model loaded. Dimension: {}", dimension);
        Ok(Self {
            config,
            model: Arc::new(Mutex::new(model)),
            dimension,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for FastEmbedProvider {
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        if texts.is_empty() {
            return Ok(EmbeddingResult::new(Vec::new()));
        }

        let model = Arc::clone(&self.model);
        let texts = texts.to_vec();
        let embeddings = tokio::task::spawn_blocking(move || -> Result<Vec<Vec<f32>>> {
            let mut guard = model
                .lock()
                .map_err(|_| EmbedError::invalid_config("local model lock poisoned"))?;
            guard
                .embed(texts, None)
                .map_err(|e| EmbedError::External { source: e })
        })
        .await??;

        Ok(EmbeddingResult::new(embeddings))
    }

    fn embedding_dimension(&self) -> usize {
        self.dimension
    }

    fn provider_name(&self) -> &str {
        "local:all-MiniLM-L6-v2"
    }
}
