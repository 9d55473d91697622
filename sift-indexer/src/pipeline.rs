//! Wires the configured components into a ready-to-use indexing pipeline.

use anyhow::{Context, Result};
use sift_embed::EmbeddingProvider;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{SiftConfig, StoreKind, VectorStoreConfig};
use crate::fs::{Filesystem, LocalFilesystem};
use crate::retrieval::{
    batcher::EmbeddingBatcher, change_tracker::ChangeTracker, orchestrator::IndexOrchestrator,
    search::SearchRouter, writer::VectorIndexWriter,
};
use crate::status::{StatusReport, status};
use crate::storage::{VectorStore, memory_store::MemoryVectorStore, qdrant_store::QdrantStore};

/// Orchestrator and search router sharing one store, tracker and provider.
pub struct Pipeline {
    orchestrator: Arc<IndexOrchestrator>,
    router: SearchRouter,
}

impl Pipeline {
    /// Builds everything from configuration: local filesystem, the configured
    /// provider and store, and the tracker database on disk.
    pub async fn from_config(config: &SiftConfig) -> Result<Self> {
        config.check_environment()?;
        let fs: Arc<dyn Filesystem> = Arc::new(LocalFilesystem);
        let provider = sift_embed::create_provider(&config.embedding.provider)
            .await
            .context("Failed to initialise the embedding provider")?;
        let store = open_store(&config.vector_store)?;
        let tracker = open_tracker(config, fs.clone()).await?;
        Self::assemble(config, fs, provider, store, tracker).await
    }

    /// Builds the pipeline around components the caller already holds.
    pub async fn assemble(
        config: &SiftConfig,
        fs: Arc<dyn Filesystem>,
        provider: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorStore>,
        tracker: Arc<ChangeTracker>,
    ) -> Result<Self> {
        let dimension = provider.embedding_dimension();
        let writer = VectorIndexWriter::new(
            store.clone(),
            dimension,
            config.vector_store.upsert_batch_size,
        )
        .await
        .with_context(|| format!("Failed to prepare collections in {}", store.store_name()))?;
        let batcher = EmbeddingBatcher::new(provider.clone(), config.batcher_config());
        let router = SearchRouter::new(
            provider,
            config.batcher_config(),
            store,
            config.search.clone(),
        );
        let orchestrator = Arc::new(IndexOrchestrator::new(
            config.orchestrator_config(),
            fs,
            tracker,
            batcher,
            writer,
        ));
        tracing::info!(
            provider = orchestrator.batcher().provider_name(),
            dimension,
            store = orchestrator.writer().store().store_name(),
            "Pipeline ready"
        );
        Ok(Self {
            orchestrator,
            router,
        })
    }

    pub fn orchestrator(&self) -> &Arc<IndexOrchestrator> {
        &self.orchestrator
    }

    pub fn router(&self) -> &SearchRouter {
        &self.router
    }

    pub async fn status(&self) -> Result<StatusReport> {
        status(
            self.orchestrator.writer().store().as_ref(),
            self.orchestrator.tracker(),
        )
        .await
    }
}

/// Opens the configured vector store. Reads the API key variable if one is named.
pub fn open_store(config: &VectorStoreConfig) -> Result<Arc<dyn VectorStore>> {
    match config.kind {
        StoreKind::Memory => Ok(Arc::new(MemoryVectorStore::new())),
        StoreKind::Qdrant => {
            let api_key = match &config.api_key_env {
                Some(var) => Some(
                    std::env::var(var)
                        .with_context(|| format!("Environment variable {var} is not set"))?,
                ),
                None => None,
            };
            let store = QdrantStore::new(
                &config.url,
                api_key,
                Duration::from_secs(config.timeout_secs),
            )
            .context("Failed to create the Qdrant client")?;
            Ok(Arc::new(store))
        }
    }
}

pub async fn open_tracker(config: &SiftConfig, fs: Arc<dyn Filesystem>) -> Result<Arc<ChangeTracker>> {
    let tracker = ChangeTracker::open(&config.tracker.db_path, fs)
        .await
        .with_context(|| {
            format!(
                "Failed to open the tracker database at {}",
                config.tracker.db_path.display()
            )
        })?;
    Ok(Arc::new(tracker))
}
