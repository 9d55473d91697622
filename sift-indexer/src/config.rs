//! TOML configuration for the `sift` binary and the pipeline it builds.
//!
//! Every section and key has a default, so an empty file, or no file at all,
//! gives a working setup against a local Qdrant and the OpenAI embeddings API.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use sift_context::ChunkingConfig;
use sift_embed::EmbedConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retrieval::{
    batcher::BatcherConfig, orchestrator::OrchestratorConfig, watcher::WatcherConfig,
};

/// File name looked up in the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "sift.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SiftConfig {
    pub tracker: TrackerConfig,
    pub chunking: ChunkingConfig,
    pub embedding: EmbeddingSection,
    pub vector_store: VectorStoreConfig,
    pub indexing: IndexingConfig,
    pub search: SearchConfig,
    pub watch: WatchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub db_path: PathBuf,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(".sift/tracker.db"),
        }
    }
}

/// `[embedding]`: the provider settings plus how the batcher drives it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSection {
    #[serde(flatten)]
    pub provider: EmbedConfig,
    pub batch_size: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    /// Batches of one file that may be in flight at once
    pub per_file_concurrency: usize,
}

impl Default for EmbeddingSection {
    fn default() -> Self {
        Self {
            provider: EmbedConfig::default(),
            batch_size: 64,
            max_retries: 3,
            retry_backoff_ms: 500,
            per_file_concurrency: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Qdrant,
    /// Process-local store; contents are lost on exit
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorStoreConfig {
    pub kind: StoreKind,
    pub url: String,
    pub api_key_env: Option<String>,
    pub upsert_batch_size: usize,
    pub timeout_secs: u64,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::Qdrant,
            url: "http://localhost:6333".to_string(),
            api_key_env: None,
            upsert_batch_size: 64,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
    pub workers: usize,
    pub max_file_bytes: u64,
    pub lock_retry_attempts: u32,
    pub lock_retry_backoff_ms: u64,
    pub follow_gitignore: bool,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_file_bytes: 100 * 1024 * 1024,
            lock_retry_attempts: 5,
            lock_retry_backoff_ms: 500,
            follow_gitignore: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub score_threshold: f32,
    pub limit_per_collection: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            score_threshold: 0.6,
            limit_per_collection: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub directories: Vec<PathBuf>,
    pub debounce_ms: u64,
    pub recursive: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            directories: Vec::new(),
            debounce_ms: 2000,
            recursive: true,
        }
    }
}

impl SiftConfig {
    /// Loads `path`, or `sift.toml` in the working directory if it exists,
    /// or the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => Some(path.to_path_buf()),
            None => Some(PathBuf::from(DEFAULT_CONFIG_FILE)).filter(|p| p.is_file()),
        };
        let Some(path) = path else {
            tracing::debug!("No config file found, using defaults");
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        };

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        if let Some(base) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            config.resolve_paths(base);
        }
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Parses and validates a TOML document. Relative paths are left as-is.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: SiftConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        resolve(&mut self.tracker.db_path);
        self.watch.directories.iter_mut().for_each(resolve);
        if let Some(cache_dir) = self.embedding.provider.cache_dir.as_mut() {
            resolve(cache_dir);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Err(message) = self.chunking.validate() {
            bail!("chunking: {message}");
        }
        self.embedding
            .provider
            .validate()
            .context("Invalid [embedding] section")?;
        if self.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be > 0");
        }
        if self.embedding.per_file_concurrency == 0 {
            bail!("embedding.per_file_concurrency must be > 0");
        }
        if let Some(url) = &self.embedding.provider.url {
            if !is_http_url(url) {
                bail!("embedding.url must be an http(s) URL, got '{url}'");
            }
        }
        if self.vector_store.kind == StoreKind::Qdrant && !is_http_url(&self.vector_store.url) {
            bail!(
                "vector_store.url must be an http(s) URL, got '{}'",
                self.vector_store.url
            );
        }
        if self.vector_store.upsert_batch_size == 0 {
            bail!("vector_store.upsert_batch_size must be > 0");
        }
        if self.indexing.workers == 0 {
            bail!("indexing.workers must be > 0");
        }
        if !(-1.0..=1.0).contains(&self.search.score_threshold) {
            bail!("search.score_threshold must be in [-1.0, 1.0]");
        }
        if self.search.limit_per_collection == 0 {
            bail!("search.limit_per_collection must be >= 1");
        }
        Ok(())
    }

    /// Checks that every API key variable the config names is set.
    ///
    /// Kept apart from [`validate`](Self::validate) so commands that never
    /// talk to a remote service (`status`, `list`) work without credentials.
    pub fn check_environment(&self) -> Result<()> {
        if self.embedding.provider.provider.is_http() {
            self.embedding.provider.api_key()?;
        }
        if let Some(var) = &self.vector_store.api_key_env {
            if std::env::var(var).is_err() {
                bail!("vector_store.api_key_env names {var}, which is not set");
            }
        }
        Ok(())
    }

    pub fn batcher_config(&self) -> BatcherConfig {
        BatcherConfig {
            batch_size: self.embedding.batch_size,
            max_retries: self.embedding.max_retries,
            retry_backoff: Duration::from_millis(self.embedding.retry_backoff_ms),
            concurrency: self.embedding.per_file_concurrency,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig::default()
            .with_workers(self.indexing.workers)
            .with_max_file_bytes(self.indexing.max_file_bytes)
            .with_lock_retry(
                self.indexing.lock_retry_attempts,
                Duration::from_millis(self.indexing.lock_retry_backoff_ms),
            )
            .with_follow_gitignore(self.indexing.follow_gitignore)
            .with_chunking(self.chunking.clone())
    }

    pub fn watcher_config(&self) -> WatcherConfig {
        WatcherConfig {
            debounce: Duration::from_millis(self.watch.debounce_ms),
            recursive: self.watch.recursive,
            concurrency: self.indexing.workers,
            ..WatcherConfig::default()
        }
    }
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}
