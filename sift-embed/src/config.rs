//! Configuration for embedding providers

use crate::error::{EmbedError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Which backend produces the vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Any OpenAI-compatible `/embeddings` endpoint
    #[default]
    #[serde(alias = "openai-compatible")]
    OpenAi,
    /// Ollama's `/api/embed` endpoint
    Ollama,
    /// In-process ONNX model through fastembed (requires the `local` feature)
    Local,
    /// Deterministic feature hashing, for offline runs and tests
    Hashing,
}

impl ProviderKind {
    pub fn is_http(&self) -> bool {
        matches!(self, ProviderKind::OpenAi | ProviderKind::Ollama)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Ollama => "ollama",
            ProviderKind::Local => "local",
            ProviderKind::Hashing => "hashing",
        }
    }
}

/// Embedding provider configuration.
///
/// Deserializes from the `[embedding]` table of the indexer's TOML config.
/// Every field has a default, so an empty table selects the OpenAI endpoint
/// with `text-embedding-3-small` and probes the vector dimension at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedConfig {
    pub provider: ProviderKind,
    /// Base URL; defaults depend on the provider
    pub url: Option<String>,
    pub model: String,
    /// Vector dimension. When unset it is discovered with one probe request.
    pub dims: Option<usize>,
    /// Environment variable holding the API key, if the endpoint needs one
    pub api_key_env: Option<String>,
    pub timeout_secs: u64,
    /// Where local models are cached
    pub cache_dir: Option<PathBuf>,
}

impl Default for EmbedConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::OpenAi,
            url: None,
            model: "text-embedding-3-small".to_string(),
            dims: None,
            api_key_env: Some("OPENAI_API_KEY".to_string()),
            timeout_secs: 30,
            cache_dir: None,
        }
    }
}

impl EmbedConfig {
    /// Configuration for a local Ollama server.
    pub fn ollama(model: impl Into<String>) -> Self {
        Self {
            provider: ProviderKind::Ollama,
            model: model.into(),
            api_key_env: None,
            ..Self::default()
        }
    }

    /// Configuration for the deterministic hashing provider.
    pub fn hashing(dims: usize) -> Self {
        Self {
            provider: ProviderKind::Hashing,
            model: "feature-hashing".to_string(),
            dims: Some(dims),
            api_key_env: None,
            ..Self::default()
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_dims(mut self, dims: usize) -> Self {
        self.dims = Some(dims);
        self
    }

    pub fn with_api_key_env(mut self, var: Option<String>) -> Self {
        self.api_key_env = var;
        self
    }

    /// The base URL, falling back to the provider default.
    pub fn base_url(&self) -> &str {
        match (&self.url, self.provider) {
            (Some(url), _) => url.trim_end_matches('/'),
            (None, ProviderKind::Ollama) => "http://localhost:11434",
            (None, _) => "https://api.openai.com/v1",
        }
    }

    /// Reads the API key from the configured environment variable.
    pub fn api_key(&self) -> Result<Option<String>> {
        match &self.api_key_env {
            None => Ok(None),
            Some(var) => std::env::var(var).map(Some).map_err(|_| {
                EmbedError::invalid_config(format!("environment variable {var} is not set"))
            }),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(EmbedError::invalid_config("embedding.model must not be empty"));
        }
        if self.dims == Some(0) {
            return Err(EmbedError::invalid_config("embedding.dims must be greater than zero"));
        }
        if self.provider == ProviderKind::Hashing && self.dims.is_none() {
            return Err(EmbedError::invalid_config(
                "embedding.dims is required for the hashing provider",
            ));
        }
        if self.timeout_secs == 0 {
            return Err(EmbedError::invalid_config(
                "embedding.timeout_secs must be greater than zero",
            ));
        }
        Ok(())
    }
}
