//! Embedding provider trait and the HTTP implementation

use crate::config::{EmbedConfig, ProviderKind};
use crate::error::{EmbedError, Result};
use crate::hashing::HashingEmbeddingProvider;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Result of embedding generation
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingResult {
    /// The generated embeddings, one per input text, in input order
    pub embeddings: Vec<Vec<f32>>,
    /// The dimension of each embedding vector
    pub dimension: usize,
}

impl EmbeddingResult {
    /// Create a new embedding result.
    ///
    /// The dimension is inferred from the first embedding vector, or 0 when empty.
    pub fn new(embeddings: Vec<Vec<f32>>) -> Self {
        let dimension = embeddings.first().map(|e| e.len()).unwrap_or(0);
        Self {
            embeddings,
            dimension,
        }
    }

    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }
}

/// Trait for embedding providers that can generate embeddings from text
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate embeddings for multiple texts. One vector per text, same order.
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult>;

    /// Generate the embedding for a single text
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let result = self.embed_texts(&[text.to_string()]).await?;
        result
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbedError::malformed("empty embedding response"))
    }

    /// Get the dimension of embeddings produced by this provider
    fn embedding_dimension(&self) -> usize;

    /// Get the name/identifier of this provider
    fn provider_name(&self) -> &str;
}

/// Builds the provider selected by `config`.
///
/// HTTP providers without a configured `dims` send one probe request so the
/// vector dimension is known before any collection is created.
pub async fn create_provider(config: &EmbedConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    config.validate()?;
    match config.provider {
        ProviderKind::OpenAi | ProviderKind::Ollama => {
            Ok(Arc::new(HttpEmbeddingProvider::connect(config).await?))
        }
        ProviderKind::Hashing => {
            let dims = config
                .dims
                .ok_or_else(|| EmbedError::invalid_config("hashing provider needs dims"))?;
            Ok(Arc::new(HashingEmbeddingProvider::new(dims)))
        }
        #[cfg(feature = "local")]
        ProviderKind::Local => Ok(Arc::new(
            crate::local::FastEmbedProvider::create(config.clone()).await?,
        )),
        #[cfg(not(feature = "local"))]
        ProviderKind::Local => Err(EmbedError::invalid_config(
            "the local embedding provider requires building with --features local",
        )),
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    data: Vec<OpenAiEmbedding>,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbedding {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Embedding provider backed by an HTTP embedding service.
///
/// Speaks either the OpenAI `/embeddings` wire format (also served by vLLM,
/// LM Studio and most gateways) or Ollama's `/api/embed`. Each call is a single
/// attempt; retry policy belongs to the caller.
#[derive(Debug, Clone)]
pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    kind: ProviderKind,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    dimension: usize,
    name: String,
}

impl HttpEmbeddingProvider {
    /// Creates a provider without contacting the service.
    ///
    /// The dimension is taken from `config.dims` (0 when unset).
    pub fn new(config: &EmbedConfig) -> Result<Self> {
        if !config.provider.is_http() {
            return Err(EmbedError::invalid_config(format!(
                "provider {} is not an HTTP provider",
                config.provider.as_str()
            )));
        }
        let endpoint = match config.provider {
            ProviderKind::Ollama => format!("{}/api/embed", config.base_url()),
            _ => format!("{}/embeddings", config.base_url()),
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            kind: config.provider,
            endpoint,
            model: config.model.clone(),
            api_key: config.api_key()?,
            dimension: config.dims.unwrap_or(0),
            name: format!("{}:{}", config.provider.as_str(), config.model),
        })
    }

    /// Creates a provider and discovers the dimension if it is not configured.
    pub async fn connect(config: &EmbedConfig) -> Result<Self> {
        let mut provider = Self::new(config)?;
        if provider.dimension == 0 {
            let probe = provider.request(&["dimension probe".to_string()]).await?;
            let dimension = probe.first().map(Vec::len).unwrap_or(0);
            if dimension == 0 {
                return Err(EmbedError::malformed("probe returned an empty vector"));
            }
            provider.dimension = dimension;
        }
        tracing::info!(
            provider = %provider.name,
            dimension = provider.dimension,
            "Embedding provider ready"
        );
        Ok(provider)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbedError::Service {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await?;
        match self.kind {
            ProviderKind::Ollama => {
                let parsed: OllamaResponse = serde_json::from_slice(&bytes)
                    .map_err(|e| EmbedError::malformed(e.to_string()))?;
                Ok(parsed.embeddings)
            }
            _ => {
                let mut parsed: OpenAiResponse = serde_json::from_slice(&bytes)
                    .map_err(|e| EmbedError::malformed(e.to_string()))?;
                if parsed.data.iter().all(|item| item.index.is_some()) {
                    parsed.data.sort_by_key(|item| item.index);
                }
                Ok(parsed.data.into_iter().map(|item| item.embedding).collect())
            }
        }
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        if texts.is_empty() {
            return Ok(EmbeddingResult::new(Vec::new()));
        }

        let embeddings = self.request(texts).await?;
        if embeddings.len() != texts.len() {
            return Err(EmbedError::CountMismatch {
                expected: texts.len(),
                actual: embeddings.len(),
            });
        }
        if let Some(bad) = embeddings.iter().find(|e| e.len() != self.dimension) {
            return Err(EmbedError::DimensionMismatch {
                expected: self.dimension,
                actual: bad.len(),
            });
        }

        tracing::debug!(count = texts.len(), provider = %self.name, "Embedded batch");
        Ok(EmbeddingResult::new(embeddings))
    }

    fn embedding_dimension(&self) -> usize {
        self.dimension
    }

    fn provider_name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves `responses` in order, one per connection, and returns the base URL.
    async fn serve(responses: Vec<(u16, String)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut request = Vec::new();
                let mut buf = [0u8; 4096];
                // Read headers, then the announced body
                loop {
                    let n = socket.read(&mut buf).await.unwrap();
                    request.extend_from_slice(&buf[..n]);
                    let text = String::from_utf8_lossy(&request);
                    if let Some(header_end) = text.find("\r\n\r\n") {
                        let length = text[..header_end]
                            .lines()
                            .find_map(|line| {
                                line.to_ascii_lowercase()
                                    .strip_prefix("content-length:")
                                    .map(|v| v.trim().parse::<usize>().unwrap())
                            })
                            .unwrap_or(0);
                        if request.len() >= header_end + 4 + length {
                            break;
                        }
                    }
                    if n == 0 {
                        break;
                    }
                }
                let response = format!(
                    "HTTP/1.1 {status} Status\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.unwrap();
            }
        });
        format!("http://{addr}")
    }

    fn openai_config(url: String) -> EmbedConfig {
        EmbedConfig::default().with_url(url).with_api_key_env(None)
    }

    #[tokio::test]
    async fn test_openai_probe_and_embed() {
        let url = serve(vec![
            (200, r#"{"data":[{"index":0,"embedding":[0.1,0.2,0.3]}]}"#.to_string()),
            (
                200,
                r#"{"data":[{"index":1,"embedding":[4,5,6]},{"index":0,"embedding":[1,2,3]}]}"#
                    .to_string(),
            ),
        ])
        .await;

        let provider = HttpEmbeddingProvider::connect(&openai_config(url)).await.unwrap();
        assert_eq!(provider.embedding_dimension(), 3);

        let result = provider
            .embed_texts(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(result.embeddings, vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]);
    }

    #[tokio::test]
    async fn test_ollama_response_shape() {
        let url = serve(vec![(200, r#"{"embeddings":[[1,0],[0,1]]}"#.to_string())]).await;
        let config = EmbedConfig::ollama("nomic-embed-text").with_url(url).with_dims(2);
        let provider = HttpEmbeddingProvider::new(&config).unwrap();
        assert!(provider.endpoint().ends_with("/api/embed"));

        let result = provider
            .embed_texts(&["x".to_string(), "y".to_string()])
            .await
            .unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result.dimension, 2);
    }

    #[tokio::test]
    async fn test_status_errors_are_classified() {
        let url = serve(vec![
            (503, "overloaded".to_string()),
            (400, "bad input".to_string()),
        ])
        .await;
        let provider = HttpEmbeddingProvider::new(&openai_config(url).with_dims(3)).unwrap();

        let err = provider.embed_texts(&["a".to_string()]).await.unwrap_err();
        assert!(matches!(err, EmbedError::Service { status: 503, .. }));
        assert!(err.is_transient());

        let err = provider.embed_texts(&["a".to_string()]).await.unwrap_err();
        assert!(matches!(err, EmbedError::Service { status: 400, .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_count_and_dimension_checks() {
        let url = serve(vec![
            (200, r#"{"data":[{"embedding":[1,2,3]}]}"#.to_string()),
            (200, r#"{"data":[{"embedding":[1,2]}]}"#.to_string()),
        ])
        .await;
        let provider = HttpEmbeddingProvider::new(&openai_config(url).with_dims(3)).unwrap();

        let err = provider
            .embed_texts(&["a".to_string(), "b".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, EmbedError::CountMismatch { expected: 2, actual: 1 }));

        let err = provider.embed_texts(&["a".to_string()]).await.unwrap_err();
        assert!(matches!(err, EmbedError::DimensionMismatch { expected: 3, actual: 2 }));
    }

    #[tokio::test]
    async fn test_empty_input_skips_the_network() {
        let provider =
            HttpEmbeddingProvider::new(&openai_config("http://127.0.0.1:9".into()).with_dims(3))
                .unwrap();
        let result = provider.embed_texts(&[]).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        // Port 9 (discard) is essentially never listening on loopback
        let provider =
            HttpEmbeddingProvider::new(&openai_config("http://127.0.0.1:9".into()).with_dims(3))
                .unwrap();
        let err = provider.embed_texts(&["a".to_string()]).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_create_provider_selects_hashing() {
        let provider = create_provider(&EmbedConfig::hashing(32)).await.unwrap();
        assert_eq!(provider.embedding_dimension(), 32);
        assert_eq!(provider.provider_name(), "hashing");
    }
}
