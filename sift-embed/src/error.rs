//! Error types for the embedding clients

/// Result type for embedding operations.
///
/// This is a convenience type alias that uses [`EmbedError`] as the error type.
pub type Result<T> = std::result::Result<T, EmbedError>;

/// Error type for all embedding operations.
///
/// Callers that retry (the indexer's batcher does) should consult
/// [`EmbedError::is_transient`]: network faults, rate limiting and server errors
/// are worth another attempt, everything else fails the same way twice.
///
/// # Error Categories
///
/// - **Configuration Errors**: missing model, URL or API key
/// - **Service Errors**: non-success HTTP status from the embedding endpoint
/// - **Response Errors**: bodies that do not match the expected shape or size
/// - **Runtime Errors**: local model loading and inference failures
#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    /// Error when provider configuration is invalid
    #[error("Invalid embedding configuration: {message}")]
    InvalidConfig { message: String },

    /// Transport-level failure (connect, timeout, body read)
    #[error("Embedding request failed: {source}")]
    Request {
        #[from]
        source: reqwest::Error,
    },

    /// The service answered with a non-success status
    #[error("Embedding service returned {status}: {body}")]
    Service { status: u16, body: String },

    /// The response body could not be interpreted
    #[error("Malformed embedding response: {message}")]
    MalformedResponse { message: String },

    /// The service returned a different number of vectors than texts sent
    #[error("Expected {expected} embeddings, got {actual}")]
    CountMismatch { expected: usize, actual: usize },

    /// A vector did not have the dimension discovered at startup
    #[error("Expected embedding dimension {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Error during local model initialization
    #[error("Model initialization failed: {source}")]
    ModelInitialization {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// IO errors when reading model files
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Async task join errors
    #[error("Async task failed: {source}")]
    AsyncTask {
        #[from]
        source: tokio::task::JoinError,
    },

    /// Generic errors from other libraries
    #[error("External error: {source}")]
    External {
        #[from]
        source: anyhow::Error,
    },
}

impl EmbedError {
    /// Create an invalid configuration error with a custom message.
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a malformed response error with a custom message.
    pub fn malformed<S: Into<String>>(message: S) -> Self {
        Self::MalformedResponse {
            message: message.into(),
        }
    }

    /// Create a model initialization error from any error type.
    pub fn model_init<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::ModelInitialization {
            source: Box::new(source),
        }
    }

    /// Whether retrying the same request may succeed.
    ///
    /// HTTP 429 and 5xx responses and transport failures are transient; other
    /// 4xx responses, malformed bodies and configuration problems are not.
    pub fn is_transient(&self) -> bool {
        match self {
            EmbedError::Request { source } => !source.is_builder(),
            EmbedError::Service { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let rate_limited = EmbedError::Service {
            status: 429,
            body: String::new(),
        };
        let unavailable = EmbedError::Service {
            status: 503,
            body: String::new(),
        };
        let bad_request = EmbedError::Service {
            status: 400,
            body: "bad input".to_string(),
        };
        assert!(rate_limited.is_transient());
        assert!(unavailable.is_transient());
        assert!(!bad_request.is_transient());
        assert!(!EmbedError::malformed("no data").is_transient());
        assert!(!EmbedError::invalid_config("no url").is_transient());
    }

    #[test]
    fn test_display() {
        let err = EmbedError::CountMismatch {
            expected: 3,
            actual: 2,
        };
        assert_eq!(err.to_string(), "Expected 3 embeddings, got 2");
    }
}
