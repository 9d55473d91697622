//! # sift-embed
//!
//! Embedding clients for the sift indexer, behind one async trait so the
//! pipeline never cares where vectors come from.
//!
//! ## Providers
//!
//! - [`HttpEmbeddingProvider`]: OpenAI-compatible `/embeddings` or Ollama `/api/embed`
//!   endpoints over `reqwest`. One attempt per call; errors say whether they are
//!   worth retrying via [`EmbedError::is_transient`].
//! - `FastEmbedProvider` (feature `local`): in-process all-MiniLM-L6-v2 through fastembed.
//! - [`HashingEmbeddingProvider`]: deterministic feature hashing for offline runs and tests.
//!
//! ## Quick Start
//!
//! ```no_run
//! use sift_embed::{EmbedConfig, create_provider};
//!
//! # async fn example() -> sift_embed::Result<()> {
//! let config = EmbedConfig::ollama("nomic-embed-text");
//! let provider = create_provider(&config).await?;
//!
//! let texts = vec!["Hello world".to_string(), "How are you?".to_string()];
//! let result = provider.embed_texts(&texts).await?;
//! println!("{} vectors of dimension {}", result.len(), result.dimension);
//! # Ok(())
//! # }
//! ```
//!
//! The vector dimension is fixed per provider instance. HTTP providers discover it
//! with a single probe request at construction unless `dims` is configured.

pub mod config;
pub mod error;
pub mod hashing;
#[cfg(feature = "local")]
pub mod local;
pub mod provider;

// Re-export main types for easy access
pub use config::{EmbedConfig, ProviderKind};
pub use error::{EmbedError, Result};
pub use hashing::HashingEmbeddingProvider;
#[cfg(feature = "local")]
pub use local::FastEmbedProvider;
pub use provider::{EmbeddingProvider, EmbeddingResult, HttpEmbeddingProvider, create_provider};
