//! sift-indexer: incremental file indexing into a vector store
//!
//! Documents and spreadsheets on disk are turned into embedded, searchable
//! content units. Prose is split into overlapping chunks; tables are decomposed
//! into row, column and summary units. Each file is fingerprinted so repeated
//! runs only touch files that changed.
//!
//! ## Key Modules
//!
//! - **[`retrieval`]**: change tracking, embedding batches, vector writes, the
//!   orchestrator, the file watcher and search routing
//! - **[`storage`]**: vector store abstraction with Qdrant and in-memory backends
//! - **[`status`]**: collection and tracker statistics
//! - **[`config`]**: the `sift.toml` configuration
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sift_indexer::{config::SiftConfig, pipeline::Pipeline};
//! use sift_indexer::retrieval::{orchestrator::IndexOptions, progress::CancellationFlag};
//! use std::path::Path;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = SiftConfig::load(None)?;
//! let pipeline = Pipeline::from_config(&config).await?;
//! let result = pipeline
//!     .orchestrator()
//!     .index_directory(Path::new("./reports"), true, IndexOptions::default(), &CancellationFlag::new())
//!     .await?;
//! println!("{} files indexed", result.files_indexed);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Files → ChangeTracker → extract → Chunker / SchemaAnalyzer → EmbeddingBatcher → VectorIndexWriter
//!   ↑                                                                                  ↓
//! FileWatcher ──────────→ IndexOrchestrator                     SearchRouter ← Vector store
//! ```

pub mod config;
pub mod error;
pub mod fs;
pub mod pipeline;
pub mod retrieval;
pub mod status;
pub mod storage;

pub use error::{IndexError, Result};
