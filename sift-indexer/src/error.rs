//! Per-file failure taxonomy for the indexing pipeline.
//!
//! None of these errors abort a batch. The orchestrator turns each one into a
//! terminal state for the file that raised it and carries on with the rest.

use sift_context::ExtractError;
use sift_embed::EmbedError;
use std::path::PathBuf;

use crate::storage::StoreError;

pub type Result<T> = std::result::Result<T, IndexError>;

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// The extension is not one the extractor understands
    #[error("unsupported file format '.{extension}'")]
    UnsupportedFormat { extension: String },

    /// Every strict decode failed and lossy decoding was not possible
    #[error("could not decode file: {message}")]
    Decode { message: String },

    /// The embedding service failed after retries
    #[error("embedding service error: {source}")]
    EmbeddingService {
        #[from]
        source: EmbedError,
    },

    /// A point could not be written to its collection
    #[error("vector write to '{collection}' failed: {source}")]
    VectorWrite {
        collection: String,
        #[source]
        source: StoreError,
    },

    /// The fingerprint store could not be read or written
    #[error("change tracker error: {source}")]
    TrackerStore {
        #[from]
        source: sqlx::Error,
    },

    /// The file could not be read or stat'ed
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl IndexError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Short machine-friendly name, used in logs and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            IndexError::UnsupportedFormat { .. } => "unsupported_format",
            IndexError::Decode { .. } => "decode",
            IndexError::EmbeddingService { .. } => "embedding_service",
            IndexError::VectorWrite { .. } => "vector_write",
            IndexError::TrackerStore { .. } => "tracker_store",
            IndexError::Io { .. } => "io",
        }
    }
}

impl From<ExtractError> for IndexError {
    fn from(err: ExtractError) -> Self {
        match err {
            ExtractError::UnsupportedFormat { extension } => {
                IndexError::UnsupportedFormat { extension }
            }
            ExtractError::Decode { message } => IndexError::Decode { message },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_errors_map_onto_index_errors() {
        let err: IndexError = ExtractError::decode("bad bytes").into();
        assert_eq!(err.kind(), "decode");
        assert_eq!(err.to_string(), "could not decode file: bad bytes");

        let err: IndexError = ExtractError::UnsupportedFormat {
            extension: "exe".to_string(),
        }
        .into();
        assert_eq!(err.kind(), "unsupported_format");
        assert_eq!(err.to_string(), "unsupported file format '.exe'");
    }

    #[test]
    fn test_io_error_names_the_path() {
        let err = IndexError::io(
            "/data/report.csv",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(err.kind(), "io");
        assert!(err.to_string().contains("/data/report.csv"));
    }
}
