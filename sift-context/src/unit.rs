//! The content-unit model shared by the chunker and the schema analyzer.
//!
//! A [`ContentUnit`] is the atomic thing that gets embedded and stored. Units are
//! built once per indexing pass and never mutated afterwards; re-indexing a file
//! produces fresh units with the same `sequence_index` values.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// The semantic shape of a content unit.
///
/// Each category is routed to its own vector collection, so adding a variant
/// here forces every routing `match` in the indexer to be revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentCategory {
    /// A window of prose sentences (or words, in fallback mode)
    ProseChunk,
    /// One row of a table rendered as `column: value` pairs
    TableRow,
    /// Descriptive statistics and samples for one table column
    TableColumn,
    /// One overview per table or worksheet
    TableSummary,
}

impl ContentCategory {
    pub const ALL: [ContentCategory; 4] = [
        ContentCategory::ProseChunk,
        ContentCategory::TableRow,
        ContentCategory::TableColumn,
        ContentCategory::TableSummary,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentCategory::ProseChunk => "prose_chunk",
            ContentCategory::TableRow => "table_row",
            ContentCategory::TableColumn => "table_column",
            ContentCategory::TableSummary => "table_summary",
        }
    }

    /// True for the three structured views produced from tables
    pub fn is_tabular(&self) -> bool {
        !matches!(self, ContentCategory::ProseChunk)
    }
}

impl std::fmt::Display for ContentCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ContentCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "prose_chunk" | "prose" | "chunk" => Ok(ContentCategory::ProseChunk),
            "table_row" | "row" => Ok(ContentCategory::TableRow),
            "table_column" | "column" => Ok(ContentCategory::TableColumn),
            "table_summary" | "summary" => Ok(ContentCategory::TableSummary),
            _ => Err(format!(
                "Invalid content category: '{s}'. Valid values are: prose_chunk, table_row, table_column, table_summary"
            )),
        }
    }
}

/// A scalar attribute value attached to a unit.
///
/// Serialized untagged so payloads carry plain JSON numbers, strings and booleans,
/// which keeps numeric row attributes filterable in the vector database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Int(v) => Some(*v as f64),
            Scalar::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar::Bool(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Int(value)
    }
}

impl From<usize> for Scalar {
    fn from(value: usize) -> Self {
        Scalar::Int(value as i64)
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Scalar::Float(value)
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::Text(value)
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Text(value.to_string())
    }
}

/// Category-specific metadata. Ordered so serialized payloads are deterministic.
pub type Attributes = BTreeMap<String, Scalar>;

/// One embeddable span of text plus its category and metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContentUnit {
    /// The text that is embedded. Never empty.
    pub text: String,
    pub category: ContentCategory,
    /// Source file path; for workbooks this is `path::sheet`.
    pub source_file: String,
    /// Position among the units emitted for the source, 0-based.
    pub sequence_index: usize,
    pub attributes: Attributes,
    /// SHA-256 of `text`, lowercase hex.
    pub content_hash: String,
}

impl ContentUnit {
    pub fn new(
        text: String,
        category: ContentCategory,
        source_file: impl Into<String>,
        sequence_index: usize,
        attributes: Attributes,
    ) -> Self {
        debug_assert!(!text.trim().is_empty(), "content units must carry text");
        let content_hash = content_hash(&text);
        Self {
            text,
            category,
            source_file: source_file.into(),
            sequence_index,
            attributes,
            content_hash,
        }
    }

    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }
}

/// SHA-256 over the exact bytes of `text`, as lowercase hex.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
