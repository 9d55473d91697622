pub mod extract;
pub mod schema;
pub mod table;
pub mod text;
pub mod unit;

// Re-export the main shaping types for external use
pub use extract::{
    ExtractError, ExtractedContent, FormatKind, ProseDocument, TabularDocument, extract,
    is_supported_extension,
};
pub use schema::{ColumnSchema, ColumnType, Schema, SchemaAnalyzer};
pub use table::Table;
pub use text::{Chunker, ChunkingConfig};
pub use unit::{Attributes, ContentCategory, ContentUnit, Scalar, content_hash};
