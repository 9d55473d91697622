//! In-memory tables produced by the extractor.

use serde::Serialize;

/// Label used for tables that do not come from a named worksheet.
pub const DEFAULT_SHEET: &str = "default";

/// A rectangular table of raw string cells.
///
/// Cells are kept exactly as read (after trimming); `None` marks a null cell.
/// Type coercion is left to the schema analyzer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Table {
    /// Worksheet name, or `None` for delimited text files
    pub name: Option<String>,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl Table {
    /// Builds a table, padding or truncating every row to the header width.
    pub fn new(name: Option<String>, headers: Vec<String>, rows: Vec<Vec<Option<String>>>) -> Self {
        let width = headers.len();
        let rows = rows
            .into_iter()
            .map(|mut row| {
                row.resize(width, None);
                row
            })
            .collect();
        Self {
            name,
            headers,
            rows,
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.headers.len()
    }

    /// The sheet name, or [`DEFAULT_SHEET`]
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(DEFAULT_SHEET)
    }

    /// Iterates the cells of one column, nulls included.
    pub fn column(&self, index: usize) -> impl Iterator<Item = Option<&str>> + '_ {
        self.rows
            .iter()
            .map(move |row| row.get(index).and_then(|cell| cell.as_deref()))
    }
}

/// Normalizes a raw cell: trims it and maps null tokens to `None`.
pub fn normalize_cell(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if is_null_token(trimmed) {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn is_null_token(value: &str) -> bool {
    matches!(
        value,
        "" | "NA" | "N/A" | "NaN" | "nan" | "null" | "NULL" | "None"
    )
}

/// Makes header names non-empty and unique (`name`, `name.1`, ...).
pub fn normalize_headers<I, S>(raw: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut headers: Vec<String> = Vec::new();
    for (index, header) in raw.into_iter().enumerate() {
        let base = match header.as_ref().trim() {
            "" => format!("column_{}", index + 1),
            name => name.to_string(),
        };
        let mut candidate = base.clone();
        let mut suffix = 1;
        while headers.contains(&candidate) {
            candidate = format!("{base}.{suffix}");
            suffix += 1;
        }
        headers.push(candidate);
    }
    headers
}
