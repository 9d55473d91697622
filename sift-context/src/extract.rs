//! Decoding raw file bytes into prose text or tables.
//!
//! Extraction is a pure function over bytes: it never touches the filesystem.
//! Prose formats try a fixed, ordered list of encodings and fall back to a lossy
//! decode instead of failing. Tabular formats try every strict encoding against a
//! small set of delimiters and accept the first combination that yields more than
//! one column and at least one row.

use crate::table::{Table, normalize_cell, normalize_headers};
use crate::unit::{Attributes, Scalar};
use calamine::{Data, Reader, open_workbook_auto_from_rs};
use encoding_rs::{Encoding, UTF_8, WINDOWS_1252};
use regex::Regex;
use std::io::Cursor;
use std::sync::LazyLock;
use tracing::{debug, warn};

/// Extensions decoded as prose.
pub const PROSE_EXTENSIONS: &[&str] = &[
    "txt", "text", "md", "markdown", "rst", "log", "json", "xml", "html", "htm",
];

/// Extensions decoded as tables.
pub const TABULAR_EXTENSIONS: &[&str] = &["csv", "tsv", "xlsx", "xlsm", "xls", "ods"];

/// Delimiters tried, in order, for delimited text.
const DELIMITERS: [u8; 4] = [b',', b';', b'\t', b'|'];

static EXCESS_NEWLINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("newline pattern is valid"));
static HORIZONTAL_SPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t]+").expect("space pattern is valid"));

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("unsupported file format: .{extension}")]
    UnsupportedFormat { extension: String },

    #[error("could not decode content: {message}")]
    Decode { message: String },
}

impl ExtractError {
    pub fn decode<S: Into<String>>(message: S) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }
}

/// How a file extension is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatKind {
    Prose,
    Json,
    Delimited,
    Workbook,
}

impl FormatKind {
    /// Classifies an extension (case-insensitive, leading dot optional).
    pub fn from_extension(extension: &str) -> Option<Self> {
        let ext = normalize_extension(extension);
        match ext.as_str() {
            "json" => Some(FormatKind::Json),
            "csv" | "tsv" => Some(FormatKind::Delimited),
            "xlsx" | "xlsm" | "xls" | "ods" => Some(FormatKind::Workbook),
            other if PROSE_EXTENSIONS.contains(&other) => Some(FormatKind::Prose),
            _ => None,
        }
    }

    pub fn is_tabular(&self) -> bool {
        matches!(self, FormatKind::Delimited | FormatKind::Workbook)
    }
}

pub fn is_supported_extension(extension: &str) -> bool {
    FormatKind::from_extension(extension).is_some()
}

fn normalize_extension(extension: &str) -> String {
    extension.trim_start_matches('.').to_ascii_lowercase()
}

/// Decoded prose ready for chunking.
#[derive(Debug, Clone, PartialEq)]
pub struct ProseDocument {
    pub text: String,
    /// Name of the encoding that decoded the bytes
    pub encoding: &'static str,
    /// Set when no encoding decoded the bytes cleanly and replacement characters were used
    pub lossy_decode: bool,
}

/// One or more tables decoded from a delimited file or workbook.
#[derive(Debug, Clone, PartialEq)]
pub struct TabularDocument {
    pub tables: Vec<Table>,
    /// Encoding of delimited text; `None` for workbooks
    pub encoding: Option<&'static str>,
    /// Delimiter of delimited text; `None` for workbooks
    pub delimiter: Option<char>,
}

impl TabularDocument {
    pub fn is_workbook(&self) -> bool {
        self.delimiter.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExtractedContent {
    Prose(ProseDocument),
    Tabular(TabularDocument),
}

impl ExtractedContent {
    /// Extraction details merged into every unit's payload.
    pub fn metadata(&self) -> Attributes {
        let mut metadata = Attributes::new();
        match self {
            ExtractedContent::Prose(doc) => {
                metadata.insert("content_type".into(), Scalar::from("prose"));
                metadata.insert("encoding".into(), Scalar::from(doc.encoding));
                metadata.insert("lossy_decode".into(), Scalar::Bool(doc.lossy_decode));
            }
            ExtractedContent::Tabular(doc) => {
                metadata.insert("content_type".into(), Scalar::from("tabular"));
                metadata.insert("table_count".into(), Scalar::from(doc.tables.len()));
                if let Some(encoding) = doc.encoding {
                    metadata.insert("encoding".into(), Scalar::from(encoding));
                }
                if let Some(delimiter) = doc.delimiter {
                    metadata.insert("delimiter".into(), Scalar::Text(delimiter.to_string()));
                }
            }
        }
        metadata
    }
}

/// Decodes `bytes` according to `extension`.
pub fn extract(bytes: &[u8], extension: &str) -> Result<ExtractedContent, ExtractError> {
    let kind = FormatKind::from_extension(extension).ok_or_else(|| {
        ExtractError::UnsupportedFormat {
            extension: normalize_extension(extension),
        }
    })?;

    match kind {
        FormatKind::Prose => Ok(ExtractedContent::Prose(extract_prose(bytes))),
        FormatKind::Json => Ok(ExtractedContent::Prose(extract_json(bytes))),
        FormatKind::Delimited => {
            let prefer_tab = normalize_extension(extension) == "tsv";
            extract_delimited(bytes, prefer_tab).map(ExtractedContent::Tabular)
        }
        FormatKind::Workbook => extract_workbook(bytes).map(ExtractedContent::Tabular),
    }
}

/// Candidate decodings in priority order, strict decoders only.
fn strict_decodings(bytes: &[u8]) -> Vec<(&'static str, String)> {
    let mut attempts: Vec<(&'static Encoding, &[u8])> = Vec::new();
    if let Some((encoding, bom_len)) = Encoding::for_bom(bytes) {
        attempts.push((encoding, &bytes[bom_len..]));
    }
    attempts.push((UTF_8, bytes));
    attempts.push((WINDOWS_1252, bytes));

    let mut decoded = Vec::new();
    for (encoding, payload) in attempts {
        if decoded.iter().any(|(name, _)| *name == encoding.name()) {
            continue;
        }
        match encoding.decode_without_bom_handling_and_without_replacement(payload) {
            // Windows-1252 maps every byte, so control characters are the only failure signal
            Some(text) if encoding == WINDOWS_1252 && !is_plausible_text(&text) => {
                debug!(encoding = encoding.name(), "decoded text contains control characters")
            }
            Some(text) => decoded.push((encoding.name(), text.into_owned())),
            None => debug!(encoding = encoding.name(), "strict decode failed"),
        }
    }
    decoded
}

fn is_plausible_text(text: &str) -> bool {
    !text.chars().any(|c| {
        matches!(c, '\u{0}'..='\u{8}' | '\u{e}'..='\u{1f}' | '\u{7f}'..='\u{9f}')
    })
}

fn decode_text(bytes: &[u8]) -> (String, &'static str, bool) {
    match strict_decodings(bytes).into_iter().next() {
        Some((encoding, text)) => (text, encoding, false),
        None => {
            warn!("no encoding decoded content cleanly, using lossy UTF-8");
            (String::from_utf8_lossy(bytes).into_owned(), UTF_8.name(), true)
        }
    }
}

fn extract_prose(bytes: &[u8]) -> ProseDocument {
    let (text, encoding, lossy_decode) = decode_text(bytes);
    ProseDocument {
        text: clean_text(&text),
        encoding,
        lossy_decode,
    }
}

/// Collapses runs of blank lines and horizontal whitespace.
pub fn clean_text(text: &str) -> String {
    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    let text = EXCESS_NEWLINES.replace_all(&text, "\n\n");
    let text = HORIZONTAL_SPACE.replace_all(&text, " ");
    text.trim().to_string()
}

fn extract_json(bytes: &[u8]) -> ProseDocument {
    let (text, encoding, lossy_decode) = decode_text(bytes);
    let text = match serde_json::from_str::<serde_json::Value>(&text) {
        Ok(value) => {
            let mut flattened = String::new();
            flatten_json(&value, 0, &mut flattened);
            flattened.trim_end().to_string()
        }
        Err(e) => {
            debug!(error = %e, "invalid JSON, indexing as plain text");
            clean_text(&text)
        }
    };
    ProseDocument {
        text,
        encoding,
        lossy_decode,
    }
}

/// Renders JSON as indented `key: value` lines, `Item N:` for array elements.
fn flatten_json(value: &serde_json::Value, depth: usize, out: &mut String) {
    use serde_json::Value;

    let pad = "  ".repeat(depth);
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if is_composite(child) {
                    out.push_str(&format!("{pad}{key}:\n"));
                    flatten_json(child, depth + 1, out);
                } else {
                    out.push_str(&format!("{pad}{key}: {}\n", json_scalar(child)));
                }
            }
        }
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                if is_composite(item) {
                    out.push_str(&format!("{pad}Item {}:\n", index + 1));
                    flatten_json(item, depth + 1, out);
                } else {
                    out.push_str(&format!("{pad}- {}\n", json_scalar(item)));
                }
            }
        }
        scalar => {
            out.push_str(&format!("{pad}{}\n", json_scalar(scalar)));
        }
    }
}

fn is_composite(value: &serde_json::Value) -> bool {
    value.is_object() || value.is_array()
}

fn json_scalar(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn extract_delimited(bytes: &[u8], prefer_tab: bool) -> Result<TabularDocument, ExtractError> {
    let mut delimiters = DELIMITERS.to_vec();
    if prefer_tab {
        delimiters.sort_by_key(|d| *d != b'\t');
    }

    let decodings = strict_decodings(bytes);
    if decodings.is_empty() {
        return Err(ExtractError::decode("no encoding decoded the table"));
    }

    for (encoding, text) in &decodings {
        for delimiter in &delimiters {
            if let Some(table) = parse_delimited(text, *delimiter) {
                if table.column_count() > 1 && table.row_count() > 0 {
                    debug!(
                        encoding,
                        delimiter = %(*delimiter as char).escape_default(),
                        rows = table.row_count(),
                        columns = table.column_count(),
                        "accepted delimited table"
                    );
                    return Ok(TabularDocument {
                        tables: vec![table],
                        encoding: Some(encoding),
                        delimiter: Some(*delimiter as char),
                    });
                }
            }
        }
    }

    Err(ExtractError::decode(
        "no encoding and delimiter combination produced more than one column and at least one row",
    ))
}

fn parse_delimited(text: &str, delimiter: u8) -> Option<Table> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers = normalize_headers(reader.headers().ok()?.iter());
    let width = headers.len();

    let mut rows = Vec::new();
    for record in reader.records() {
        let Ok(record) = record else {
            continue;
        };
        // Rows wider than the header are malformed for this delimiter guess
        if record.len() > width {
            continue;
        }
        let cells: Vec<Option<String>> = record.iter().map(normalize_cell).collect();
        if cells.iter().all(Option::is_none) {
            continue;
        }
        rows.push(cells);
    }

    Some(Table::new(None, headers, rows))
}

fn extract_workbook(bytes: &[u8]) -> Result<TabularDocument, ExtractError> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))
        .map_err(|e| ExtractError::decode(format!("failed to open workbook: {e}")))?;

    let mut tables = Vec::new();
    for sheet in workbook.sheet_names() {
        let range = match workbook.worksheet_range(&sheet) {
            Ok(range) => range,
            Err(e) => {
                warn!(sheet = %sheet, error = %e, "skipping unreadable worksheet");
                continue;
            }
        };

        let mut rows = range.rows();
        let Some(header_row) = rows.next() else {
            debug!(sheet = %sheet, "skipping empty worksheet");
            continue;
        };
        let headers = normalize_headers(
            header_row
                .iter()
                .map(|cell| cell_text(cell).unwrap_or_default()),
        );

        let data: Vec<Vec<Option<String>>> = rows
            .map(|row| row.iter().map(cell_text).collect::<Vec<_>>())
            .filter(|cells| cells.iter().any(Option::is_some))
            .collect();
        if data.is_empty() {
            debug!(sheet = %sheet, "skipping worksheet without data rows");
            continue;
        }

        tables.push(Table::new(Some(sheet), headers, data));
    }

    if tables.is_empty() {
        return Err(ExtractError::decode(
            "workbook contains no worksheet with a header row and data",
        ));
    }

    Ok(TabularDocument {
        tables,
        encoding: None,
        delimiter: None,
    })
}

fn cell_text(cell: &Data) -> Option<String> {
    match cell {
        Data::Empty | Data::Error(_) => None,
        Data::DateTime(value) => value
            .as_datetime()
            .map(|dt| dt.to_string())
            .or_else(|| Some(value.as_f64().to_string())),
        other => normalize_cell(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_classification() {
        assert_eq!(FormatKind::from_extension("TXT"), Some(FormatKind::Prose));
        assert_eq!(FormatKind::from_extension(".csv"), Some(FormatKind::Delimited));
        assert_eq!(FormatKind::from_extension("xlsx"), Some(FormatKind::Workbook));
        assert_eq!(FormatKind::from_extension("json"), Some(FormatKind::Json));
        assert_eq!(FormatKind::from_extension("exe"), None);
        assert!(FormatKind::Workbook.is_tabular());
        assert!(!FormatKind::Json.is_tabular());
    }

    #[test]
    fn test_unsupported_extension() {
        let err = extract(b"MZ", "exe").unwrap_err();
        assert!(matches!(err, ExtractError::UnsupportedFormat { ref extension } if extension == "exe"));
    }

    #[test]
    fn test_utf8_with_bom() {
        let mut bytes = vec![0xEF, 0xBB, 0xBF];
        bytes.extend_from_slice("Grüße aus Köln.".as_bytes());
        let ExtractedContent::Prose(doc) = extract(&bytes, "txt").unwrap() else {
            panic!("expected prose");
        };
        assert_eq!(doc.text, "Grüße aus Köln.");
        assert_eq!(doc.encoding, "UTF-8");
        assert!(!doc.lossy_decode);
    }

    #[test]
    fn test_windows_1252_fallback() {
        // "café" in Windows-1252 is not valid UTF-8
        let bytes = b"caf\xe9 au lait";
        let ExtractedContent::Prose(doc) = extract(bytes, "txt").unwrap() else {
            panic!("expected prose");
        };
        assert_eq!(doc.text, "café au lait");
        assert_eq!(doc.encoding, "windows-1252");
        assert!(!doc.lossy_decode);
    }

    #[test]
    fn test_lossy_decode_is_flagged() {
        // 0x81 is undefined in Windows-1252 and invalid as UTF-8
        let bytes = b"bad \x81 byte";
        let ExtractedContent::Prose(doc) = extract(bytes, "log").unwrap() else {
            panic!("expected prose");
        };
        assert!(doc.lossy_decode);
        assert!(doc.text.contains('\u{FFFD}'));
    }

    #[test]
    fn test_clean_text() {
        assert_eq!(
            clean_text("a\r\n\r\n\r\n\r\nb\t\t  c  "),
            "a\n\nb c"
        );
    }

    #[test]
    fn test_json_flattening() {
        let json = br#"{"name": "report", "tags": ["a", "b"], "owner": {"id": 7}}"#;
        let ExtractedContent::Prose(doc) = extract(json, "json").unwrap() else {
            panic!("expected prose");
        };
        assert!(doc.text.contains("name: report"));
        assert!(doc.text.contains("tags:\n  - a\n  - b"));
        assert!(doc.text.contains("owner:\n  id: 7"));
    }

    #[test]
    fn test_invalid_json_is_plain_text() {
        let ExtractedContent::Prose(doc) = extract(b"not { json", "json").unwrap() else {
            panic!("expected prose");
        };
        assert_eq!(doc.text, "not { json");
    }

    #[test]
    fn test_csv_comma() {
        let csv = b"Name,Age\nAda,36\nGrace,45\nAlan,41\n";
        let ExtractedContent::Tabular(doc) = extract(csv, "csv").unwrap() else {
            panic!("expected table");
        };
        assert_eq!(doc.delimiter, Some(','));
        assert_eq!(doc.encoding, Some("UTF-8"));
        let table = &doc.tables[0];
        assert_eq!(table.headers, vec!["Name", "Age"]);
        assert_eq!(table.row_count(), 3);
        assert_eq!(table.rows[1][0].as_deref(), Some("Grace"));
    }

    #[test]
    fn test_csv_semicolon_is_detected() {
        let csv = b"city;population\nLyon;513000\nNantes;314000\n";
        let ExtractedContent::Tabular(doc) = extract(csv, "csv").unwrap() else {
            panic!("expected table");
        };
        assert_eq!(doc.delimiter, Some(';'));
        assert_eq!(doc.tables[0].headers, vec!["city", "population"]);
    }

    #[test]
    fn test_tsv_prefers_tab() {
        let tsv = b"a,b\tc\n1,2\t3\n";
        let ExtractedContent::Tabular(doc) = extract(tsv, "tsv").unwrap() else {
            panic!("expected table");
        };
        assert_eq!(doc.delimiter, Some('\t'));
        assert_eq!(doc.tables[0].headers, vec!["a,b", "c"]);
    }

    #[test]
    fn test_csv_nulls_and_malformed_rows() {
        let csv = b"a,b\n1,\n2,NA\n3,4,5\n";
        let ExtractedContent::Tabular(doc) = extract(csv, "csv").unwrap() else {
            panic!("expected table");
        };
        let table = &doc.tables[0];
        // The over-wide row is dropped
        assert_eq!(table.row_count(), 2);
        assert_eq!(table.rows[0], vec![Some("1".to_string()), None]);
        assert_eq!(table.rows[1], vec![Some("2".to_string()), None]);
    }

    #[test]
    fn test_single_column_csv_is_rejected() {
        let err = extract(b"only\n1\n2\n", "csv").unwrap_err();
        assert!(matches!(err, ExtractError::Decode { .. }));
    }

    #[test]
    fn test_corrupt_workbook_is_decode_error() {
        let err = extract(b"definitely not a zip archive", "xlsx").unwrap_err();
        assert!(matches!(err, ExtractError::Decode { .. }));
    }

    #[test]
    fn test_metadata() {
        let content = extract(b"a;b\n1;2\n", "csv").unwrap();
        let metadata = content.metadata();
        assert_eq!(metadata["content_type"], Scalar::from("tabular"));
        assert_eq!(metadata["delimiter"], Scalar::from(";"));
    }
}
