//! Column typing and row/column/summary decomposition of tables.
//!
//! Each table is indexed three ways: one unit per row, one per column and one
//! summary per table. The row view answers "find records like X", the column
//! view answers "describe column Y" and the summary answers "what is in this
//! dataset".

use crate::extract::TabularDocument;
use crate::table::Table;
use crate::unit::{Attributes, ContentCategory, ContentUnit, Scalar};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::Serialize;
use std::collections::HashMap;

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d", "%Y/%m/%d", "%d/%m/%Y", "%m/%d/%Y", "%d-%m-%Y", "%d.%m.%Y", "%b %d, %Y",
    "%B %d, %Y", "%d %b %Y", "%d %B %Y",
];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%d/%m/%Y %H:%M",
];

const BOOLEAN_TOKENS: &[&str] = &["true", "false", "1", "0", "yes", "no", "t", "f"];

/// Detected type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Int,
    Float,
    DateTime,
    Boolean,
    Categorical,
    String,
    /// Every cell is null
    Empty,
}

impl ColumnType {
    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnType::Int | ColumnType::Float)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Int => "int",
            ColumnType::Float => "float",
            ColumnType::DateTime => "datetime",
            ColumnType::Boolean => "boolean",
            ColumnType::Categorical => "categorical",
            ColumnType::String => "string",
            ColumnType::Empty => "empty",
        }
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NumericStats {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnSchema {
    pub name: String,
    pub column_type: ColumnType,
    pub null_count: usize,
    pub unique_count: usize,
    /// First few non-null values, in row order
    pub sample_values: Vec<String>,
    /// Most frequent values with counts, most frequent first
    pub top_values: Vec<(String, usize)>,
    pub stats: Option<NumericStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Schema {
    /// Sheet name, or `default` for delimited files
    pub table_name: String,
    pub row_count: usize,
    pub columns: Vec<ColumnSchema>,
}

impl Schema {
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn numeric_columns(&self) -> Vec<&str> {
        self.columns_where(|t| t.is_numeric())
    }

    pub fn categorical_columns(&self) -> Vec<&str> {
        self.columns_where(|t| matches!(t, ColumnType::Categorical | ColumnType::Boolean))
    }

    fn columns_where(&self, predicate: impl Fn(ColumnType) -> bool) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| predicate(c.column_type))
            .map(|c| c.name.as_str())
            .collect()
    }
}

/// Classifies table columns and generates row, column and summary units.
#[derive(Debug, Clone)]
pub struct SchemaAnalyzer {
    /// Absolute cap on distinct values for a categorical column
    pub max_categorical_unique: usize,
    /// Distinct values must stay below this share of the row count
    pub categorical_ratio: f64,
    /// Values kept in [`ColumnSchema::sample_values`]
    pub schema_samples: usize,
    /// Values kept in [`ColumnSchema::top_values`]
    pub tracked_top_values: usize,
    /// Sample values rendered into a column unit
    pub unit_samples: usize,
    /// Top values rendered into a column unit
    pub unit_top_values: usize,
}

impl Default for SchemaAnalyzer {
    fn default() -> Self {
        Self {
            max_categorical_unique: 50,
            categorical_ratio: 0.5,
            schema_samples: 5,
            tracked_top_values: 20,
            unit_samples: 10,
            unit_top_values: 5,
        }
    }
}

impl SchemaAnalyzer {
    pub fn analyze(&self, table: &Table) -> Schema {
        let columns = table
            .headers
            .iter()
            .enumerate()
            .map(|(index, name)| self.analyze_column(table, index, name))
            .collect();
        Schema {
            table_name: table.label().to_string(),
            row_count: table.row_count(),
            columns,
        }
    }

    fn analyze_column(&self, table: &Table, index: usize, name: &str) -> ColumnSchema {
        let values: Vec<&str> = table.column(index).flatten().collect();
        let null_count = table.row_count() - values.len();
        let frequencies = value_frequencies(&values);
        let unique_count = frequencies.len();

        let (column_type, stats) = self.detect_type(&values, unique_count, table.row_count());

        ColumnSchema {
            name: name.to_string(),
            column_type,
            null_count,
            unique_count,
            sample_values: values
                .iter()
                .take(self.schema_samples)
                .map(|v| v.to_string())
                .collect(),
            top_values: frequencies
                .into_iter()
                .take(self.tracked_top_values)
                .map(|(value, count)| (value.to_string(), count))
                .collect(),
            stats,
        }
    }

    fn detect_type(
        &self,
        values: &[&str],
        unique_count: usize,
        row_count: usize,
    ) -> (ColumnType, Option<NumericStats>) {
        if values.is_empty() {
            return (ColumnType::Empty, None);
        }

        if let Some(numbers) = parse_all_f64(values) {
            let column_type = if values.iter().all(|v| is_integer_literal(v)) {
                ColumnType::Int
            } else {
                ColumnType::Float
            };
            return (column_type, Some(numeric_stats(&numbers)));
        }

        if values.iter().all(|v| parses_as_datetime(v)) {
            return (ColumnType::DateTime, None);
        }

        if unique_count <= 2
            && values
                .iter()
                .all(|v| BOOLEAN_TOKENS.contains(&v.to_lowercase().as_str()))
        {
            return (ColumnType::Boolean, None);
        }

        let threshold =
            (self.max_categorical_unique as f64).min(self.categorical_ratio * row_count as f64);
        if (unique_count as f64) < threshold {
            (ColumnType::Categorical, None)
        } else {
            (ColumnType::String, None)
        }
    }

    /// Generates the units of one table, numbering them from `first_sequence`.
    ///
    /// Rows come first, then columns, then the summary.
    pub fn generate_units(
        &self,
        table: &Table,
        schema: &Schema,
        source_file: &str,
        first_sequence: usize,
    ) -> Vec<ContentUnit> {
        let mut units = Vec::with_capacity(table.row_count() + table.column_count() + 1);
        let mut next = first_sequence;
        let mut push = |units: &mut Vec<ContentUnit>, text, category, attributes| {
            units.push(ContentUnit::new(
                text,
                category,
                source_file,
                next,
                attributes,
            ));
            next += 1;
        };

        for (row_index, row) in table.rows.iter().enumerate() {
            if let Some((text, attributes)) = self.row_unit(table, schema, row_index, row) {
                push(&mut units, text, ContentCategory::TableRow, attributes);
            }
        }

        for column in &schema.columns {
            if column.column_type == ColumnType::Empty {
                continue;
            }
            let (text, attributes) = self.column_unit(table, column);
            push(&mut units, text, ContentCategory::TableColumn, attributes);
        }

        let (text, attributes) = self.summary_unit(table, schema);
        push(&mut units, text, ContentCategory::TableSummary, attributes);

        units
    }

    /// Analyzes and decomposes every table of a document.
    ///
    /// Workbook sheets get `path::sheet` as their source so units from different
    /// sheets stay distinguishable once merged into one collection.
    pub fn decompose(&self, document: &TabularDocument, source_file: &str) -> Vec<ContentUnit> {
        let mut units = Vec::new();
        for table in &document.tables {
            let schema = self.analyze(table);
            let source = match &table.name {
                Some(sheet) => format!("{source_file}::{sheet}"),
                None => source_file.to_string(),
            };
            let table_units = self.generate_units(table, &schema, &source, units.len());
            units.extend(table_units);
        }
        units
    }

    fn row_unit(
        &self,
        table: &Table,
        schema: &Schema,
        row_index: usize,
        row: &[Option<String>],
    ) -> Option<(String, Attributes)> {
        let mut parts = Vec::new();
        let mut attributes = Attributes::new();
        attributes.insert("row_index".into(), Scalar::from(row_index));
        attributes.insert("sheet_name".into(), Scalar::from(table.label()));

        for (column, cell) in schema.columns.iter().zip(row) {
            let Some(value) = cell else {
                continue;
            };
            parts.push(format!("{}: {}", column.name, value));

            let slug = column_slug(&column.name);
            match value.trim().parse::<f64>() {
                Ok(number) if column.column_type.is_numeric() => {
                    attributes.insert(format!("numeric_{slug}"), Scalar::Float(number));
                }
                _ => {
                    attributes.insert(format!("text_{slug}"), Scalar::Text(value.clone()));
                }
            }
        }

        if parts.is_empty() {
            return None;
        }
        Some((parts.join(" | "), attributes))
    }

    fn column_unit(&self, table: &Table, column: &ColumnSchema) -> (String, Attributes) {
        let mut parts = vec![
            format!("Column: {}", column.name),
            format!("Type: {}", column.column_type),
        ];

        let mut attributes = Attributes::new();
        attributes.insert("column_name".into(), Scalar::from(column.name.as_str()));
        attributes.insert("column_type".into(), Scalar::from(column.column_type.as_str()));
        attributes.insert("unique_count".into(), Scalar::from(column.unique_count));
        attributes.insert("null_count".into(), Scalar::from(column.null_count));
        attributes.insert("sheet_name".into(), Scalar::from(table.label()));

        if let Some(stats) = &column.stats {
            parts.push(format!(
                "Statistics: Mean={:.2}, Min={}, Max={}",
                stats.mean, stats.min, stats.max
            ));
            attributes.insert("mean".into(), Scalar::Float(stats.mean));
            attributes.insert("min".into(), Scalar::Float(stats.min));
            attributes.insert("max".into(), Scalar::Float(stats.max));
        } else if matches!(
            column.column_type,
            ColumnType::Categorical | ColumnType::Boolean
        ) {
            let top: Vec<String> = column
                .top_values
                .iter()
                .take(self.unit_top_values)
                .map(|(value, count)| format!("{value} ({count})"))
                .collect();
            parts.push(format!("Top values: {}", top.join(", ")));
        } else {
            parts.push(format!("Unique values: {}", column.unique_count));
        }

        let index = table.headers.iter().position(|h| *h == column.name);
        let samples: Vec<&str> = index
            .map(|i| table.column(i).flatten().take(self.unit_samples).collect())
            .unwrap_or_default();
        if !samples.is_empty() {
            parts.push(format!("Sample values: {}", samples.join(", ")));
        }

        (parts.join(" | "), attributes)
    }

    fn summary_unit(&self, table: &Table, schema: &Schema) -> (String, Attributes) {
        let numeric = schema.numeric_columns();
        let categorical = schema.categorical_columns();
        let list = |names: &[&str]| {
            if names.is_empty() {
                "none".to_string()
            } else {
                names.join(", ")
            }
        };

        let text = [
            format!("Data summary for {}:", table.label()),
            format!(
                "Rows: {}, Columns: {}",
                table.row_count(),
                table.column_count()
            ),
            format!("Column names: {}", table.headers.join(", ")),
            format!("Numeric columns: {}", list(&numeric)),
            format!("Categorical columns: {}", list(&categorical)),
        ]
        .join(" | ");

        let mut attributes = Attributes::new();
        attributes.insert("sheet_name".into(), Scalar::from(table.label()));
        attributes.insert("row_count".into(), Scalar::from(table.row_count()));
        attributes.insert("column_count".into(), Scalar::from(table.column_count()));
        attributes.insert("numeric_columns".into(), Scalar::Text(numeric.join(",")));
        attributes.insert(
            "categorical_columns".into(),
            Scalar::Text(categorical.join(",")),
        );
        (text, attributes)
    }
}

/// Lowercased column name with non-alphanumerics replaced by `_`.
pub fn column_slug(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Distinct values with counts, most frequent first, ties in first-seen order.
fn value_frequencies<'a>(values: &[&'a str]) -> Vec<(&'a str, usize)> {
    let mut positions: HashMap<&str, usize> = HashMap::new();
    let mut counts: Vec<(&str, usize)> = Vec::new();
    for &value in values {
        match positions.get(value) {
            Some(&position) => counts[position].1 += 1,
            None => {
                positions.insert(value, counts.len());
                counts.push((value, 1));
            }
        }
    }
    counts.sort_by(|a, b| b.1.cmp(&a.1));
    counts
}

fn parse_all_f64(values: &[&str]) -> Option<Vec<f64>> {
    values
        .iter()
        .map(|v| v.trim().parse::<f64>().ok().filter(|n| n.is_finite()))
        .collect()
}

/// Optional sign followed by digits only; magnitude is not bounded by `i64`.
fn is_integer_literal(value: &str) -> bool {
    let trimmed = value.trim();
    let digits = trimmed.strip_prefix(['+', '-']).unwrap_or(trimmed);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

fn numeric_stats(numbers: &[f64]) -> NumericStats {
    let sum: f64 = numbers.iter().sum();
    let min = numbers.iter().copied().fold(f64::INFINITY, f64::min);
    let max = numbers.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    NumericStats {
        mean: sum / numbers.len() as f64,
        min,
        max,
    }
}

fn parses_as_datetime(value: &str) -> bool {
    let value = value.trim();
    DateTime::parse_from_rfc3339(value).is_ok()
        || DATETIME_FORMATS
            .iter()
            .any(|f| NaiveDateTime::parse_from_str(value, f).is_ok())
        || DATE_FORMATS
            .iter()
            .any(|f| NaiveDate::parse_from_str(value, f).is_ok())
}
