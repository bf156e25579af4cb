//! Source Loader - raw tabular file to `Table`
//!
//! Responsibilities:
//! - Detect the field delimiter from the header line (`|`, then `;`, then `,`)
//! - Decode the legacy single-byte encoding (Latin-1 / Windows-1252)
//! - Keep only the requested columns that actually exist
//! - Apply the level filter after projection
//! - Record provenance (content hash, delimiter, row counts)
//!
//! Spreadsheets (`.xls`, `.xlsx`, `.ods`) go through calamine instead of the
//! delimited-text path; projection and filtering are identical.
//!
//! This module is DETERMINISTIC: same file + same LoadSpec = same table.

use std::fs;
use std::path::Path;

use calamine::{open_workbook_auto, Data, Reader};
use encoding_rs::{Encoding, WINDOWS_1252};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::catalog::SourceKind;
use crate::error::SourceError;
use crate::table::{Table, Value};

/// Delimiters tried on the header line, in priority order.
const DELIMITER_CANDIDATES: &[u8] = b"|;";
const DEFAULT_DELIMITER: u8 = b',';

/// First and last education-stage codes of secondary education.
pub const SECONDARY_STAGE_FIRST: i64 = 25;
pub const SECONDARY_STAGE_LAST: i64 = 37;

/// Row filter applied after projection.
#[derive(Debug, Clone, PartialEq)]
pub enum RowFilter {
    All,
    /// Keep rows whose integer code in `field` lies in `min..=max`.
    CodeRange {
        field: &'static str,
        min: i64,
        max: i64,
    },
}

impl RowFilter {
    /// Secondary-education enrollments only.
    pub fn secondary_education() -> Self {
        RowFilter::CodeRange {
            field: "TP_ETAPA_ENSINO",
            min: SECONDARY_STAGE_FIRST,
            max: SECONDARY_STAGE_LAST,
        }
    }
}

/// What to keep from a source.
#[derive(Debug, Clone)]
pub struct LoadSpec<'a> {
    /// `None` keeps every column.
    pub relevant: Option<&'a [&'a str]>,
    pub filter: RowFilter,
}

impl<'a> LoadSpec<'a> {
    pub fn all() -> Self {
        Self {
            relevant: None,
            filter: RowFilter::All,
        }
    }

    pub fn columns(relevant: &'a [&'a str]) -> Self {
        Self {
            relevant: Some(relevant),
            filter: RowFilter::All,
        }
    }

    pub fn with_filter(mut self, filter: RowFilter) -> Self {
        self.filter = filter;
        self
    }
}

/// Where a table came from and what the loader did to it.
#[derive(Debug, Clone, Serialize)]
pub struct Provenance {
    pub source: String,
    pub year: i32,
    pub path: String,
    pub content_hash: String,
    pub format: &'static str,
    pub delimiter: Option<char>,
    pub encoding: Option<&'static str>,
    pub rows_read: usize,
    pub rows_kept: usize,
    /// Requested columns the file does not have.
    pub columns_absent: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct LoadedSource {
    pub table: Table,
    pub provenance: Provenance,
}

/// Pick the delimiter by inspecting the header line.
pub fn detect_delimiter(first_line: &str) -> u8 {
    DELIMITER_CANDIDATES
        .iter()
        .copied()
        .find(|d| first_line.as_bytes().contains(d))
        .unwrap_or(DEFAULT_DELIMITER)
}

/// Decode raw bytes. A byte-order mark selects its Unicode encoding,
/// everything else is read as Windows-1252 (the superset of Latin-1 used by
/// the census files). Returns the text and the encoding name.
pub fn decode(bytes: &[u8]) -> Option<(String, &'static str)> {
    let (encoding, bom_len): (&'static Encoding, usize) =
        Encoding::for_bom(bytes).unwrap_or((WINDOWS_1252, 0));
    encoding
        .decode_without_bom_handling_and_without_replacement(&bytes[bom_len..])
        .map(|text| (text.into_owned(), encoding.name()))
}

fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{:x}", hasher.finalize())
}

fn is_spreadsheet(path: &Path) -> bool {
    matches!(
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .as_deref(),
        Some("xls" | "xlsx" | "xlsm" | "xlsb" | "ods")
    )
}

/// Column indices of `header` to keep, plus requested names that are absent.
fn projection(header: &[String], spec: &LoadSpec<'_>) -> (Vec<usize>, Vec<String>) {
    match spec.relevant {
        None => ((0..header.len()).collect(), Vec::new()),
        Some(wanted) => {
            let keep = header
                .iter()
                .enumerate()
                .filter(|(_, h)| wanted.contains(&h.as_str()))
                .map(|(i, _)| i)
                .collect();
            let absent = wanted
                .iter()
                .filter(|w| !header.iter().any(|h| h == *w))
                .map(|w| w.to_string())
                .collect();
            (keep, absent)
        }
    }
}

/// Compiled filter: the projected column index it reads, if any.
struct CompiledFilter {
    index: Option<usize>,
    min: i64,
    max: i64,
}

impl CompiledFilter {
    fn compile(filter: &RowFilter, columns: &[String], path: &Path) -> Result<Self, SourceError> {
        match filter {
            RowFilter::All => Ok(Self {
                index: None,
                min: 0,
                max: 0,
            }),
            RowFilter::CodeRange { field, min, max } => {
                let index = columns.iter().position(|c| c == field).ok_or_else(|| {
                    SourceError::format(path, format!("filter column {} absent", field))
                })?;
                Ok(Self {
                    index: Some(index),
                    min: *min,
                    max: *max,
                })
            }
        }
    }

    fn keep(&self, row: &[Value]) -> bool {
        match self.index {
            None => true,
            Some(i) => row[i]
                .as_code()
                .map_or(false, |c| c >= self.min && c <= self.max),
        }
    }
}

/// Load one source file.
pub fn load(
    path: &Path,
    source: SourceKind,
    year: i32,
    spec: &LoadSpec<'_>,
) -> Result<LoadedSource, SourceError> {
    let bytes = fs::read(path).map_err(|error| match error.kind() {
        std::io::ErrorKind::NotFound => SourceError::NotFound {
            kind: source,
            year,
            path: path.to_path_buf(),
        },
        _ => SourceError::Io {
            path: path.to_path_buf(),
            error,
        },
    })?;

    let loaded = if is_spreadsheet(path) {
        load_spreadsheet(path, &bytes, source, year, spec)?
    } else {
        load_delimited(path, &bytes, source, year, spec)?
    };

    info!(
        source = %source,
        year,
        path = %path.display(),
        rows_read = loaded.provenance.rows_read,
        rows_kept = loaded.provenance.rows_kept,
        columns = loaded.table.width(),
        "source loaded"
    );
    Ok(loaded)
}

fn load_delimited(
    path: &Path,
    bytes: &[u8],
    source: SourceKind,
    year: i32,
    spec: &LoadSpec<'_>,
) -> Result<LoadedSource, SourceError> {
    let (content, encoding) =
        decode(bytes).ok_or_else(|| SourceError::format(path, "content cannot be decoded"))?;

    let first_line = content.lines().next().unwrap_or("");
    if first_line.trim().is_empty() {
        return Err(SourceError::format(path, "missing header row"));
    }
    let delimiter = detect_delimiter(first_line);
    let delimiter_char = delimiter as char;
    debug!(path = %path.display(), delimiter = %delimiter_char, encoding, "parsing delimited file");

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(false)
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let header: Vec<String> = reader
        .headers()
        .map_err(|e| SourceError::format(path, format!("failed to read header: {}", e)))?
        .iter()
        .map(|h| h.to_string())
        .collect();

    let (keep, columns_absent) = projection(&header, spec);
    let columns: Vec<String> = keep.iter().map(|&i| header[i].clone()).collect();
    let filter = CompiledFilter::compile(&spec.filter, &columns, path)?;
    let decimal_comma = delimiter != b',';

    let mut table = Table::new(columns);
    let mut rows_read = 0;
    for (line_idx, result) in reader.records().enumerate() {
        let line_num = line_idx + 2; // +1 for 0-index, +1 for header
        let record = result
            .map_err(|e| SourceError::format(path, format!("line {}: {}", line_num, e)))?;
        rows_read += 1;

        let row: Vec<Value> = keep
            .iter()
            .map(|&i| Value::parse(record.get(i).unwrap_or(""), decimal_comma))
            .collect();
        if filter.keep(&row) {
            table.push_row(row);
        }
    }

    let rows_kept = table.len();
    Ok(LoadedSource {
        table,
        provenance: Provenance {
            source: source.to_string(),
            year,
            path: path.display().to_string(),
            content_hash: content_hash(bytes),
            format: "delimited",
            delimiter: Some(delimiter_char),
            encoding: Some(encoding),
            rows_read,
            rows_kept,
            columns_absent,
        },
    })
}

fn cell_value(cell: &Data) -> Value {
    match cell {
        Data::Empty => Value::Null,
        Data::Int(i) => Value::Int(*i),
        Data::Float(f) => Value::Float(*f),
        Data::Bool(b) => Value::Int(i64::from(*b)),
        Data::String(s) => Value::parse(s, true),
        other => Value::Text(format!("{}", other)),
    }
}

fn load_spreadsheet(
    path: &Path,
    bytes: &[u8],
    source: SourceKind,
    year: i32,
    spec: &LoadSpec<'_>,
) -> Result<LoadedSource, SourceError> {
    let mut workbook = open_workbook_auto(path)
        .map_err(|e| SourceError::format(path, format!("failed to open workbook: {}", e)))?;

    let sheet_name = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| SourceError::format(path, "workbook has no sheets"))?;
    let range = workbook
        .worksheet_range(&sheet_name)
        .map_err(|e| SourceError::format(path, format!("failed to read sheet: {}", e)))?;

    let mut rows = range.rows();
    let header: Vec<String> = rows
        .next()
        .ok_or_else(|| SourceError::format(path, "missing header row"))?
        .iter()
        .map(|cell| match cell {
            Data::String(s) => s.trim().to_string(),
            Data::Empty => String::new(),
            other => format!("{}", other),
        })
        .collect();
    if header.iter().all(|h| h.is_empty()) {
        return Err(SourceError::format(path, "missing header row"));
    }

    let (keep, columns_absent) = projection(&header, spec);
    let columns: Vec<String> = keep.iter().map(|&i| header[i].clone()).collect();
    let filter = CompiledFilter::compile(&spec.filter, &columns, path)?;

    let mut table = Table::new(columns);
    let mut rows_read = 0;
    for row in rows {
        rows_read += 1;
        let values: Vec<Value> = keep
            .iter()
            .map(|&i| row.get(i).map(cell_value).unwrap_or(Value::Null))
            .collect();
        if filter.keep(&values) {
            table.push_row(values);
        }
    }

    let rows_kept = table.len();
    Ok(LoadedSource {
        table,
        provenance: Provenance {
            source: source.to_string(),
            year,
            path: path.display().to_string(),
            content_hash: content_hash(bytes),
            format: "spreadsheet",
            delimiter: None,
            encoding: None,
            rows_read,
            rows_kept,
            columns_absent,
        },
    })
}

// =============================================================================
// TESTS
// =============================================================================
