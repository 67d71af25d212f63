//! 📂 JSON-shaped datasets read straight off disk.
//!
//! Three layouts, optionally gzip-compressed (`.gz` suffix):
//!
//! - columnar: `{"metadata": {...}, "columns": {"temp": [..], "station": "KDEN"}}`
//! - row document: `{"metadata": {...}, "rows": [{...}, {...}]}` (or a bare top-level array)
//! - NDJSON (`.ndjson` / `.jsonl`): one row object per line
//!
//! Numeric cells equal to the metadata `_FillValue` (or `missing_value`) are masked.

use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result, bail};
use flate2::read::GzDecoder;
use serde_json::{Map, Value};
use tracing::trace;

use super::{Dataset, DatasetBackend};

const FILL_VALUE_KEYS: [&str; 2] = ["_FillValue", "missing_value"];

/// 📊 Column-oriented dataset: every field is either a per-row array or a broadcast scalar.
#[derive(Debug, Clone, Default)]
pub struct TableDataset {
    metadata: Map<String, Value>,
    columns: Map<String, Value>,
    rows: usize,
    fill_value: Option<f64>,
}

impl TableDataset {
    pub fn new(metadata: Map<String, Value>, columns: Map<String, Value>) -> Self {
        let longest_array = columns
            .values()
            .filter_map(|v| v.as_array().map(Vec::len))
            .max();
        // -- 📏 no arrays at all means one row of scalars, or nothing
        let rows = match longest_array {
            Some(len) => len,
            None if columns.is_empty() => 0,
            None => 1,
        };
        let fill_value = fill_value_of(&metadata);
        Self {
            metadata,
            columns,
            rows,
            fill_value,
        }
    }

    /// Build from a `{"metadata": .., "columns": ..}` JSON value.
    pub fn from_json(value: Value) -> Result<Self> {
        let Value::Object(mut top) = value else {
            bail!("💀 a columnar dataset must be a JSON object");
        };
        let columns = match top.remove("columns") {
            Some(Value::Object(columns)) => columns,
            _ => bail!("💀 a columnar dataset needs a 'columns' object"),
        };
        let metadata = take_metadata(&mut top);
        Ok(Self::new(metadata, columns))
    }
}

impl Dataset for TableDataset {
    fn row_count(&self) -> usize {
        self.rows
    }

    fn field(&self, name: &str, row: usize) -> Option<Value> {
        if row >= self.rows {
            return None;
        }
        let cell = match self.columns.get(name)? {
            Value::Array(cells) => cells.get(row)?.clone(),
            scalar => scalar.clone(),
        };
        unmask(cell, self.fill_value)
    }

    fn metadata(&self, name: &str) -> Option<Value> {
        self.metadata.get(name).cloned()
    }

    fn column(&self, name: &str) -> Option<Vec<Value>> {
        match self.columns.get(name)? {
            Value::Array(cells) => Some(
                cells
                    .iter()
                    .map(|cell| unmask(cell.clone(), self.fill_value).unwrap_or(Value::Null))
                    .collect(),
            ),
            _ => None,
        }
    }
}

/// 🧾 Row-oriented dataset: a list of objects, one per observation or level.
#[derive(Debug, Clone, Default)]
pub struct RowsDataset {
    metadata: Map<String, Value>,
    rows: Vec<Map<String, Value>>,
    fill_value: Option<f64>,
}

impl RowsDataset {
    pub fn new(metadata: Map<String, Value>, rows: Vec<Map<String, Value>>) -> Self {
        let fill_value = fill_value_of(&metadata);
        Self {
            metadata,
            rows,
            fill_value,
        }
    }

    fn from_values(metadata: Map<String, Value>, rows: Vec<Value>) -> Result<Self> {
        let rows = rows
            .into_iter()
            .enumerate()
            .map(|(index, row)| match row {
                Value::Object(fields) => Ok(fields),
                _ => bail!("💀 row {index} is not a JSON object"),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(metadata, rows))
    }
}

impl Dataset for RowsDataset {
    fn row_count(&self) -> usize {
        self.rows.len()
    }

    fn field(&self, name: &str, row: usize) -> Option<Value> {
        let cell = self.rows.get(row)?.get(name)?.clone();
        unmask(cell, self.fill_value)
    }

    fn metadata(&self, name: &str) -> Option<Value> {
        self.metadata.get(name).cloned()
    }
}

/// 🚪 Open a dataset file, picking the layout from the extension. The read is async;
/// inflating and parsing happen on the blocking pool.
pub(crate) async fn open_path(path: &Path) -> Result<DatasetBackend> {
    let raw = tokio::fs::read(path).await.context(format!(
        "💀 Could not read dataset '{}'. The file was in the listing a moment ago. \
         Files are like that sometimes.",
        path.display()
    ))?;
    let owned_path = path.to_path_buf();
    tokio::task::spawn_blocking(move || decode(&owned_path, raw))
        .await
        .context(format!("💀 decoding '{}' panicked", path.display()))?
}

fn decode(path: &Path, raw: Vec<u8>) -> Result<DatasetBackend> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let (bytes, logical_name) = match file_name.strip_suffix(".gz") {
        Some(inner) => {
            let mut inflated = Vec::with_capacity(raw.len() * 4);
            GzDecoder::new(raw.as_slice())
                .read_to_end(&mut inflated)
                .context(format!("💀 '{}' claims to be gzip. It lied.", path.display()))?;
            (inflated, inner.to_string())
        }
        None => (raw, file_name),
    };

    trace!("📖 read {} bytes for dataset '{}'", bytes.len(), path.display());
    let is_lines = logical_name.ends_with(".ndjson") || logical_name.ends_with(".jsonl");
    if is_lines {
        parse_lines(&bytes).context(format!("💀 bad NDJSON in '{}'", path.display()))
    } else {
        parse_document(&bytes).context(format!("💀 bad JSON dataset '{}'", path.display()))
    }
}

pub(crate) fn parse_document(bytes: &[u8]) -> Result<DatasetBackend> {
    let value: Value = serde_json::from_slice(bytes)?;
    match value {
        Value::Array(rows) => Ok(DatasetBackend::Rows(RowsDataset::from_values(
            Map::new(),
            rows,
        )?)),
        Value::Object(ref top) if top.contains_key("columns") => {
            Ok(DatasetBackend::Table(TableDataset::from_json(value)?))
        }
        Value::Object(mut top) => {
            let rows = match top.remove("rows") {
                Some(Value::Array(rows)) => rows,
                _ => bail!("💀 expected a 'columns' object or a 'rows' array"),
            };
            let metadata = take_metadata(&mut top);
            Ok(DatasetBackend::Rows(RowsDataset::from_values(metadata, rows)?))
        }
        _ => bail!("💀 a dataset must be a JSON object or array"),
    }
}

pub(crate) fn parse_lines(bytes: &[u8]) -> Result<DatasetBackend> {
    let mut rows = Vec::new();
    let mut start = 0usize;
    let ends = memchr::memchr_iter(b'\n', bytes).chain(std::iter::once(bytes.len()));
    for (line_number, end) in ends.enumerate() {
        let mut line = &bytes[start..end];
        start = end + 1;
        if let Some(stripped) = line.strip_suffix(b"\r") {
            line = stripped;
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let row: Value = serde_json::from_slice(line)
            .context(format!("💀 line {} is not valid JSON", line_number + 1))?;
        rows.push(row);
    }
    Ok(DatasetBackend::Rows(RowsDataset::from_values(Map::new(), rows)?))
}

fn take_metadata(top: &mut Map<String, Value>) -> Map<String, Value> {
    match top.remove("metadata") {
        Some(Value::Object(metadata)) => metadata,
        _ => Map::new(),
    }
}

fn fill_value_of(metadata: &Map<String, Value>) -> Option<f64> {
    FILL_VALUE_KEYS
        .iter()
        .find_map(|key| metadata.get(*key).and_then(Value::as_f64))
}

/// Masked cells vanish: `null`, the fill value, and non-numeric "NaN" strings.
fn unmask(cell: Value, fill_value: Option<f64>) -> Option<Value> {
    let masked = match &cell {
        Value::Null => true,
        Value::Number(n) => fill_value.is_some() && n.as_f64() == fill_value,
        Value::String(s) => s.eq_ignore_ascii_case("nan"),
        _ => false,
    };
    if masked { None } else { Some(cell) }
}
