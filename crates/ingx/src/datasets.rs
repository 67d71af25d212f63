//! 🛰️ Datasets: the read-only window onto decoded scientific content.
//!
//! The template engine only ever asks three questions: "what's in field X at row N",
//! "what's metadata field Y", and "how many rows are there". Everything else (grib
//! decoding, unit conversion, projections) happened before the bytes got here.
//!
//! ```text
//!   WorkItem ──▶ reader ──▶ DatasetBackend ──▶ Resolver
//!    (path)      (json / ndjson / .gz)
//!    (id)        (stored record)
//! ```

mod json_dataset;
mod record_dataset;

pub use json_dataset::{RowsDataset, TableDataset};
pub(crate) use json_dataset::open_path;
pub(crate) use record_dataset::{from_stored_record, rows_field_of};

use serde_json::Value;

/// 📖 Row-indexed read access to a decoded dataset.
///
/// Implementations must be pure reads: resolving the same `(name, row)` twice gives the
/// same answer.
pub trait Dataset: std::fmt::Debug + Send + Sync {
    fn row_count(&self) -> usize;

    /// Named field at a row. Array-valued fields are indexed by row; scalar fields are
    /// the same on every row. `None` when the field doesn't exist or the row is out of range.
    fn field(&self, name: &str, row: usize) -> Option<Value>;

    /// Scalar metadata (global attributes, header values).
    fn metadata(&self, name: &str) -> Option<Value>;

    /// The whole field as a list, one entry per row.
    fn column(&self, name: &str) -> Option<Vec<Value>> {
        let column: Vec<Value> = (0..self.row_count())
            .map(|row| self.field(name, row).unwrap_or(Value::Null))
            .collect();
        if column.iter().all(Value::is_null) {
            None
        } else {
            Some(column)
        }
    }
}

/// 🎭 The concrete datasets a work item can open into.
#[derive(Debug)]
pub enum DatasetBackend {
    Table(TableDataset),
    Rows(RowsDataset),
}

impl Dataset for DatasetBackend {
    fn row_count(&self) -> usize {
        match self {
            DatasetBackend::Table(d) => d.row_count(),
            DatasetBackend::Rows(d) => d.row_count(),
        }
    }

    fn field(&self, name: &str, row: usize) -> Option<Value> {
        match self {
            DatasetBackend::Table(d) => d.field(name, row),
            DatasetBackend::Rows(d) => d.field(name, row),
        }
    }

    fn metadata(&self, name: &str) -> Option<Value> {
        match self {
            DatasetBackend::Table(d) => d.metadata(name),
            DatasetBackend::Rows(d) => d.metadata(name),
        }
    }

    fn column(&self, name: &str) -> Option<Vec<Value>> {
        match self {
            DatasetBackend::Table(d) => d.column(name),
            DatasetBackend::Rows(d) => d.column(name),
        }
    }
}
