//! 🗄️ Stored records as datasets: for jobs that re-ingest what's already in the store.
//!
//! A stored record is one JSON document. Its `rows_field` (usually `data`) holds the rows,
//! either as an array of objects or as an object keyed by row name, and every other
//! top-level field is metadata.

use anyhow::{Result, bail};
use serde_json::{Map, Value};

use super::{DatasetBackend, RowsDataset};

/// Key under which a keyed row's name is exposed when the row doesn't carry one itself.
const ROW_NAME_FIELD: &str = "name";
/// Ingest param naming the field that holds a stored record's rows.
pub(crate) const ROWS_FIELD_PARAM: &str = "rows_field";
const DEFAULT_ROWS_FIELD: &str = "data";

/// The rows field an ingest document asked for, or `data`.
pub(crate) fn rows_field_of(params: &Map<String, Value>) -> &str {
    params
        .get(ROWS_FIELD_PARAM)
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_ROWS_FIELD)
}

pub(crate) fn from_stored_record(record: Value, rows_field: &str) -> Result<DatasetBackend> {
    let Value::Object(mut top) = record else {
        bail!("💀 a stored record must be a JSON object");
    };
    let rows = match top.remove(rows_field) {
        Some(Value::Array(rows)) => rows
            .into_iter()
            .enumerate()
            .map(|(index, row)| match row {
                Value::Object(fields) => Ok(fields),
                _ => bail!("💀 '{rows_field}[{index}]' is not an object"),
            })
            .collect::<Result<Vec<_>>>()?,
        Some(Value::Object(keyed)) => keyed
            .into_iter()
            .map(|(key, row)| match row {
                Value::Object(mut fields) => {
                    fields
                        .entry(ROW_NAME_FIELD)
                        .or_insert_with(|| Value::String(key));
                    Ok(fields)
                }
                _ => bail!("💀 '{rows_field}.{key}' is not an object"),
            })
            .collect::<Result<Vec<_>>>()?,
        Some(_) => bail!("💀 '{rows_field}' must be an array or an object of rows"),
        None => bail!("💀 the stored record has no '{rows_field}' field"),
    };

    // -- everything left at the top level is header material
    let metadata: Map<String, Value> = top
        .into_iter()
        .filter(|(_, v)| !v.is_object() && !v.is_array())
        .collect();
    Ok(DatasetBackend::Rows(RowsDataset::new(metadata, rows)))
}
