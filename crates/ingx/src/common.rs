//! 📦 Common data structures: the things that travel through the pipeline.
//!
//! 🎬 A file path walks into a queue. It comes out the other side as forty
//! documents, one data-file marker, and a line in somebody's load-job record.
//! This module defines all of them. They don't ask questions. They carry data. 🦆

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::job::IngestDocument;

/// Record type tag for data-file markers.
pub const DATA_FILE_TYPE: &str = "DF";
/// Record type tag for load-job records.
pub const LOAD_JOB_TYPE: &str = "LJ";

/// 🗺️ Output documents for one work item, keyed by their resolved id.
pub type DocumentMap = BTreeMap<String, Value>;

/// 🎯 One unit of ingest work: where the data comes from, and which ingest document
/// says what to do with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub source: WorkSource,
    pub ingest_document_id: String,
}

/// 📍 The two flavours of work: a file on disk, or a record already in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkSource {
    /// `mtime` is in milliseconds since the epoch.
    Path { path: PathBuf, mtime: i64 },
    Identifier { id: String },
}

impl WorkItem {
    pub fn from_path(path: impl Into<PathBuf>, mtime: i64, ingest_document_id: &str) -> Self {
        Self {
            source: WorkSource::Path {
                path: path.into(),
                mtime,
            },
            ingest_document_id: ingest_document_id.to_string(),
        }
    }

    pub fn from_identifier(id: impl Into<String>, ingest_document_id: &str) -> Self {
        Self {
            source: WorkSource::Identifier { id: id.into() },
            ingest_document_id: ingest_document_id.to_string(),
        }
    }

    /// Something a human can grep the logs for.
    pub fn label(&self) -> String {
        match &self.source {
            WorkSource::Path { path, .. } => path.display().to_string(),
            WorkSource::Identifier { id } => id.clone(),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.source {
            WorkSource::Path { path, .. } => Some(path),
            WorkSource::Identifier { .. } => None,
        }
    }

    /// 🎒 The parameter bag handlers see: the ingest document's params plus where this
    /// item came from.
    pub(crate) fn parameter_bag(&self, document: &IngestDocument) -> Map<String, Value> {
        let mut bag = document.params.clone();
        bag.insert("subset".into(), json!(document.subset));
        bag.insert("ingest_document".into(), json!(document.id));
        bag.insert("builder_type".into(), json!(document.builder_type.as_str()));
        match &self.source {
            WorkSource::Path { path, mtime } => {
                bag.insert("file_path".into(), json!(path.display().to_string()));
                bag.insert("file_name".into(), json!(file_name_of(path)));
                bag.insert("mtime".into(), json!(mtime));
            }
            WorkSource::Identifier { id } => {
                bag.insert("record_id".into(), json!(id));
            }
        }
        bag
    }

    /// The marker that says "this file is done". Identifier work leaves no marker.
    pub(crate) fn data_file_record(&self, document: &IngestDocument) -> Option<DataFileRecord> {
        match &self.source {
            WorkSource::Path { path, mtime } => Some(DataFileRecord::new(path, *mtime, document)),
            WorkSource::Identifier { .. } => None,
        }
    }
}

pub(crate) fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// 🧾 "We processed this file, and here's the mtime we saw." Work discovery reads these
/// back to skip files that haven't changed. One per file per ingest document: two
/// documents reading the same directory each keep their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataFileRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub record_type: String,
    pub subset: String,
    pub builder_type: String,
    pub url: String,
    /// Milliseconds since the epoch.
    pub mtime: i64,
    pub ingest_document: String,
}

impl DataFileRecord {
    pub fn new(path: &Path, mtime: i64, document: &IngestDocument) -> Self {
        let builder_type = document.builder_type.as_str().to_string();
        Self {
            id: format!(
                "{DATA_FILE_TYPE}:{}:{}:{}:{}",
                document.subset,
                builder_type,
                document.id,
                file_name_of(path)
            ),
            record_type: DATA_FILE_TYPE.to_string(),
            subset: document.subset.clone(),
            builder_type,
            url: path.display().to_string(),
            mtime,
            ingest_document: document.id.clone(),
        }
    }
}

/// 📜 One per run. Written last. If it exists, the run finished (whatever else happened).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadJobRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub record_type: String,
    pub subset: String,
    pub job_id: String,
    pub lineage: String,
    pub ingest_documents: Vec<String>,
    pub run_start: i64,
    pub run_end: i64,
    pub items_total: usize,
    pub items_ok: usize,
    pub items_failed: usize,
    pub items_unacknowledged: usize,
    pub documents_written: usize,
    pub partial_dispatches: usize,
    pub workers_started: usize,
    pub workers_failed: usize,
}

impl LoadJobRecord {
    pub fn id_for(subset: &str, job_id: &str, run_start: i64) -> String {
        format!("{LOAD_JOB_TYPE}:{subset}:{job_id}:{run_start}")
    }
}
