//! 📬 Output dispatch: built documents leave the building.
//!
//! Two modes, picked once per run:
//! - **Store**: one bulk upsert per work item, the data-file marker riding in the same batch.
//! - **File**: one JSON array per work item in the output directory.
//!
//! At most once. A timeout or a refused write is logged and counted as partial, and
//! the worker moves on. Nobody retries the batch. The marker went down with the
//! documents, so discovery will offer the file again on the next run.
//!
//! A file that built nothing still gets its marker in store mode. Otherwise an empty
//! or unreadable file would be offered again on every run until it changed.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::{
    fs::File,
    io::{self, AsyncWriteExt},
};
use tracing::{debug, error, info, trace, warn};

use crate::backends::{Store, StoreBackend, StoreError};
use crate::common::{DataFileRecord, DocumentMap, LoadJobRecord, WorkItem, WorkSource, file_name_of};

/// 📊 What happened to one item's documents.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum DispatchOutcome {
    /// This many output documents were written (markers not included).
    Written(usize),
    /// Nothing was built. Only the marker (if any) was sent.
    Empty,
    /// The write failed or timed out. Some, all, or none of it may have landed.
    Partial { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum DispatchMode {
    Store,
    File(FileDispatcher),
}

impl DispatchMode {
    pub(crate) fn from_output_dir(output_dir: Option<&Path>) -> Self {
        match output_dir {
            Some(dir) => DispatchMode::File(FileDispatcher::new(dir)),
            None => DispatchMode::Store,
        }
    }

    pub(crate) fn is_store(&self) -> bool {
        matches!(self, DispatchMode::Store)
    }

    pub(crate) async fn dispatch(
        &self,
        store: &mut StoreBackend,
        item: &WorkItem,
        documents: DocumentMap,
        marker: Option<DataFileRecord>,
    ) -> DispatchOutcome {
        if documents.is_empty() {
            info!("📭 '{}' built no documents, nothing to dispatch", item.label());
            return match self.mark_consumed(store, item, marker).await {
                Ok(()) => DispatchOutcome::Empty,
                Err(err) => DispatchOutcome::Partial {
                    reason: err.to_string(),
                },
            };
        }
        let count = documents.len();
        let outcome = match self {
            DispatchMode::Store => dispatch_to_store(store, documents, marker)
                .await
                .map_err(anyhow::Error::from),
            DispatchMode::File(files) => files.write(item, documents).await,
        };
        match outcome {
            Ok(()) => {
                debug!("📬 '{}': {count} documents dispatched", item.label());
                DispatchOutcome::Written(count)
            }
            Err(err) => {
                let reason = format!("{err:#}");
                warn!(
                    "⚠️ '{}': {count} documents may not have been persisted: {reason}",
                    item.label()
                );
                DispatchOutcome::Partial { reason }
            }
        }
    }

    /// 🧾 Writes the marker alone, for items whose documents never made it to dispatch.
    /// File mode keeps no markers, so there it does nothing.
    pub(crate) async fn mark_consumed(
        &self,
        store: &mut StoreBackend,
        item: &WorkItem,
        marker: Option<DataFileRecord>,
    ) -> Result<(), StoreError> {
        let (DispatchMode::Store, Some(marker)) = (self, marker) else {
            return Ok(());
        };
        let id = marker.id.clone();
        dispatch_to_store(store, DocumentMap::new(), Some(marker))
            .await
            .inspect_err(|err| {
                warn!("⚠️ '{}': marker '{id}' was not written: {err}", item.label());
            })?;
        debug!("🧾 '{}' marked consumed as '{id}'", item.label());
        Ok(())
    }

    /// 📜 The run's closing record. Unlike item dispatch, failure here is reported.
    pub(crate) async fn dispatch_load_job(
        &self,
        store: &mut StoreBackend,
        record: &LoadJobRecord,
    ) -> Result<()> {
        let value = serde_json::to_value(record).context("💀 load-job record did not serialize")?;
        match self {
            DispatchMode::Store => {
                store.bulk_upsert(vec![value]).await.map_err(|err| {
                    error!("💀 load-job record '{}' was not written: {err}", record.id);
                    err
                })?;
            }
            DispatchMode::File(files) => files.write_value(&record.id, &value).await?,
        }
        info!("📜 load-job record '{}' written", record.id);
        Ok(())
    }
}

async fn dispatch_to_store(
    store: &mut StoreBackend,
    documents: DocumentMap,
    marker: Option<DataFileRecord>,
) -> Result<(), StoreError> {
    let mut batch: Vec<Value> = documents.into_values().collect();
    if let Some(marker) = marker {
        let marker = serde_json::to_value(&marker)
            .map_err(|err| StoreError::Failure(format!("marker did not serialize: {err}")))?;
        batch.push(marker);
    }
    store.bulk_upsert(batch).await.map(|_| ())
}

/// 📂 Writes each item's documents as a JSON array into one directory.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FileDispatcher {
    output_dir: PathBuf,
}

impl FileDispatcher {
    pub(crate) fn new(output_dir: &Path) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
        }
    }

    /// `<output_dir>/<input file stem>.json`, or the sanitized record id for identifier work.
    pub(crate) fn target_for(&self, item: &WorkItem) -> PathBuf {
        let stem = match &item.source {
            WorkSource::Path { path, .. } => path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| file_name_of(path)),
            WorkSource::Identifier { id } => id.clone(),
        };
        self.output_dir.join(format!("{}.json", sanitize(&stem)))
    }

    async fn write(&self, item: &WorkItem, documents: DocumentMap) -> Result<()> {
        let documents: Vec<Value> = documents.into_values().collect();
        self.write_to(&self.target_for(item), &Value::Array(documents)).await
    }

    async fn write_value(&self, name: &str, value: &Value) -> Result<()> {
        let target = self.output_dir.join(format!("{}.json", sanitize(name)));
        self.write_to(&target, value).await
    }

    async fn write_to(&self, target: &Path, value: &Value) -> Result<()> {
        tokio::fs::create_dir_all(&self.output_dir).await.context(format!(
            "💀 Output directory '{}' could not be created",
            self.output_dir.display()
        ))?;
        let bytes = serde_json::to_vec_pretty(value)?;
        let file = File::create(target).await.context(format!(
            "💀 '{}' could not be conjured into existence",
            target.display()
        ))?;
        let mut file_buf = io::BufWriter::new(file);
        file_buf.write_all(&bytes).await?;
        file_buf
            .flush()
            .await
            .context(format!("💀 flushing '{}' failed", target.display()))?;
        trace!("📝 wrote {} bytes to '{}'", bytes.len(), target.display());
        Ok(())
    }
}

/// Keeps `[A-Za-z0-9._-]`, everything else becomes `_`. Ids are full of colons.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect()
}
