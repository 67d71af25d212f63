//! 🎬 *[a queue fills with file paths. somewhere, a worker connects to the store.]*
//! *[the clock on the wall reads 2:47am.]*
//!
//! 🏭 The IngestWorker: pop, open, build, dispatch, acknowledge. Repeat until the
//! queue is dry. It does not requeue. It does not retry writes. A bad file is logged,
//! marked as seen, and left behind, and the worker reaches for the next one.
//!
//! Decoding and assembly are CPU work, so they run on tokio's blocking pool. The
//! worker's own task only ever waits on the queue and the store.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{Worker, WorkerReport};
use crate::app_config::RuntimeConfig;
use crate::assemblers::{Assembler, BuildOutcome, BuilderPool};
use crate::backends::{Store, StoreBackend, StoreConnector, connect_with_retry};
use crate::common::{WorkItem, WorkSource};
use crate::datasets::{DatasetBackend, from_stored_record, open_path, rows_field_of};
use crate::dispatch::{DispatchMode, DispatchOutcome};
use crate::job::{ConfigError, IngestDocument, JobSpec};
use crate::progress::RunProgress;
use crate::supervisors::work_queue::{Pop, WorkQueue};

#[derive(Debug)]
pub(crate) struct IngestWorker {
    index: usize,
    queue: WorkQueue,
    connector: StoreConnector,
    job: Arc<JobSpec>,
    dispatch: Arc<DispatchMode>,
    runtime: RuntimeConfig,
    progress: RunProgress,
}

impl IngestWorker {
    pub(crate) fn new(
        index: usize,
        queue: WorkQueue,
        connector: StoreConnector,
        job: Arc<JobSpec>,
        dispatch: Arc<DispatchMode>,
        runtime: RuntimeConfig,
        progress: RunProgress,
    ) -> Self {
        Self {
            index,
            queue,
            connector,
            job,
            dispatch,
            runtime,
            progress,
        }
    }

    async fn run(self) -> Result<WorkerReport> {
        let mut store = connect_with_retry(
            &self.connector,
            self.runtime.connect_retries,
            self.runtime.connect_backoff(),
        )
        .await
        .context(format!(
            "💀 worker {} could not reach the store after {} attempts",
            self.index,
            self.runtime.connect_retries + 1
        ))?;
        debug!("🧵 worker {} connected, draining the queue", self.index);

        let mut pool = BuilderPool::new();
        let mut report = WorkerReport {
            worker: self.index,
            ..WorkerReport::default()
        };
        let mut empty_polls = 0;
        loop {
            match self.queue.pop().await {
                Pop::Item(ticket) => {
                    empty_polls = 0;
                    let label = ticket.item.label();
                    let documents_before = report.documents_written;
                    let processed = self
                        .process(&mut store, &mut pool, &ticket.item, &mut report)
                        .await;
                    let ok = match processed {
                        Ok(DispatchOutcome::Written(count)) => {
                            report.documents_written += count;
                            true
                        }
                        Ok(DispatchOutcome::Empty) => true,
                        Ok(DispatchOutcome::Partial { .. }) => {
                            report.partial_dispatches += 1;
                            false
                        }
                        Err(err) => {
                            error!("💀 worker {}: '{label}' failed: {err:#}", self.index);
                            false
                        }
                    };
                    if ok {
                        report.items_ok += 1;
                    } else {
                        report.items_failed += 1;
                    }
                    // -- consumed either way, nobody comes back for it
                    self.queue.ack(ticket.id).await;
                    self.progress.item_done(
                        &label,
                        ok,
                        (report.documents_written - documents_before) as u64,
                    );
                }
                Pop::Drained => break,
                Pop::Empty => {
                    if empty_polls >= self.runtime.drain_retries {
                        debug!(
                            "💤 worker {}: queue stayed empty for {empty_polls} polls",
                            self.index
                        );
                        break;
                    }
                    empty_polls += 1;
                    tokio::time::sleep(self.runtime.drain_wait()).await;
                }
            }
        }

        report.builders_created = pool.created();
        if let Err(err) = store.close().await {
            warn!("⚠️ worker {}: closing the store connection failed: {err}", self.index);
        }
        info!(
            "🏁 worker {} done: {} ok, {} failed, {} documents",
            self.index, report.items_ok, report.items_failed, report.documents_written
        );
        Ok(report)
    }

    async fn process(
        &self,
        store: &mut StoreBackend,
        pool: &mut BuilderPool,
        item: &WorkItem,
        report: &mut WorkerReport,
    ) -> Result<DispatchOutcome> {
        let document = self
            .job
            .ingest_document(&item.ingest_document_id)
            .ok_or_else(|| ConfigError::UnknownIngestDocument(item.ingest_document_id.clone()))?;
        let marker = item.data_file_record(document);

        let outcome = match self.build(store, pool, item, document).await {
            Ok(outcome) => outcome,
            Err(err) => {
                // -- consumed all the same: a broken file stays broken until its mtime moves
                if self.dispatch.mark_consumed(store, item, marker).await.is_err() {
                    report.partial_dispatches += 1;
                }
                return Err(err);
            }
        };
        report.rows_ok += outcome.stats.rows_ok;
        report.rows_skipped += outcome.stats.rows_skipped;
        report.documents_failed += outcome.stats.documents_failed;

        Ok(self
            .dispatch
            .dispatch(store, item, outcome.documents, marker)
            .await)
    }

    /// 🏗️ Open the dataset, then build it on the blocking pool with this worker's
    /// assembler for the document's builder type.
    async fn build(
        &self,
        store: &mut StoreBackend,
        pool: &mut BuilderPool,
        item: &WorkItem,
        document: &IngestDocument,
    ) -> Result<BuildOutcome> {
        let dataset = open_dataset(store, item, document).await?;
        let mut assembler = pool.take_out(document.builder_type, document)?;

        let job = Arc::clone(&self.job);
        let owned_item = item.clone();
        let (assembler, built) = tokio::task::spawn_blocking(move || {
            let built = match job.ingest_document(&owned_item.ingest_document_id) {
                Some(document) => assembler.build(document, &owned_item, &dataset),
                None => Err(ConfigError::UnknownIngestDocument(
                    owned_item.ingest_document_id.clone(),
                )
                .into()),
            };
            (assembler, built)
        })
        .await
        .context(format!("💀 the build of '{}' panicked", item.label()))?;
        pool.put_back(assembler);

        built.context(format!("💀 building '{}' failed", item.label()))
    }
}

async fn open_dataset(
    store: &mut StoreBackend,
    item: &WorkItem,
    document: &IngestDocument,
) -> Result<DatasetBackend> {
    match &item.source {
        WorkSource::Path { path, .. } => open_path(path).await,
        WorkSource::Identifier { id } => {
            let record = store
                .get(id)
                .await
                .context(format!("💀 could not fetch stored record '{id}'"))?;
            from_stored_record(record, rows_field_of(&document.params))
        }
    }
}

impl Worker for IngestWorker {
    type Report = WorkerReport;

    fn start(self) -> JoinHandle<Result<WorkerReport>> {
        tokio::spawn(self.run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::InMemoryStore;
    use crate::job::BuilderType;
    use serde_json::{Map, json};
    use std::time::Duration;

    fn runtime() -> RuntimeConfig {
        RuntimeConfig {
            worker_count: 1,
            drain_retries: 1,
            drain_wait_ms: 1,
            connect_retries: 0,
            connect_backoff_ms: 1,
        }
    }

    fn job() -> Arc<JobSpec> {
        Arc::new(JobSpec {
            id: "job".into(),
            subset: "METAR".into(),
            ingest_documents: vec![IngestDocument {
                id: "MD:1".into(),
                builder_type: BuilderType::RowPerDocument,
                subset: "METAR".into(),
                template: json!({"id": "DD:*station", "temp": "*temp"}),
                params: Map::new(),
                optional_fields: vec![],
                record_ids: vec![],
                input_dir: None,
                file_pattern: None,
                file_mask: None,
            }],
        })
    }

    fn worker(queue: WorkQueue, memory: &InMemoryStore, job: Arc<JobSpec>) -> IngestWorker {
        IngestWorker::new(
            0,
            queue,
            StoreConnector::InMemory(memory.clone()),
            job,
            Arc::new(DispatchMode::Store),
            runtime(),
            RunProgress::hidden(0),
        )
    }

    #[tokio::test]
    async fn the_one_where_good_and_bad_files_share_a_queue() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.json");
        let bad = dir.path().join("bad.json");
        std::fs::write(&good, br#"{"columns": {"station": ["KDEN", "KBOU"], "temp": [1, 2]}}"#)
            .unwrap();
        std::fs::write(&bad, b"this is not json").unwrap();

        let memory = InMemoryStore::default();
        let queue = WorkQueue::from_items([
            WorkItem::from_path(&bad, 1, "MD:1"),
            WorkItem::from_path(&good, 2, "MD:1"),
        ]);
        let report = worker(queue.clone(), &memory, job()).start().await.unwrap().unwrap();

        assert_eq!(report.items_ok, 1);
        assert_eq!(report.items_failed, 1);
        assert_eq!(report.documents_written, 2);
        assert_eq!(report.builders_created, 1);
        assert_eq!(queue.unacknowledged().await, 0);
        // -- two documents and a marker for the good file, just a marker for the bad one
        assert_eq!(memory.len().await, 4);
        let ids = memory.ids().await;
        assert!(ids.iter().any(|id| id == "DF:METAR:row_per_document:MD:1:bad.json"));
    }

    #[tokio::test]
    async fn the_one_where_stored_records_are_work_too() {
        let memory = InMemoryStore::default();
        memory
            .insert(
                "RAW:1",
                json!({"data": [{"station": "KDEN", "temp": 3}, {"station": "KCOS", "temp": 4}]}),
            )
            .await;
        let queue = WorkQueue::from_items([WorkItem::from_identifier("RAW:1", "MD:1")]);
        let report = worker(queue, &memory, job()).start().await.unwrap().unwrap();

        assert_eq!(report.documents_written, 2);
        assert_eq!(memory.document("DD:KCOS").await, Some(json!({"id": "DD:KCOS", "temp": 4})));
    }

    #[tokio::test]
    async fn the_one_where_the_worker_waits_for_late_work() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("late.json");
        std::fs::write(&path, br#"{"columns": {"station": "KDEN", "temp": 1}}"#).unwrap();

        let memory = InMemoryStore::default();
        let (queue, feeder) = WorkQueue::open();
        let mut patient = worker(queue, &memory, job());
        patient.runtime.drain_retries = 50;
        patient.runtime.drain_wait_ms = 5;
        let handle = patient.start();

        tokio::time::sleep(Duration::from_millis(20)).await;
        feeder.push(WorkItem::from_path(&path, 1, "MD:1"));
        drop(feeder);

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.items_ok, 1);
    }

    #[tokio::test]
    async fn the_one_where_an_unreachable_store_costs_only_this_worker() {
        let memory = InMemoryStore::default();
        memory.fail_next_connects(5);
        let queue = WorkQueue::from_items([WorkItem::from_identifier("RAW:1", "MD:1")]);
        let result = worker(queue.clone(), &memory, job()).start().await.unwrap();
        assert!(result.is_err());
        // -- it never popped anything, so the item is still there for somebody else
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn the_one_where_a_write_timeout_is_counted_not_retried() {
        let memory = InMemoryStore::default();
        memory
            .insert("RAW:1", json!({"data": [{"station": "KDEN", "temp": 3}]}))
            .await;
        memory.time_out_next_writes(1);
        let queue = WorkQueue::from_items([WorkItem::from_identifier("RAW:1", "MD:1")]);
        let report = worker(queue, &memory, job()).start().await.unwrap().unwrap();
        assert_eq!(report.partial_dispatches, 1);
        assert_eq!(report.items_failed, 1);
        assert!(memory.document("DD:KDEN").await.is_none());
    }
}
