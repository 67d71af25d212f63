//! 🎬 *[camera pans across a dimly lit server room]*
//! 🎬 "In a world where workers toil endlessly..."
//! 🎬 "One supervisor dared to manage them all."
//! 🎬 *[record scratch]* 🦆
//!
//! 📦 The Supervisor: loads the job, works out what's new, fills the queue, starts the
//! workers, waits for all of them, and writes the load-job record last.
//!
//! ⚠️ DO NOT MAKE THE WORKERS PUB EVER
//! 🔒 Like Fight Club, but for async tasks. First rule: you don't pub the workers.

mod work_queue;
mod workers;

pub use workers::WorkerReport;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::app_config::AppConfig;
use crate::backends::{Store, StoreBackend, StoreConnector, connect_with_retry};
use crate::common::{LOAD_JOB_TYPE, LoadJobRecord, WorkItem};
use crate::discovery::{
    DiscoveryFilter, discover, discover_identifiers, known_records_index, list_candidates,
};
use crate::dispatch::DispatchMode;
use crate::job::{IngestDocument, JobSpec, load_job};
use crate::progress::RunProgress;
use work_queue::WorkQueue;
use workers::{IngestWorker, Worker};

const DEFAULT_FILE_PATTERN: &str = "*";

/// 🏁 How the run went, start to finish. The load-job record holds the same numbers.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub job_id: String,
    pub load_job_id: String,
    pub items_total: usize,
    pub items_ok: usize,
    pub items_failed: usize,
    pub items_unacknowledged: usize,
    pub documents_written: usize,
    pub partial_dispatches: usize,
    pub rows_ok: usize,
    pub rows_skipped: usize,
    pub documents_failed: usize,
    pub workers_started: usize,
    pub workers_failed: usize,
    pub elapsed: Duration,
}

/// 📦 The Supervisor: because even async tasks need someone hovering over them
/// asking "is it done yet?" every 250 milliseconds.
pub(crate) struct Supervisor {
    app_config: AppConfig,
    connector: StoreConnector,
    show_progress: bool,
}

impl Supervisor {
    pub(crate) fn new(app_config: AppConfig) -> Self {
        let connector = StoreConnector::from_config(&app_config.store);
        Self {
            app_config,
            connector,
            show_progress: true,
        }
    }

    /// Same supervisor, handed a connector it didn't have to build itself.
    #[cfg(test)]
    pub(crate) fn with_connector(app_config: AppConfig, connector: StoreConnector) -> Self {
        Self {
            app_config,
            connector,
            show_progress: false,
        }
    }

    pub(crate) async fn run(&self) -> Result<RunSummary> {
        let started = Instant::now();
        let run_start = chrono::Utc::now().timestamp();
        self.app_config.validate()?;

        let runtime = &self.app_config.runtime;
        let mut store = connect_with_retry(
            &self.connector,
            runtime.connect_retries,
            runtime.connect_backoff(),
        )
        .await
        .context("💀 The supervisor could not reach the store, so nobody else will either")?;

        let job = load_job(&self.app_config.job, &mut store).await?;
        job.validate()?;
        let job = Arc::new(job);

        let dispatch = Arc::new(DispatchMode::from_output_dir(
            self.app_config.output.dir.as_deref(),
        ));
        let items = self.discover_work(&job, &mut store, &dispatch).await?;
        let items_total = items.len();
        info!(
            "🚀 job '{}': {items_total} work item(s), {} worker(s)",
            job.id, runtime.worker_count
        );

        let queue = WorkQueue::from_items(items);
        let progress = if self.show_progress {
            RunProgress::new(items_total as u64)
        } else {
            RunProgress::hidden(items_total as u64)
        };
        let handles: Vec<_> = (0..runtime.worker_count)
            .map(|index| {
                IngestWorker::new(
                    index,
                    queue.clone(),
                    self.connector.clone(),
                    Arc::clone(&job),
                    Arc::clone(&dispatch),
                    runtime.clone(),
                    progress.clone(),
                )
                .start()
            })
            .collect();
        let workers_started = handles.len();
        let (reports, workers_failed) = join_workers(handles).await;
        progress.finish();
        if workers_failed == workers_started {
            bail!("💀 all {workers_started} worker(s) failed to start. Nothing was ingested.");
        }
        if workers_failed > 0 {
            warn!("⚠️ {workers_failed} of {workers_started} worker(s) failed, the rest carried on");
        }

        let items_unacknowledged = queue.unacknowledged().await;
        let mut summary = RunSummary {
            job_id: job.id.clone(),
            load_job_id: LoadJobRecord::id_for(&job.subset, &job.id, run_start),
            items_total,
            items_ok: 0,
            items_failed: 0,
            items_unacknowledged,
            documents_written: 0,
            partial_dispatches: 0,
            rows_ok: 0,
            rows_skipped: 0,
            documents_failed: 0,
            workers_started,
            workers_failed,
            elapsed: Duration::ZERO,
        };
        for report in &reports {
            summary.items_ok += report.items_ok;
            summary.items_failed += report.items_failed;
            summary.documents_written += report.documents_written;
            summary.partial_dispatches += report.partial_dispatches;
            summary.rows_ok += report.rows_ok;
            summary.rows_skipped += report.rows_skipped;
            summary.documents_failed += report.documents_failed;
        }

        let record = LoadJobRecord {
            id: summary.load_job_id.clone(),
            record_type: LOAD_JOB_TYPE.to_string(),
            subset: job.subset.clone(),
            job_id: job.id.clone(),
            lineage: self.app_config.job.lineage.clone(),
            ingest_documents: job.ingest_documents.iter().map(|d| d.id.clone()).collect(),
            run_start,
            run_end: chrono::Utc::now().timestamp(),
            items_total,
            items_ok: summary.items_ok,
            items_failed: summary.items_failed,
            items_unacknowledged,
            documents_written: summary.documents_written,
            partial_dispatches: summary.partial_dispatches,
            workers_started,
            workers_failed,
        };
        dispatch
            .dispatch_load_job(&mut store, &record)
            .await
            .context("💀 The run finished but its load-job record was not written")?;
        if let Err(err) = store.close().await {
            warn!("⚠️ closing the supervisor's store connection failed: {err}");
        }

        summary.elapsed = started.elapsed();
        info!(
            "🏁 job '{}' finished: {} ok, {} failed, {} documents in {:?}",
            summary.job_id,
            summary.items_ok,
            summary.items_failed,
            summary.documents_written,
            summary.elapsed
        );
        Ok(summary)
    }

    /// 🔍 Work for every ingest document, in the order the job lists them.
    async fn discover_work(
        &self,
        job: &JobSpec,
        store: &mut StoreBackend,
        dispatch: &DispatchMode,
    ) -> Result<Vec<WorkItem>> {
        let mut items = Vec::new();
        for document in &job.ingest_documents {
            let found = if document.record_ids.is_empty() {
                self.discover_paths(document, store, dispatch).await?
            } else {
                discover_identifiers(&document.record_ids, &document.id)
            };
            debug!("🔍 '{}': {} item(s)", document.id, found.len());
            items.extend(found);
        }
        Ok(items)
    }

    async fn discover_paths(
        &self,
        document: &IngestDocument,
        store: &mut StoreBackend,
        dispatch: &DispatchMode,
    ) -> Result<Vec<WorkItem>> {
        let discovery = &self.app_config.discovery;
        let configured = document.input_dir.as_ref().or(discovery.input_dir.as_ref());
        let input_dir: PathBuf = match configured {
            Some(dir) => dir.clone(),
            None => {
                warn!(
                    "⚠️ ingest document '{}' has no input directory and no record ids, skipping it",
                    document.id
                );
                return Ok(Vec::new());
            }
        };
        let pattern = document
            .file_pattern
            .as_deref()
            .or(discovery.file_pattern.as_deref())
            .unwrap_or(DEFAULT_FILE_PATTERN);
        let filter = DiscoveryFilter {
            file_mask: document.file_mask.clone().or_else(|| discovery.file_mask.clone()),
            first_epoch: discovery.first_epoch,
            last_epoch: discovery.last_epoch,
        };

        let candidates = list_candidates(&input_dir, pattern).await?;
        // -- file mode writes no markers, so there is nothing to diff against
        let known = if dispatch.is_store() {
            let records = store.data_file_records(&document.id).await.context(format!(
                "💀 Could not read back what '{}' already ingested",
                document.id
            ))?;
            known_records_index(&records)
        } else {
            HashMap::new()
        };
        Ok(discover(candidates, &known, &filter)
            .into_iter()
            .map(|candidate| WorkItem::from_path(candidate.path, candidate.mtime, &document.id))
            .collect())
    }
}

/// 🤝 Waits for every worker. Returns the reports of the ones that made it, and how many
/// didn't.
async fn join_workers(
    handles: Vec<JoinHandle<Result<WorkerReport>>>,
) -> (Vec<WorkerReport>, usize) {
    let mut reports = Vec::with_capacity(handles.len());
    let mut failed = 0;
    for (index, joined) in join_all(handles).await.into_iter().enumerate() {
        match joined {
            Ok(Ok(report)) => reports.push(report),
            Ok(Err(err)) => {
                failed += 1;
                error!("💀 worker {index} gave up: {err:#}");
            }
            Err(join_err) => {
                failed += 1;
                error!("💀 worker {index} panicked or was cancelled: {join_err}");
            }
        }
    }
    (reports, failed)
}
