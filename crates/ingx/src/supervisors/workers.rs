//! 🧵 Workers: the ones who actually do the work while the Supervisor takes all the
//! credit in the sprint retro.
//!
//! Each worker owns one store connection and one builder pool. Nothing of theirs is
//! shared with anybody. The queue is the only thing they fight over.

use anyhow::Result;
use tokio::task::JoinHandle;

mod ingest_worker;
pub(crate) use ingest_worker::IngestWorker;

/// 🏗️ A background worker, that does work. duh.
pub(crate) trait Worker {
    type Report;

    /// 🚀 Start the worker. Returns a JoinHandle because we trust
    /// but verify. Mostly verify.
    fn start(self) -> JoinHandle<Result<Self::Report>>;
}

/// 📋 What one worker got through before the queue ran dry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerReport {
    pub worker: usize,
    pub items_ok: usize,
    pub items_failed: usize,
    pub documents_written: usize,
    pub partial_dispatches: usize,
    pub rows_ok: usize,
    pub rows_skipped: usize,
    pub documents_failed: usize,
    pub builders_created: usize,
}
