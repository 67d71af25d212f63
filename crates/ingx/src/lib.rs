//! 🛰️ ingx: templates in, documents out, files never ingested twice.
//!
//! Two halves:
//! - the template engine ([`template`]): a tiny grammar that turns `"DD:*station:&round|1:*temp"`
//!   into values pulled from a dataset row, plus the assemblers that fold rows into documents;
//! - the ingest pipeline: discovery finds new files, a pool of workers builds and
//!   dispatches them, and one load-job record closes out the run.
//!
//! The binary in `ingx-cli` is the front door. [`run`] is everything behind it.

pub mod app_config;
pub mod common;
pub mod datasets;
pub mod discovery;
pub mod job;
pub mod progress;
pub mod template;

mod assemblers;
mod backends;
mod dispatch;
mod supervisors;

pub use assemblers::{BuildState, BuildStats};
pub use backends::{ElasticsearchStoreConfig, InMemoryStore, StoreError};
pub use supervisors::{RunSummary, WorkerReport};

use anyhow::{Context, Result};

use crate::app_config::AppConfig;
use crate::supervisors::Supervisor;

/// 🚀 One full run: load the job, discover, ingest, record. Fatal setup problems come
/// back as errors; per-item trouble only shows up in the summary and the logs.
pub async fn run(app_config: AppConfig) -> Result<RunSummary> {
    Supervisor::new(app_config)
        .run()
        .await
        .context("💀 The ingest run did not complete")
}
