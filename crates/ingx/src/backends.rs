//! 🔌 Backends: where the real I/O happens.
//!
//! 🗄️ The pipeline talks to exactly one kind of thing: a document store. It upserts
//! documents in bulk, looks one up by id, asks "which files have you already seen?",
//! and eventually hangs up. That's the whole relationship.
//!
//! 🎭 Two stores are on the casting sheet: Elasticsearch for real runs, and an
//! in-memory map for tests and dry runs. The enum dispatches; the workers never
//! know which one they got.
//!
//! 🦆 The duck is here because every file must have one.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::app_config::StoreConfig;
use crate::common::DataFileRecord;

pub(crate) mod elasticsearch;
pub(crate) mod in_mem;

pub use elasticsearch::ElasticsearchStoreConfig;
pub use in_mem::InMemoryStore;

/// 💀 The three ways a store call can go wrong. Callers decide which ones they forgive.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("⏱️ store call timed out: {0}")]
    Timeout(String),
    #[error("🔍 '{0}' is not in the store")]
    NotFound(String),
    #[error("💀 store failure: {0}")]
    Failure(String),
}

impl StoreError {
    /// Flattens an error and its causes into one line. `reqwest` hides the useful part
    /// ("Connection refused") three sources deep.
    pub(crate) fn failure(err: &dyn std::error::Error) -> Self {
        let mut text = err.to_string();
        let mut source = err.source();
        while let Some(cause) = source {
            text.push_str(": ");
            text.push_str(&cause.to_string());
            source = cause.source();
        }
        StoreError::Failure(text)
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            StoreError::Timeout(err.to_string())
        } else {
            StoreError::failure(&err)
        }
    }
}

/// 🗄️ A document store, from the pipeline's point of view.
///
/// # Contract
/// - `bulk_upsert` writes every document by its `id` field and returns how many landed.
///   Best effort: no multi-document transaction.
/// - `get` is a point lookup; absence is `StoreError::NotFound`, not an empty value.
/// - `data_file_records` returns the processed-file markers for one ingest document.
/// - `close` MUST be called. Skipping it is a bug. It is also considered rude.
#[async_trait]
pub(crate) trait Store: std::fmt::Debug + Send {
    async fn bulk_upsert(&mut self, documents: Vec<Value>) -> Result<usize, StoreError>;
    async fn get(&mut self, id: &str) -> Result<Value, StoreError>;
    async fn data_file_records(
        &mut self,
        ingest_document_id: &str,
    ) -> Result<Vec<DataFileRecord>, StoreError>;
    async fn close(&mut self) -> Result<(), StoreError>;
}

/// 🎭 One open store connection. Each worker owns exactly one.
#[derive(Debug)]
pub(crate) enum StoreBackend {
    InMemory(InMemoryStore),
    Elasticsearch(elasticsearch::ElasticsearchStore),
}

#[async_trait]
impl Store for StoreBackend {
    async fn bulk_upsert(&mut self, documents: Vec<Value>) -> Result<usize, StoreError> {
        match self {
            StoreBackend::InMemory(store) => store.bulk_upsert(documents).await,
            StoreBackend::Elasticsearch(store) => store.bulk_upsert(documents).await,
        }
    }

    async fn get(&mut self, id: &str) -> Result<Value, StoreError> {
        match self {
            StoreBackend::InMemory(store) => store.get(id).await,
            StoreBackend::Elasticsearch(store) => store.get(id).await,
        }
    }

    async fn data_file_records(
        &mut self,
        ingest_document_id: &str,
    ) -> Result<Vec<DataFileRecord>, StoreError> {
        match self {
            StoreBackend::InMemory(store) => store.data_file_records(ingest_document_id).await,
            StoreBackend::Elasticsearch(store) => {
                store.data_file_records(ingest_document_id).await
            }
        }
    }

    async fn close(&mut self) -> Result<(), StoreError> {
        match self {
            StoreBackend::InMemory(store) => store.close().await,
            StoreBackend::Elasticsearch(store) => store.close().await,
        }
    }
}

/// 🔑 Everything needed to open a fresh connection. Cloned into every worker, so no
/// worker ever reaches for a shared handle.
#[derive(Debug, Clone)]
pub(crate) enum StoreConnector {
    InMemory(InMemoryStore),
    Elasticsearch(ElasticsearchStoreConfig),
}

impl StoreConnector {
    pub(crate) fn from_config(config: &StoreConfig) -> Self {
        match config {
            StoreConfig::Elasticsearch(es) => StoreConnector::Elasticsearch(es.clone()),
            StoreConfig::InMemory => StoreConnector::InMemory(InMemoryStore::default()),
        }
    }

    pub(crate) async fn connect(&self) -> Result<StoreBackend, StoreError> {
        match self {
            StoreConnector::InMemory(store) => {
                store.connect()?;
                Ok(StoreBackend::InMemory(store.clone()))
            }
            StoreConnector::Elasticsearch(config) => Ok(StoreBackend::Elasticsearch(
                elasticsearch::ElasticsearchStore::connect(config.clone()).await?,
            )),
        }
    }
}

/// 🔄 Connect, and if the store isn't answering, try again `retries` more times with a
/// fixed `backoff` between attempts. Exhaustion returns the last error.
pub(crate) async fn connect_with_retry(
    connector: &StoreConnector,
    retries: usize,
    backoff: Duration,
) -> Result<StoreBackend, StoreError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match connector.connect().await {
            Ok(store) => {
                debug!("📡 store connection established on attempt {attempt}");
                return Ok(store);
            }
            Err(err) if attempt <= retries => {
                warn!(
                    "🔄 store connection attempt {attempt}/{} failed: {err}. Backing off {:?}.",
                    retries + 1,
                    backoff
                );
                tokio::time::sleep(backoff).await;
            }
            Err(err) => return Err(err),
        }
    }
}
