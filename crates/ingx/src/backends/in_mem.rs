//! # Previously, on ingx...
//!
//! 🎬 The documents were built. They needed somewhere to land. Somewhere with no
//! network, no disk, no cluster health page. Somewhere that forgets everything the
//! moment the process exits.
//!
//! That somewhere is this module. [`InMemoryStore`] is a `BTreeMap` behind an
//! `Arc<tokio::sync::Mutex<...>>`. Every clone shares the same map, so a test can hand
//! one clone to the pipeline and keep another to peek at what arrived.
//!
//! ⚠️ It can also be told to misbehave: refuse the next N connections, or time out the
//! next N writes. Great for tests, great for trust issues, great for both.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{trace, warn};

use super::{Store, StoreError};
use crate::common::{DATA_FILE_TYPE, DataFileRecord};

/// 📦 A store that never forgets (until it's dropped).
#[derive(Debug, Default, Clone)]
pub struct InMemoryStore {
    documents: Arc<Mutex<BTreeMap<String, Value>>>,
    connect_failures: Arc<AtomicUsize>,
    write_timeouts: Arc<AtomicUsize>,
}

/// Decrements a fault counter if it's armed. Returns whether a fault fired.
fn take_fault(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl InMemoryStore {
    pub async fn insert(&self, id: impl Into<String>, document: Value) {
        self.documents.lock().await.insert(id.into(), document);
    }

    pub async fn document(&self, id: &str) -> Option<Value> {
        self.documents.lock().await.get(id).cloned()
    }

    pub async fn ids(&self) -> Vec<String> {
        self.documents.lock().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.documents.lock().await.len()
    }

    /// 💥 The next `n` connection attempts are refused.
    pub fn fail_next_connects(&self, n: usize) {
        self.connect_failures.store(n, Ordering::SeqCst);
    }

    /// ⏱️ The next `n` bulk writes time out without storing anything.
    pub fn time_out_next_writes(&self, n: usize) {
        self.write_timeouts.store(n, Ordering::SeqCst);
    }

    pub fn remaining_connect_failures(&self) -> usize {
        self.connect_failures.load(Ordering::SeqCst)
    }

    pub(crate) fn connect(&self) -> Result<(), StoreError> {
        if take_fault(&self.connect_failures) {
            return Err(StoreError::Failure(
                "in-memory store refused the connection (Connection refused)".into(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn bulk_upsert(&mut self, documents: Vec<Value>) -> Result<usize, StoreError> {
        if take_fault(&self.write_timeouts) {
            warn!("⏱️ in-memory store is pretending to time out on {} documents", documents.len());
            return Err(StoreError::Timeout("simulated write timeout".into()));
        }
        // -- check every id before touching the map, so a bad batch writes nothing
        let keyed = documents
            .into_iter()
            .map(|document| match document.get("id").and_then(Value::as_str) {
                Some(id) => Ok((id.to_string(), document)),
                None => Err(StoreError::Failure("document has no string 'id' field".into())),
            })
            .collect::<Result<Vec<_>, _>>()?;
        let written = keyed.len();
        let mut map = self.documents.lock().await;
        for (id, document) in keyed {
            map.insert(id, document);
        }
        trace!("📥 in-memory store upserted {written} documents");
        Ok(written)
    }

    async fn get(&mut self, id: &str) -> Result<Value, StoreError> {
        self.document(id)
            .await
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn data_file_records(
        &mut self,
        ingest_document_id: &str,
    ) -> Result<Vec<DataFileRecord>, StoreError> {
        let map = self.documents.lock().await;
        Ok(map
            .values()
            .filter(|doc| doc.get("type").and_then(Value::as_str) == Some(DATA_FILE_TYPE))
            .filter(|doc| {
                doc.get("ingest_document").and_then(Value::as_str) == Some(ingest_document_id)
            })
            .filter_map(|doc| serde_json::from_value(doc.clone()).ok())
            .collect())
    }

    async fn close(&mut self) -> Result<(), StoreError> {
        // -- nothing to flush, we live in RAM
        Ok(())
    }
}
