//! 📬 The work queue: the only thing the workers share.
//!
//! FIFO over an `async_channel`, plus a ledger of what's been popped but not yet
//! acknowledged. A worker that dies mid-item leaves its ticket in the ledger, and the
//! supervisor counts it at the end instead of pretending it happened.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_channel::{Receiver, Sender, TryRecvError};
use tokio::sync::Mutex;
use tracing::{trace, warn};

use crate::common::WorkItem;

#[derive(Debug, Clone)]
pub(crate) struct Ticket {
    pub(crate) id: u64,
    pub(crate) item: WorkItem,
}

/// What a non-blocking pop found.
#[derive(Debug)]
pub(crate) enum Pop {
    Item(Ticket),
    /// Nothing right now, but a feeder is still attached.
    Empty,
    /// Nothing, and nothing is coming.
    Drained,
}

#[derive(Debug, Clone)]
pub(crate) struct WorkQueue {
    rx: Receiver<Ticket>,
    in_flight: Arc<Mutex<HashMap<u64, WorkItem>>>,
    acknowledged: Arc<AtomicUsize>,
}

/// ✉️ The sending half. Drop it and the queue closes once it empties.
#[derive(Debug)]
pub(crate) struct WorkFeeder {
    tx: Sender<Ticket>,
    next_id: AtomicU64,
}

impl WorkFeeder {
    pub(crate) fn push(&self, item: WorkItem) -> bool {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        match self.tx.try_send(Ticket { id, item }) {
            Ok(()) => true,
            Err(err) => {
                warn!("⚠️ work queue refused '{}': it is closed", err.into_inner().item.label());
                false
            }
        }
    }
}

impl WorkQueue {
    pub(crate) fn open() -> (Self, WorkFeeder) {
        let (tx, rx) = async_channel::unbounded();
        let queue = Self {
            rx,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            acknowledged: Arc::new(AtomicUsize::new(0)),
        };
        let feeder = WorkFeeder {
            tx,
            next_id: AtomicU64::new(0),
        };
        (queue, feeder)
    }

    /// 📦 Everything up front, then closed. Workers drain it and leave.
    pub(crate) fn from_items(items: impl IntoIterator<Item = WorkItem>) -> Self {
        let (queue, feeder) = Self::open();
        for item in items {
            feeder.push(item);
        }
        queue
    }

    pub(crate) async fn pop(&self) -> Pop {
        match self.rx.try_recv() {
            Ok(ticket) => {
                self.in_flight
                    .lock()
                    .await
                    .insert(ticket.id, ticket.item.clone());
                trace!("📤 ticket {} popped: '{}'", ticket.id, ticket.item.label());
                Pop::Item(ticket)
            }
            Err(TryRecvError::Empty) => Pop::Empty,
            Err(TryRecvError::Closed) => Pop::Drained,
        }
    }

    /// ✅ The item is consumed, however it went.
    pub(crate) async fn ack(&self, ticket_id: u64) {
        if self.in_flight.lock().await.remove(&ticket_id).is_some() {
            self.acknowledged.fetch_add(1, Ordering::Relaxed);
        } else {
            warn!("⚠️ ticket {ticket_id} acknowledged twice, or never popped");
        }
    }

    pub(crate) fn acknowledged(&self) -> usize {
        self.acknowledged.load(Ordering::Relaxed)
    }

    /// Popped and never acknowledged, plus whatever nobody got around to popping.
    pub(crate) async fn unacknowledged(&self) -> usize {
        self.in_flight.lock().await.len() + self.rx.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.rx.len()
    }
}
