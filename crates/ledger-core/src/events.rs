//! Typed store events
//!
//! A closed set of event kinds published on a broadcast bus. Collections
//! publish `Changed` after every successful mutation; the sync engine
//! publishes queue progress, conflicts and pulled records.
//!
//! Subscribers that fall behind lose the oldest events (`RecvError::Lagged`)
//! rather than blocking publishers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::record::Record;
use crate::sync::{ConflictRecord, SyncAction, SyncQueueEntry};

/// Default channel capacity
const DEFAULT_CAPACITY: usize = 256;

/// Kind of mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

/// A successful mutation on one record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub collection: String,
    pub operation: ChangeOperation,
    /// Record before the mutation (`None` for inserts)
    pub before: Option<Record>,
    /// Record after the mutation (`None` for deletes)
    pub after: Option<Record>,
}

/// Events published by the store
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// A record changed
    Changed(ChangeEvent),

    /// A queued mutation was acknowledged by the remote
    Synced {
        entry_id: String,
        collection: String,
        record_id: String,
        action: SyncAction,
    },

    /// A queued mutation failed transiently and will be retried
    RetryScheduled {
        entry_id: String,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
        error: String,
    },

    /// A queued mutation exhausted its retries or was rejected
    SyncFailed { entry: SyncQueueEntry, error: String },

    /// A conflict was detected and resolved
    Conflict(ConflictRecord),

    /// A newer remote record was written locally
    Pulled { collection: String, record_id: String },
}

/// Broadcast bus for store events
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<StoreEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to future events
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.sender.subscribe()
    }

    /// Publish an event; a bus without subscribers drops it
    pub fn publish(&self, event: StoreEvent) {
        let _ = self.sender.send(event);
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
