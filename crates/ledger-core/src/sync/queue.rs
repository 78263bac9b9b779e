//! Pending sync queue
//!
//! Ordered list of local mutations waiting for the remote to acknowledge
//! them. The queue is persisted as JSON after every change so entries
//! survive a restart.
//!
//! Entries are never dropped silently: one that exhausts its retries is
//! parked with `status = failed` until an operator retries or discards it.

use std::fmt;
use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreResult;
use crate::record::Record;
use crate::storage::atomic_write;

/// Mutation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncAction::Insert => "insert",
            SyncAction::Update => "update",
            SyncAction::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// Entry state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    /// Waiting to be applied (possibly after a backoff)
    #[default]
    Pending,
    /// Exhausted retries or rejected by the remote
    Failed,
}

/// One queued mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueEntry {
    pub id: String,
    pub collection: String,
    pub record_id: String,
    pub action: SyncAction,
    /// Full record after the mutation; for deletes, the record as it was
    pub payload: Record,
    /// Wall-clock time of the local mutation (the record's new `updatedAt`)
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// `updatedAt` the mutation was computed against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_stamp: Option<String>,
    #[serde(default)]
    pub status: EntryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl SyncQueueEntry {
    pub fn new(
        collection: impl Into<String>,
        record_id: impl Into<String>,
        action: SyncAction,
        payload: Record,
        base_stamp: Option<String>,
    ) -> Self {
        let enqueued_at = payload
            .updated_at()
            .filter(|_| action != SyncAction::Delete)
            .unwrap_or_else(Utc::now);
        Self {
            id: Uuid::new_v4().to_string(),
            collection: collection.into(),
            record_id: record_id.into(),
            action,
            payload,
            enqueued_at,
            attempts: 0,
            last_error: None,
            base_stamp,
            status: EntryStatus::Pending,
            next_attempt_at: None,
        }
    }

    /// Key used for per-record ordering
    pub fn key(&self) -> (&str, &str) {
        (&self.collection, &self.record_id)
    }

    /// Check if the entry may be attempted at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == EntryStatus::Pending && self.next_attempt_at.map_or(true, |at| at <= now)
    }

    pub fn is_failed(&self) -> bool {
        self.status == EntryStatus::Failed
    }
}

/// Backoff policy for failed attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: std::time::Duration,
    pub max_backoff: std::time::Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: std::time::Duration::from_millis(1000),
            max_backoff: std::time::Duration::from_millis(60_000),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt after `attempts` failures
    ///
    /// `initial * 2^(attempts - 1)`, capped at `max_backoff`.
    pub fn backoff(&self, attempts: u32) -> std::time::Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        self.initial_backoff
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Check if `attempts` failures exhaust the policy
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

/// Persistent ordered queue
#[derive(Debug, Default)]
pub struct SyncQueue {
    entries: Vec<SyncQueueEntry>,
    /// Path to persist entries
    path: Option<PathBuf>,
}

impl SyncQueue {
    /// Create an in-memory queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a queue that persists to disk
    pub fn with_path(path: PathBuf) -> StoreResult<Self> {
        let mut queue = Self {
            entries: Vec::new(),
            path: Some(path.clone()),
        };

        if path.exists() {
            queue.load()?;
        }

        Ok(queue)
    }

    /// Append an entry
    pub fn enqueue(&mut self, entry: SyncQueueEntry) -> StoreResult<()> {
        self.entries.push(entry);
        self.save()
    }

    /// All entries in enqueue order
    pub fn entries(&self) -> &[SyncQueueEntry] {
        &self.entries
    }

    pub fn get(&self, entry_id: &str) -> Option<&SyncQueueEntry> {
        self.entries.iter().find(|e| e.id == entry_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_failed()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_failed()).count()
    }

    /// Check if any unsettled entry targets a record
    pub fn has_entries_for(&self, collection: &str, record_id: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.collection == collection && e.record_id == record_id)
    }

    /// Remove an acknowledged entry
    pub fn remove(&mut self, entry_id: &str) -> StoreResult<Option<SyncQueueEntry>> {
        let Some(index) = self.entries.iter().position(|e| e.id == entry_id) else {
            return Ok(None);
        };
        let entry = self.entries.remove(index);
        self.save()?;
        Ok(Some(entry))
    }

    /// Record a failed attempt
    ///
    /// Transient failures are rescheduled with backoff until the policy is
    /// exhausted; anything else parks the entry immediately. Returns the
    /// updated entry.
    pub fn record_failure(
        &mut self,
        entry_id: &str,
        error: String,
        transient: bool,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<SyncQueueEntry>> {
        let Some(entry) = self.entries.iter_mut().find(|e| e.id == entry_id) else {
            return Ok(None);
        };

        entry.attempts += 1;
        entry.last_error = Some(error);
        if transient && !policy.is_exhausted(entry.attempts) {
            let delay = Duration::from_std(policy.backoff(entry.attempts))
                .unwrap_or_else(|_| Duration::seconds(60));
            entry.next_attempt_at = Some(now + delay);
        } else {
            entry.status = EntryStatus::Failed;
            entry.next_attempt_at = None;
        }

        let updated = entry.clone();
        self.save()?;
        Ok(Some(updated))
    }

    /// Move every failed entry back to pending; returns how many moved
    pub fn retry_failed(&mut self) -> StoreResult<usize> {
        let mut count = 0;
        for entry in self.entries.iter_mut().filter(|e| e.is_failed()) {
            entry.status = EntryStatus::Pending;
            entry.attempts = 0;
            entry.next_attempt_at = None;
            count += 1;
        }
        if count > 0 {
            self.save()?;
        }
        Ok(count)
    }

    /// Drop an entry by operator decision
    pub fn discard(&mut self, entry_id: &str) -> StoreResult<Option<SyncQueueEntry>> {
        self.remove(entry_id)
    }

    /// Clear all entries
    pub fn clear(&mut self) -> StoreResult<()> {
        self.entries.clear();
        self.save()
    }

    /// Save entries to disk
    pub fn save(&self) -> StoreResult<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(&self.entries)?;
        atomic_write(path, json.as_bytes())
    }

    /// Load entries from disk
    fn load(&mut self) -> StoreResult<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        let json = fs::read_to_string(path)?;
        self.entries = serde_json::from_str(&json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn entry(record_id: &str) -> SyncQueueEntry {
        let payload = Record::from_value(json!({
            "id": record_id,
            "updatedAt": "2024-05-01T12:00:00.000Z"
        }))
        .unwrap();
        SyncQueueEntry::new("job", record_id, SyncAction::Update, payload, None)
    }

    #[test]
    fn test_enqueued_at_follows_record_stamp() {
        let e = entry("j1");
        assert_eq!(e.enqueued_at.to_rfc3339(), "2024-05-01T12:00:00+00:00");
        assert!(e.is_due(Utc::now()));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: std::time::Duration::from_millis(100),
            max_backoff: std::time::Duration::from_millis(1000),
        };
        assert_eq!(policy.backoff(1).as_millis(), 100);
        assert_eq!(policy.backoff(2).as_millis(), 200);
        assert_eq!(policy.backoff(4).as_millis(), 800);
        assert_eq!(policy.backoff(5).as_millis(), 1000);
        assert_eq!(policy.backoff(40).as_millis(), 1000);
    }

    #[test]
    fn test_transient_failures_until_exhausted() {
        let mut queue = SyncQueue::new();
        let e = entry("j1");
        let id = e.id.clone();
        queue.enqueue(e).unwrap();

        let policy = RetryPolicy {
            max_attempts: 2,
            ..RetryPolicy::default()
        };
        let now = Utc::now();

        let first = queue
            .record_failure(&id, "offline".into(), true, &policy, now)
            .unwrap()
            .unwrap();
        assert_eq!(first.status, EntryStatus::Pending);
        assert_eq!(first.attempts, 1);
        assert!(!first.is_due(now));
        assert!(first.is_due(now + Duration::seconds(2)));

        let second = queue
            .record_failure(&id, "offline".into(), true, &policy, now)
            .unwrap()
            .unwrap();
        assert!(second.is_failed());
        assert_eq!(queue.failed_count(), 1);
        // Parked, not dropped
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_permanent_failure_parks_immediately() {
        let mut queue = SyncQueue::new();
        let e = entry("j1");
        let id = e.id.clone();
        queue.enqueue(e).unwrap();

        let parked = queue
            .record_failure(&id, "rejected".into(), false, &RetryPolicy::default(), Utc::now())
            .unwrap()
            .unwrap();
        assert!(parked.is_failed());
        assert_eq!(parked.last_error.as_deref(), Some("rejected"));
    }

    #[test]
    fn test_retry_failed_and_discard() {
        let mut queue = SyncQueue::new();
        let a = entry("a");
        let b = entry("b");
        let (a_id, b_id) = (a.id.clone(), b.id.clone());
        queue.enqueue(a).unwrap();
        queue.enqueue(b).unwrap();

        let policy = RetryPolicy::default();
        for id in [&a_id, &b_id] {
            queue
                .record_failure(id, "bad".into(), false, &policy, Utc::now())
                .unwrap();
        }
        assert_eq!(queue.failed_count(), 2);

        assert!(queue.discard(&b_id).unwrap().is_some());
        assert_eq!(queue.retry_failed().unwrap(), 1);

        let a = queue.get(&a_id).unwrap();
        assert_eq!(a.status, EntryStatus::Pending);
        assert_eq!(a.attempts, 0);
        assert_eq!(queue.pending_count(), 1);
    }

    #[test]
    fn test_queue_persistence() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("sync_queue.json");

        {
            let mut queue = SyncQueue::with_path(path.clone()).unwrap();
            queue.enqueue(entry("j1")).unwrap();
            queue.enqueue(entry("j2")).unwrap();
        }

        let queue = SyncQueue::with_path(path).unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.entries()[0].record_id, "j1");
        assert!(queue.has_entries_for("job", "j2"));
        assert!(!queue.has_entries_for("job", "j3"));
    }
}
