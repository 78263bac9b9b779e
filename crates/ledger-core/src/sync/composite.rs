//! Composite adapter (offline sync engine)
//!
//! Layers a local **primary** adapter and a **remote** adapter behind a
//! persistent pending queue.
//!
//! ## Write path
//!
//! Mutations land on the primary and return as soon as it succeeds. The
//! full post-write record is then queued for the remote (for deletes, the
//! record as it was). A crash between the primary write and the queue
//! write loses only the remote propagation of that one mutation.
//!
//! ## Drain
//!
//! Entries are applied in enqueue order. Once an entry for a record fails
//! or is not yet due, later entries for the same record wait for the next
//! drain, so per-record ordering is preserved. Transient failures back off
//! exponentially; exhausted or rejected entries are parked as failed and
//! reported through `StoreEvent::SyncFailed`.
//!
//! ## Conflicts
//!
//! Before an update or delete is applied, the remote record's `updatedAt`
//! is compared with the stamp the local mutation was computed against. A
//! mismatch is resolved last-write-wins on the local mutation time versus
//! the remote stamp; the losing version is appended to the `ConflictLog`.
//! The winner replaces the whole record on the losing side. A remote winner
//! is written back to the primary when no later local mutation for the
//! record is queued.
//!
//! An update whose record has vanished from the remote since its base stamp
//! was deleted by another client. The delete carries no stamp, so the local
//! update wins and is re-inserted; the conflict is still logged.
//!
//! ## Reads
//!
//! Reads are always served by the primary. `pull` refreshes the primary
//! with newer remote records in the active user's sync scope. Remote
//! deletions are not detected by `pull`.

use std::collections::{BTreeSet, HashSet};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use super::conflict::{ConflictKind, ConflictLog, ConflictRecord, Resolution};
use super::queue::{RetryPolicy, SyncAction, SyncQueue, SyncQueueEntry};
use super::rules::{SelectiveSyncRule, SyncRules};
use crate::adapter::{BulkItemResult, BulkOptions, BulkUpdate, DataAdapter, SharedAdapter};
use crate::error::StoreResult;
use crate::events::{EventBus, StoreEvent};
use crate::query::{AggregateOptions, AggregateResult, QueryOptions};
use crate::record::Record;

/// Outcome of one drain pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Entries acknowledged by the remote
    pub synced: usize,
    /// Acknowledged entries that went through conflict resolution
    pub conflicts: usize,
    /// Entries rescheduled after a transient failure
    pub retried: usize,
    /// Entries parked as failed during this pass
    pub failed: usize,
    /// Entries dropped because they left the sync scope
    pub skipped: usize,
    /// Entries not attempted (backoff or blocked behind their record)
    pub deferred: usize,
}

impl DrainReport {
    /// Check if nothing went wrong in this pass
    pub fn is_clean(&self) -> bool {
        self.retried == 0 && self.failed == 0
    }
}

/// Local-first adapter with an offline queue
pub struct CompositeAdapter {
    primary: SharedAdapter,
    remote: SharedAdapter,
    queue: Mutex<SyncQueue>,
    conflicts: Mutex<ConflictLog>,
    rules: RwLock<SyncRules>,
    active_user: RwLock<Option<String>>,
    tracked: RwLock<BTreeSet<String>>,
    policy: RetryPolicy,
    events: EventBus,
    drain_lock: Mutex<()>,
    notify: Notify,
}

impl CompositeAdapter {
    /// Create a composite with in-memory queue, conflict log and rules
    pub fn new(primary: SharedAdapter, remote: SharedAdapter, events: EventBus) -> Self {
        Self {
            primary,
            remote,
            queue: Mutex::new(SyncQueue::new()),
            conflicts: Mutex::new(ConflictLog::new()),
            rules: RwLock::new(SyncRules::new()),
            active_user: RwLock::new(None),
            tracked: RwLock::new(BTreeSet::new()),
            policy: RetryPolicy::default(),
            events,
            drain_lock: Mutex::new(()),
            notify: Notify::new(),
        }
    }

    pub fn with_queue(mut self, queue: SyncQueue) -> Self {
        self.queue = Mutex::new(queue);
        self
    }

    pub fn with_conflict_log(mut self, log: ConflictLog) -> Self {
        self.conflicts = Mutex::new(log);
        self
    }

    pub fn with_rules(mut self, rules: SyncRules) -> Self {
        self.rules = RwLock::new(rules);
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_active_user(self, user_id: Option<String>) -> Self {
        *self.active_user.write().unwrap_or_else(PoisonError::into_inner) = user_id;
        self
    }

    pub fn primary(&self) -> &SharedAdapter {
        &self.primary
    }

    pub fn remote(&self) -> &SharedAdapter {
        &self.remote
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // ==== Selective sync ====

    /// Switch the user whose sync rules apply
    pub fn set_active_user(&self, user_id: Option<String>) {
        info!("Active sync user set to {:?}", user_id);
        *self.active_user.write().unwrap_or_else(PoisonError::into_inner) = user_id;
    }

    pub fn active_user(&self) -> Option<String> {
        self.active_user
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Add a selective sync rule
    pub fn add_rule(&self, rule: SelectiveSyncRule) -> StoreResult<()> {
        self.rules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .add(rule)
    }

    pub fn rules(&self) -> Vec<SelectiveSyncRule> {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .rules()
            .to_vec()
    }

    /// Check if a record is in the active user's sync scope
    pub fn in_scope(&self, collection: &str, record: &Record) -> bool {
        let user = self.active_user();
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .in_scope(user.as_deref(), collection, record)
    }

    /// Register collections covered by `pull_all`
    pub fn track_collections<I, S>(&self, collections: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut tracked = self.tracked.write().unwrap_or_else(PoisonError::into_inner);
        tracked.extend(collections.into_iter().map(Into::into));
    }

    pub fn tracked_collections(&self) -> Vec<String> {
        self.tracked
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    // ==== Queue inspection ====

    /// Snapshot of the queue in enqueue order
    pub async fn queue_entries(&self) -> Vec<SyncQueueEntry> {
        self.queue.lock().await.entries().to_vec()
    }

    pub async fn pending_count(&self) -> usize {
        self.queue.lock().await.pending_count()
    }

    pub async fn failed_count(&self) -> usize {
        self.queue.lock().await.failed_count()
    }

    /// Move failed entries back to pending and wake the drain loop
    pub async fn retry_failed(&self) -> StoreResult<usize> {
        let count = self.queue.lock().await.retry_failed()?;
        if count > 0 {
            info!("Requeued {} failed sync entr(ies)", count);
            self.notify.notify_one();
        }
        Ok(count)
    }

    /// Drop a queued entry by operator decision
    pub async fn discard(&self, entry_id: &str) -> StoreResult<Option<SyncQueueEntry>> {
        let discarded = self.queue.lock().await.discard(entry_id)?;
        if let Some(ref entry) = discarded {
            warn!(
                "Discarded queued {} of {}/{}",
                entry.action, entry.collection, entry.record_id
            );
        }
        Ok(discarded)
    }

    /// Resolved conflicts, oldest first
    pub async fn conflicts(&self) -> Vec<ConflictRecord> {
        self.conflicts.lock().await.records().to_vec()
    }

    /// Flush the queue to disk
    pub async fn persist(&self) -> StoreResult<()> {
        self.queue.lock().await.save()
    }

    /// Wait until a local write queues something
    pub async fn wait_for_writes(&self) {
        self.notify.notified().await;
    }

    // ==== Write path ====

    fn track(&self, collection: &str) {
        let mut tracked = self.tracked.write().unwrap_or_else(PoisonError::into_inner);
        if !tracked.contains(collection) {
            tracked.insert(collection.to_string());
        }
    }

    async fn enqueue(
        &self,
        collection: &str,
        action: SyncAction,
        payload: Record,
        base_stamp: Option<String>,
    ) {
        self.track(collection);
        let Some(record_id) = payload.id().map(str::to_string) else {
            return;
        };
        if !self.in_scope(collection, &payload) {
            debug!(
                "{}/{} is outside the sync scope, not queued",
                collection, record_id
            );
            return;
        }

        let entry = SyncQueueEntry::new(collection, &record_id, action, payload, base_stamp);
        if let Err(e) = self.queue.lock().await.enqueue(entry) {
            // Entry stays queued in memory; only durability is lost
            warn!(
                "Failed to persist sync queue after {} of {}/{}: {}",
                action, collection, record_id, e
            );
        }
        debug!("Queued {} of {}/{}", action, collection, record_id);
        self.notify.notify_one();
    }

    // ==== Drain ====

    /// Apply queued mutations to the remote
    ///
    /// Concurrent calls are serialized; each pass works on a snapshot of
    /// the queue taken when it starts.
    pub async fn drain(&self) -> StoreResult<DrainReport> {
        let _drain = self.drain_lock.lock().await;
        let snapshot = self.queue_entries().await;
        let mut report = DrainReport::default();
        let mut blocked: HashSet<(String, String)> = HashSet::new();
        let now = Utc::now();

        for entry in snapshot {
            if entry.is_failed() {
                continue;
            }
            let key = (entry.collection.clone(), entry.record_id.clone());
            if blocked.contains(&key) || !entry.is_due(now) {
                blocked.insert(key);
                report.deferred += 1;
                continue;
            }

            if !self.in_scope(&entry.collection, &entry.payload) {
                info!(
                    "Dropping queued {} of {}/{}: no longer in sync scope",
                    entry.action, entry.collection, entry.record_id
                );
                self.queue.lock().await.remove(&entry.id)?;
                report.skipped += 1;
                continue;
            }

            match self.apply(&entry).await {
                Ok(conflict) => {
                    self.queue.lock().await.remove(&entry.id)?;
                    report.synced += 1;
                    if let Some(conflict) = conflict {
                        report.conflicts += 1;
                        self.record_conflict(conflict).await?;
                    }
                    debug!(
                        "Synced {} of {}/{}",
                        entry.action, entry.collection, entry.record_id
                    );
                    self.events.publish(StoreEvent::Synced {
                        entry_id: entry.id.clone(),
                        collection: entry.collection.clone(),
                        record_id: entry.record_id.clone(),
                        action: entry.action,
                    });
                }
                Err(e) => {
                    blocked.insert(key);
                    let updated = self.queue.lock().await.record_failure(
                        &entry.id,
                        e.to_string(),
                        e.is_transient(),
                        &self.policy,
                        Utc::now(),
                    )?;
                    let Some(updated) = updated else {
                        // Discarded while in flight
                        continue;
                    };

                    if updated.is_failed() {
                        report.failed += 1;
                        warn!(
                            "Giving up on {} of {}/{} after {} attempt(s): {}",
                            updated.action,
                            updated.collection,
                            updated.record_id,
                            updated.attempts,
                            e
                        );
                        self.events.publish(StoreEvent::SyncFailed {
                            entry: updated,
                            error: e.to_string(),
                        });
                    } else {
                        report.retried += 1;
                        let next_attempt_at = updated.next_attempt_at.unwrap_or(now);
                        debug!(
                            "Retrying {} of {}/{} at {} (attempt {}): {}",
                            updated.action,
                            updated.collection,
                            updated.record_id,
                            next_attempt_at,
                            updated.attempts,
                            e
                        );
                        self.events.publish(StoreEvent::RetryScheduled {
                            entry_id: updated.id,
                            attempts: updated.attempts,
                            next_attempt_at,
                            error: e.to_string(),
                        });
                    }
                }
            }
        }

        if report != DrainReport::default() {
            info!(
                "Drain: {} synced, {} conflict(s), {} retrying, {} failed, {} deferred",
                report.synced, report.conflicts, report.retried, report.failed, report.deferred
            );
        }
        Ok(report)
    }

    /// Apply one entry to the remote; returns the conflict it resolved, if any
    async fn apply(&self, entry: &SyncQueueEntry) -> StoreResult<Option<ConflictRecord>> {
        let collection = entry.collection.as_str();
        let id = entry.record_id.as_str();
        let current = self.remote.get(collection, id).await?;

        match (entry.action, current) {
            (SyncAction::Update, None) if entry.base_stamp.is_some() => {
                self.remote.insert(collection, entry.payload.clone()).await?;
                info!(
                    "Conflict on {}/{} (DeleteUpdate): deleted remotely, local update re-inserted",
                    collection, id
                );
                Ok(Some(ConflictRecord::new(
                    collection,
                    id,
                    ConflictKind::DeleteUpdate,
                    Resolution::Local,
                    Some(entry.payload.clone()),
                    None,
                    entry.payload.updated_at_raw().map(str::to_string),
                    None,
                )))
            }
            (SyncAction::Insert, None) | (SyncAction::Update, None) => {
                self.remote.insert(collection, entry.payload.clone()).await?;
                Ok(None)
            }
            (SyncAction::Delete, None) => Ok(None),
            (_, Some(current)) if entry.action != SyncAction::Delete && current == entry.payload => {
                // Already applied by an earlier attempt
                Ok(None)
            }
            (SyncAction::Insert, Some(current)) => self
                .resolve(entry, current, ConflictKind::InsertInsert)
                .await
                .map(Some),
            (SyncAction::Update, Some(current)) => {
                if current.updated_at_raw() == entry.base_stamp.as_deref() {
                    // Payload is the full post-write record
                    self.remote
                        .replace(collection, id, entry.payload.clone())
                        .await?;
                    Ok(None)
                } else {
                    self.resolve(entry, current, ConflictKind::UpdateUpdate)
                        .await
                        .map(Some)
                }
            }
            (SyncAction::Delete, Some(current)) => {
                if current.updated_at_raw() == entry.base_stamp.as_deref() {
                    self.remote.remove(collection, id).await?;
                    Ok(None)
                } else {
                    self.resolve(entry, current, ConflictKind::DeleteUpdate)
                        .await
                        .map(Some)
                }
            }
        }
    }

    /// Last-write-wins between a queued mutation and the remote record
    async fn resolve(
        &self,
        entry: &SyncQueueEntry,
        current: Record,
        kind: ConflictKind,
    ) -> StoreResult<ConflictRecord> {
        let collection = entry.collection.as_str();
        let id = entry.record_id.as_str();
        let remote_stamp = current.updated_at_raw().map(str::to_string);
        let local_wins = current
            .updated_at()
            .map_or(true, |remote_at| entry.enqueued_at > remote_at);

        let local_stamp = match entry.action {
            SyncAction::Delete => Some(crate::record::format_timestamp(entry.enqueued_at)),
            _ => entry.payload.updated_at_raw().map(str::to_string),
        };

        let (resolution, winner, loser) = if local_wins {
            match entry.action {
                SyncAction::Delete => {
                    self.remote.remove(collection, id).await?;
                    (Resolution::Local, None, Some(current))
                }
                _ => {
                    self.remote
                        .replace(collection, id, entry.payload.clone())
                        .await?;
                    (Resolution::Local, Some(entry.payload.clone()), Some(current))
                }
            }
        } else {
            self.adopt_remote(collection, &current).await?;
            (Resolution::Remote, Some(current), Some(entry.payload.clone()))
        };

        info!(
            "Conflict on {}/{} ({:?}) resolved in favor of {:?}",
            collection, id, kind, resolution
        );

        Ok(ConflictRecord::new(
            collection,
            id,
            kind,
            resolution,
            winner,
            loser,
            local_stamp,
            remote_stamp,
        ))
    }

    async fn record_conflict(&self, conflict: ConflictRecord) -> StoreResult<()> {
        self.conflicts.lock().await.append(conflict.clone())?;
        self.events.publish(StoreEvent::Conflict(conflict));
        Ok(())
    }

    /// Write a remote winner into the primary unless newer local work is queued
    async fn adopt_remote(&self, collection: &str, remote: &Record) -> StoreResult<()> {
        let Some(id) = remote.id() else {
            return Ok(());
        };
        let later_local = self
            .queue
            .lock()
            .await
            .entries()
            .iter()
            .filter(|e| e.collection == collection && e.record_id == id)
            .count()
            > 1;
        if later_local {
            return Ok(());
        }
        self.write_local(collection, remote).await
    }

    async fn write_local(&self, collection: &str, record: &Record) -> StoreResult<()> {
        let Some(id) = record.id() else {
            return Ok(());
        };
        match self.primary.get(collection, id).await? {
            Some(local) if local == *record => {}
            Some(_) => {
                self.primary.replace(collection, id, record.clone()).await?;
            }
            None => {
                self.primary.insert(collection, record.clone()).await?;
            }
        }
        self.events.publish(StoreEvent::Pulled {
            collection: collection.to_string(),
            record_id: id.to_string(),
        });
        Ok(())
    }

    // ==== Pull ====

    /// Refresh the primary with newer remote records of one collection
    ///
    /// Returns the number of records written locally.
    pub async fn pull(&self, collection: &str) -> StoreResult<usize> {
        self.track(collection);
        let remote_records = self.remote.query(collection, &QueryOptions::new()).await?;
        let mut pulled = 0;

        for record in remote_records {
            let Some(id) = record.id() else {
                continue;
            };
            if !self.in_scope(collection, &record) {
                continue;
            }
            if self.queue.lock().await.has_entries_for(collection, id) {
                continue;
            }

            let newer = match self.primary.get(collection, id).await? {
                None => true,
                Some(local) => match (record.updated_at(), local.updated_at()) {
                    (Some(remote_at), Some(local_at)) => remote_at > local_at,
                    (Some(_), None) => true,
                    (None, _) => false,
                },
            };
            if newer {
                self.write_local(collection, &record).await?;
                pulled += 1;
            }
        }

        if pulled > 0 {
            info!("Pulled {} record(s) into '{}'", pulled, collection);
        }
        Ok(pulled)
    }

    /// Pull every tracked collection
    pub async fn pull_all(&self) -> StoreResult<usize> {
        let mut total = 0;
        for collection in self.tracked_collections() {
            total += self.pull(&collection).await?;
        }
        Ok(total)
    }
}

#[async_trait]
impl DataAdapter for CompositeAdapter {
    fn name(&self) -> &str {
        "composite"
    }

    async fn insert(&self, collection: &str, record: Record) -> StoreResult<Record> {
        let inserted = self.primary.insert(collection, record).await?;
        self.enqueue(collection, SyncAction::Insert, inserted.clone(), None)
            .await;
        Ok(inserted)
    }

    async fn update(&self, collection: &str, id: &str, changes: Record) -> StoreResult<Record> {
        let base_stamp = self
            .primary
            .get(collection, id)
            .await?
            .and_then(|r| r.updated_at_raw().map(str::to_string));
        let updated = self.primary.update(collection, id, changes).await?;
        self.enqueue(collection, SyncAction::Update, updated.clone(), base_stamp)
            .await;
        Ok(updated)
    }

    async fn replace(&self, collection: &str, id: &str, record: Record) -> StoreResult<Record> {
        let base_stamp = self
            .primary
            .get(collection, id)
            .await?
            .and_then(|r| r.updated_at_raw().map(str::to_string));
        let replaced = self.primary.replace(collection, id, record).await?;
        self.enqueue(collection, SyncAction::Update, replaced.clone(), base_stamp)
            .await;
        Ok(replaced)
    }

    async fn remove(&self, collection: &str, id: &str) -> StoreResult<()> {
        let before = self.primary.get(collection, id).await?;
        self.primary.remove(collection, id).await?;
        if let Some(before) = before {
            let base_stamp = before.updated_at_raw().map(str::to_string);
            self.enqueue(collection, SyncAction::Delete, before, base_stamp)
                .await;
        }
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Record>> {
        self.primary.get(collection, id).await
    }

    async fn query(&self, collection: &str, options: &QueryOptions) -> StoreResult<Vec<Record>> {
        self.primary.query(collection, options).await
    }

    async fn bulk_insert(
        &self,
        collection: &str,
        records: Vec<Record>,
        options: BulkOptions,
    ) -> StoreResult<Vec<BulkItemResult>> {
        let results = self.primary.bulk_insert(collection, records, options).await?;
        for record in results.iter().filter_map(|r| r.record.as_ref()) {
            self.enqueue(collection, SyncAction::Insert, record.clone(), None)
                .await;
        }
        Ok(results)
    }

    async fn bulk_update(
        &self,
        collection: &str,
        updates: Vec<BulkUpdate>,
        options: BulkOptions,
    ) -> StoreResult<Vec<BulkItemResult>> {
        let mut base_stamps = Vec::with_capacity(updates.len());
        for update in &updates {
            base_stamps.push(
                self.primary
                    .get(collection, &update.id)
                    .await?
                    .and_then(|r| r.updated_at_raw().map(str::to_string)),
            );
        }

        let results = self.primary.bulk_update(collection, updates, options).await?;
        for result in &results {
            if let Some(ref record) = result.record {
                let base = base_stamps.get(result.index).cloned().flatten();
                self.enqueue(collection, SyncAction::Update, record.clone(), base)
                    .await;
            }
        }
        Ok(results)
    }

    async fn aggregate(
        &self,
        collection: &str,
        options: &AggregateOptions,
    ) -> StoreResult<AggregateResult> {
        self.primary.aggregate(collection, options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::LocalStorageAdapter;
    use crate::storage::MemoryStorage;
    use crate::testing::{record, FlakyAdapter};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    struct Harness {
        composite: CompositeAdapter,
        remote: Arc<FlakyAdapter>,
    }

    fn local() -> SharedAdapter {
        Arc::new(LocalStorageAdapter::new(Arc::new(MemoryStorage::new())))
    }

    fn harness() -> Harness {
        let remote = Arc::new(FlakyAdapter::new());
        let composite = CompositeAdapter::new(local(), remote.clone(), EventBus::new());
        Harness { composite, remote }
    }

    fn composite_on(remote: Arc<FlakyAdapter>) -> CompositeAdapter {
        CompositeAdapter::new(local(), remote, EventBus::new())
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_offline_write_queues_then_drains() {
        let remote = Arc::new(FlakyAdapter::new());
        let composite = composite_on(remote.clone()).with_policy(fast_policy(5));
        remote.set_online(false);

        let inserted = composite
            .insert("entity", record(json!({"name": "Acme", "type": "company"})))
            .await
            .unwrap();
        let id = inserted.id().unwrap().to_string();

        // Primary updated, exactly one entry queued
        assert_eq!(composite.get("entity", &id).await.unwrap(), Some(inserted.clone()));
        assert_eq!(composite.queue_entries().await.len(), 1);

        let report = composite.drain().await.unwrap();
        assert_eq!(report.retried, 1);
        assert_eq!(composite.pending_count().await, 1);

        remote.set_online(true);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let report = composite.drain().await.unwrap();
        assert_eq!(report.synced, 1);
        assert!(composite.queue_entries().await.is_empty());
        assert_eq!(remote.inner().get("entity", &id).await.unwrap(), Some(inserted));
    }

    #[tokio::test]
    async fn test_transient_failure_backs_off() {
        let h = harness();
        let mut events = h.composite.events().subscribe();
        h.remote.set_online(false);

        h.composite
            .insert("job", record(json!({"id": "j1", "name": "Deck"})))
            .await
            .unwrap();

        let first = h.composite.drain().await.unwrap();
        assert_eq!(first.retried, 1);
        match events.recv().await.unwrap() {
            StoreEvent::RetryScheduled { attempts, .. } => assert_eq!(attempts, 1),
            other => panic!("unexpected event: {other:?}"),
        }

        // Not due yet: deferred, no new attempt
        let calls = h.remote.calls();
        let second = h.composite.drain().await.unwrap();
        assert_eq!(second.deferred, 1);
        assert_eq!(h.remote.calls(), calls);
    }

    #[tokio::test]
    async fn test_exhausted_entry_is_parked_and_reported() {
        let remote = Arc::new(FlakyAdapter::new());
        let composite = composite_on(remote.clone()).with_policy(fast_policy(1));
        let mut events = composite.events().subscribe();
        remote.set_online(false);

        composite
            .insert("job", record(json!({"id": "j1"})))
            .await
            .unwrap();
        let report = composite.drain().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(composite.failed_count().await, 1);
        match events.recv().await.unwrap() {
            StoreEvent::SyncFailed { entry, .. } => assert_eq!(entry.record_id, "j1"),
            other => panic!("unexpected event: {other:?}"),
        }

        // Parked entries are kept until retried
        remote.set_online(true);
        assert_eq!(composite.drain().await.unwrap().synced, 0);
        assert_eq!(composite.retry_failed().await.unwrap(), 1);
        assert_eq!(composite.drain().await.unwrap().synced, 1);
        assert!(remote.inner().get("job", "j1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_per_record_fifo() {
        let h = harness();
        h.composite
            .insert("job", record(json!({"id": "j1", "status": "bid"})))
            .await
            .unwrap();
        h.composite
            .update("job", "j1", record(json!({"status": "active"})))
            .await
            .unwrap();
        h.composite
            .update("job", "j1", record(json!({"status": "complete"})))
            .await
            .unwrap();
        assert_eq!(h.composite.queue_entries().await.len(), 3);

        let report = h.composite.drain().await.unwrap();
        assert_eq!(report.synced, 3);
        assert_eq!(report.conflicts, 0);

        let local = h.composite.get("job", "j1").await.unwrap().unwrap();
        let remote = h.remote.inner().get("job", "j1").await.unwrap().unwrap();
        assert_eq!(remote, local);
        assert_eq!(remote.get("status"), Some(&json!("complete")));
    }

    #[tokio::test]
    async fn test_rapid_updates_drain_without_conflicts() {
        let h = harness();
        h.composite
            .insert("job", record(json!({"id": "j1", "n": 0})))
            .await
            .unwrap();
        for n in 1..50 {
            h.composite
                .update("job", "j1", record(json!({"n": n})))
                .await
                .unwrap();
        }

        let report = h.composite.drain().await.unwrap();
        assert_eq!(report.synced, 50);
        assert_eq!(report.conflicts, 0);

        let local = h.composite.get("job", "j1").await.unwrap().unwrap();
        let remote = h.remote.inner().get("job", "j1").await.unwrap().unwrap();
        assert_eq!(remote, local);
    }

    #[tokio::test]
    async fn test_remove_propagates() {
        let h = harness();
        h.composite
            .insert("job", record(json!({"id": "j1"})))
            .await
            .unwrap();
        h.composite.drain().await.unwrap();

        h.composite.remove("job", "j1").await.unwrap();
        // Removing an absent id queues nothing
        h.composite.remove("job", "j1").await.unwrap();
        assert_eq!(h.composite.queue_entries().await.len(), 1);

        h.composite.drain().await.unwrap();
        assert!(h.remote.inner().get("job", "j1").await.unwrap().is_none());
    }

    async fn seed(composites: &[&CompositeAdapter], remote: &FlakyAdapter) {
        let base = record(json!({
            "id": "j1",
            "name": "base",
            "updatedAt": "2024-01-01T00:00:00.000Z"
        }));
        remote.inner().insert("job", base.clone()).await.unwrap();
        for composite in composites {
            composite.primary().insert("job", base.clone()).await.unwrap();
        }
    }

    async fn write(composite: &CompositeAdapter, name: &str, stamp: &str) {
        composite
            .update("job", "j1", record(json!({"name": name, "updatedAt": stamp})))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_conflict_later_write_wins_when_drained_last() {
        let remote = Arc::new(FlakyAdapter::new());
        let a = composite_on(remote.clone());
        let b = composite_on(remote.clone());
        seed(&[&a, &b], &remote).await;

        write(&a, "T1", "2024-02-01T00:00:00.000Z").await;
        write(&b, "T2", "2024-03-01T00:00:00.000Z").await;

        a.drain().await.unwrap();
        let report = b.drain().await.unwrap();
        assert_eq!(report.conflicts, 1);

        let on_remote = remote.inner().get("job", "j1").await.unwrap().unwrap();
        assert_eq!(on_remote.get("name"), Some(&json!("T2")));

        let log = b.conflicts().await;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].resolution, Resolution::Local);
        assert_eq!(log[0].kind, ConflictKind::UpdateUpdate);
        let loser = log[0].loser.as_ref().unwrap();
        assert_eq!(loser.get("name"), Some(&json!("T1")));
    }

    #[tokio::test]
    async fn test_conflict_later_write_wins_when_drained_first() {
        let remote = Arc::new(FlakyAdapter::new());
        let a = composite_on(remote.clone());
        let b = composite_on(remote.clone());
        seed(&[&a, &b], &remote).await;
        let mut events = a.events().subscribe();

        write(&a, "T1", "2024-02-01T00:00:00.000Z").await;
        write(&b, "T2", "2024-03-01T00:00:00.000Z").await;

        b.drain().await.unwrap();
        a.drain().await.unwrap();

        let on_remote = remote.inner().get("job", "j1").await.unwrap().unwrap();
        assert_eq!(on_remote.get("name"), Some(&json!("T2")));

        let log = a.conflicts().await;
        assert_eq!(log[0].resolution, Resolution::Remote);
        assert_eq!(
            log[0].loser.as_ref().and_then(|r| r.get("name")),
            Some(&json!("T1"))
        );

        // Remote winner adopted locally
        let local = a.get("job", "j1").await.unwrap().unwrap();
        assert_eq!(local.get("name"), Some(&json!("T2")));

        let mut saw_conflict = false;
        while let Ok(event) = events.try_recv() {
            if let StoreEvent::Conflict(c) = event {
                saw_conflict = c.record_id == "j1";
            }
        }
        assert!(saw_conflict);
    }

    #[tokio::test]
    async fn test_local_winner_replaces_remote_record() {
        let remote = Arc::new(FlakyAdapter::new());
        let b = composite_on(remote.clone());
        seed(&[&b], &remote).await;

        // Another client adds a field b never saw
        remote
            .inner()
            .update(
                "job",
                "j1",
                record(json!({"note": "other", "updatedAt": "2024-02-01T00:00:00.000Z"})),
            )
            .await
            .unwrap();
        write(&b, "T2", "2024-03-01T00:00:00.000Z").await;

        assert_eq!(b.drain().await.unwrap().conflicts, 1);

        let local = b.get("job", "j1").await.unwrap().unwrap();
        let on_remote = remote.inner().get("job", "j1").await.unwrap().unwrap();
        assert_eq!(on_remote, local);
        assert!(on_remote.get("note").is_none());
    }

    #[tokio::test]
    async fn test_remote_winner_replaces_local_record() {
        let remote = Arc::new(FlakyAdapter::new());
        let a = composite_on(remote.clone());
        seed(&[&a], &remote).await;

        remote
            .inner()
            .update(
                "job",
                "j1",
                record(json!({"name": "remote", "updatedAt": "2999-01-01T00:00:00.000Z"})),
            )
            .await
            .unwrap();
        a.update("job", "j1", record(json!({"name": "local", "draft": true})))
            .await
            .unwrap();

        a.drain().await.unwrap();
        assert_eq!(a.conflicts().await[0].resolution, Resolution::Remote);

        let local = a.get("job", "j1").await.unwrap().unwrap();
        let on_remote = remote.inner().get("job", "j1").await.unwrap().unwrap();
        assert_eq!(local, on_remote);
        assert!(local.get("draft").is_none());
    }

    #[tokio::test]
    async fn test_update_of_remotely_deleted_record_is_conflict() {
        let remote = Arc::new(FlakyAdapter::new());
        let a = composite_on(remote.clone());
        seed(&[&a], &remote).await;
        let mut events = a.events().subscribe();

        remote.inner().remove("job", "j1").await.unwrap();
        write(&a, "edited", "2024-02-01T00:00:00.000Z").await;

        let report = a.drain().await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(report.conflicts, 1);

        let log = a.conflicts().await;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].kind, ConflictKind::DeleteUpdate);
        assert_eq!(log[0].resolution, Resolution::Local);
        assert!(log[0].loser.is_none());
        assert!(log[0].remote_stamp.is_none());

        let on_remote = remote.inner().get("job", "j1").await.unwrap().unwrap();
        assert_eq!(on_remote.get("name"), Some(&json!("edited")));

        let mut saw_conflict = false;
        while let Ok(event) = events.try_recv() {
            if let StoreEvent::Conflict(c) = event {
                saw_conflict = c.kind == ConflictKind::DeleteUpdate;
            }
        }
        assert!(saw_conflict);
    }

    #[tokio::test]
    async fn test_delete_racing_newer_remote_update() {
        let remote = Arc::new(FlakyAdapter::new());
        let a = composite_on(remote.clone());
        seed(&[&a], &remote).await;

        // Another client updated the record with a stamp after our delete
        remote
            .inner()
            .update(
                "job",
                "j1",
                record(json!({"name": "remote", "updatedAt": "2999-01-01T00:00:00.000Z"})),
            )
            .await
            .unwrap();

        a.remove("job", "j1").await.unwrap();
        let report = a.drain().await.unwrap();
        assert_eq!(report.conflicts, 1);

        let log = a.conflicts().await;
        assert_eq!(log[0].kind, ConflictKind::DeleteUpdate);
        assert_eq!(log[0].resolution, Resolution::Remote);
        // Remote kept its record and it is restored locally
        assert!(remote.inner().get("job", "j1").await.unwrap().is_some());
        let restored = a.get("job", "j1").await.unwrap().unwrap();
        assert_eq!(restored.get("name"), Some(&json!("remote")));
    }

    #[tokio::test]
    async fn test_delete_wins_over_older_remote_update() {
        let remote = Arc::new(FlakyAdapter::new());
        let a = composite_on(remote.clone());
        seed(&[&a], &remote).await;

        remote
            .inner()
            .update(
                "job",
                "j1",
                record(json!({"name": "remote", "updatedAt": "2024-06-01T00:00:00.000Z"})),
            )
            .await
            .unwrap();

        a.remove("job", "j1").await.unwrap();
        a.drain().await.unwrap();

        let log = a.conflicts().await;
        assert_eq!(log[0].resolution, Resolution::Local);
        assert!(log[0].winner.is_none());
        assert!(remote.inner().get("job", "j1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_selective_sync_scope() {
        let h = harness();
        h.composite
            .add_rule(SelectiveSyncRule::new("u1", "job", "entityId", "e1"))
            .unwrap();
        h.composite.set_active_user(Some("u1".to_string()));

        h.composite
            .insert("job", record(json!({"id": "in", "entityId": "e1"})))
            .await
            .unwrap();
        h.composite
            .insert("job", record(json!({"id": "out", "entityId": "e2"})))
            .await
            .unwrap();

        // Both written locally, only one queued
        assert!(h.composite.get("job", "out").await.unwrap().is_some());
        let queued = h.composite.queue_entries().await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].record_id, "in");

        // Pull ignores remote records outside the scope
        for (id, entity) in [("r1", "e1"), ("r2", "e2")] {
            h.remote
                .inner()
                .insert("job", record(json!({"id": id, "entityId": entity})))
                .await
                .unwrap();
        }
        assert_eq!(h.composite.pull("job").await.unwrap(), 1);
        assert!(h.composite.get("job", "r1").await.unwrap().is_some());
        assert!(h.composite.get("job", "r2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pull_writes_only_newer_and_skips_pending() {
        let h = harness();
        h.composite.primary()
            .insert(
                "job",
                record(json!({"id": "old", "name": "local", "updatedAt": "2024-05-01T00:00:00.000Z"})),
            )
            .await
            .unwrap();
        h.remote
            .inner()
            .insert(
                "job",
                record(json!({"id": "old", "name": "stale", "updatedAt": "2024-01-01T00:00:00.000Z"})),
            )
            .await
            .unwrap();
        h.remote
            .inner()
            .insert(
                "job",
                record(json!({"id": "busy", "name": "remote", "updatedAt": "2999-01-01T00:00:00.000Z"})),
            )
            .await
            .unwrap();

        // Pending local work on "busy" blocks the pull for that key
        h.remote.set_online(false);
        h.composite
            .insert("job", record(json!({"id": "busy", "name": "mine"})))
            .await
            .unwrap();
        h.remote.set_online(true);

        assert_eq!(h.composite.pull_all().await.unwrap(), 0);
        let old = h.composite.get("job", "old").await.unwrap().unwrap();
        assert_eq!(old.get("name"), Some(&json!("local")));
        let busy = h.composite.get("job", "busy").await.unwrap().unwrap();
        assert_eq!(busy.get("name"), Some(&json!("mine")));
    }

    #[tokio::test]
    async fn test_queue_survives_restart() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("sync_queue.json");
        let remote = Arc::new(FlakyAdapter::new());
        remote.set_online(false);
        let primary = local();

        {
            let composite = CompositeAdapter::new(primary.clone(), remote.clone(), EventBus::new())
                .with_queue(SyncQueue::with_path(path.clone()).unwrap());
            composite
                .insert("job", record(json!({"id": "j1"})))
                .await
                .unwrap();
            composite.persist().await.unwrap();
        }

        remote.set_online(true);
        let composite = CompositeAdapter::new(primary, remote.clone(), EventBus::new())
            .with_queue(SyncQueue::with_path(path).unwrap());
        assert_eq!(composite.pending_count().await, 1);
        assert_eq!(composite.drain().await.unwrap().synced, 1);
        assert!(remote.inner().get("job", "j1").await.unwrap().is_some());
    }
}
