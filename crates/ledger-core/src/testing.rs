//! Test helpers shared across modules

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::adapter::{
    BulkItemResult, BulkOptions, BulkUpdate, DataAdapter, LocalStorageAdapter,
};
use crate::error::{StoreError, StoreResult};
use crate::query::{AggregateOptions, AggregateResult, QueryOptions};
use crate::record::Record;
use crate::storage::MemoryStorage;

/// Build a record from a JSON object literal
pub(crate) fn record(value: Value) -> Record {
    Record::from_value(value).unwrap()
}

/// In-memory adapter that can be switched offline
///
/// Every call while offline fails with `StoreError::Network`.
pub(crate) struct FlakyAdapter {
    inner: LocalStorageAdapter,
    online: AtomicBool,
    calls: AtomicUsize,
}

impl FlakyAdapter {
    pub(crate) fn new() -> Self {
        Self {
            inner: LocalStorageAdapter::new(Arc::new(MemoryStorage::new())),
            online: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Calls made through the adapter interface, online or not
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Backing store, reachable regardless of the online flag
    pub(crate) fn inner(&self) -> &LocalStorageAdapter {
        &self.inner
    }

    fn check(&self) -> StoreResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Network("remote unreachable".to_string()))
        }
    }
}

#[async_trait]
impl DataAdapter for FlakyAdapter {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn insert(&self, collection: &str, record: Record) -> StoreResult<Record> {
        self.check()?;
        self.inner.insert(collection, record).await
    }

    async fn update(&self, collection: &str, id: &str, changes: Record) -> StoreResult<Record> {
        self.check()?;
        self.inner.update(collection, id, changes).await
    }

    async fn replace(&self, collection: &str, id: &str, record: Record) -> StoreResult<Record> {
        self.check()?;
        self.inner.replace(collection, id, record).await
    }

    async fn remove(&self, collection: &str, id: &str) -> StoreResult<()> {
        self.check()?;
        self.inner.remove(collection, id).await
    }

    async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Record>> {
        self.check()?;
        self.inner.get(collection, id).await
    }

    async fn query(&self, collection: &str, options: &QueryOptions) -> StoreResult<Vec<Record>> {
        self.check()?;
        self.inner.query(collection, options).await
    }

    async fn bulk_insert(
        &self,
        collection: &str,
        records: Vec<Record>,
        options: BulkOptions,
    ) -> StoreResult<Vec<BulkItemResult>> {
        self.check()?;
        self.inner.bulk_insert(collection, records, options).await
    }

    async fn bulk_update(
        &self,
        collection: &str,
        updates: Vec<BulkUpdate>,
        options: BulkOptions,
    ) -> StoreResult<Vec<BulkItemResult>> {
        self.check()?;
        self.inner.bulk_update(collection, updates, options).await
    }

    async fn aggregate(
        &self,
        collection: &str,
        options: &AggregateOptions,
    ) -> StoreResult<AggregateResult> {
        self.check()?;
        self.inner.aggregate(collection, options).await
    }
}
