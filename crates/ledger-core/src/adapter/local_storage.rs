//! LocalStorage adapter
//!
//! Keeps each collection as one JSON array under the key
//! `<prefix>:<collection>` of a `KeyValueStorage`. Every operation reads the
//! whole dataset and every mutation writes it back; a write that would
//! exceed the storage quota fails with `StorageFull` and leaves the stored
//! dataset as it was.
//!
//! Mutations are serialized by an async mutex so read-modify-write cycles
//! never interleave.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::{
    duplicate_id, merge_update, prepare_insert, prepare_replace, BulkItemResult, BulkMode, BulkOptions, BulkUpdate,
    DataAdapter,
};
use crate::error::{StoreError, StoreResult};
use crate::query::{aggregate_records, execute_query, AggregateOptions, AggregateResult, QueryOptions};
use crate::record::Record;
use crate::storage::KeyValueStorage;

/// Default key prefix
pub const DEFAULT_PREFIX: &str = "ledger";

/// Adapter over a key-value store
pub struct LocalStorageAdapter {
    storage: Arc<dyn KeyValueStorage>,
    prefix: String,
    lock: Mutex<()>,
}

impl LocalStorageAdapter {
    pub fn new(storage: Arc<dyn KeyValueStorage>) -> Self {
        Self::with_prefix(storage, DEFAULT_PREFIX)
    }

    pub fn with_prefix(storage: Arc<dyn KeyValueStorage>, prefix: impl Into<String>) -> Self {
        Self {
            storage,
            prefix: prefix.into(),
            lock: Mutex::new(()),
        }
    }

    fn key(&self, collection: &str) -> String {
        format!("{}:{}", self.prefix, collection)
    }

    fn load(&self, collection: &str) -> StoreResult<Vec<Record>> {
        match self.storage.get_item(&self.key(collection))? {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Vec::new()),
        }
    }

    fn save(&self, collection: &str, records: &[Record]) -> StoreResult<()> {
        let json = serde_json::to_string(records)?;
        self.storage.set_item(&self.key(collection), &json)
    }

    fn position(records: &[Record], id: &str) -> Option<usize> {
        records.iter().position(|r| r.id() == Some(id))
    }

    fn insert_into(collection: &str, records: &mut Vec<Record>, record: Record) -> StoreResult<Record> {
        let record = prepare_insert(record);
        let id = record.id().unwrap_or_default();
        if Self::position(records, id).is_some() {
            return Err(duplicate_id(collection, id));
        }
        records.push(record.clone());
        Ok(record)
    }

    fn update_in(
        collection: &str,
        records: &mut [Record],
        id: &str,
        changes: &Record,
    ) -> StoreResult<Record> {
        let index = Self::position(records, id)
            .ok_or_else(|| StoreError::not_found(collection, id))?;
        let merged = merge_update(&records[index], changes);
        records[index] = merged.clone();
        Ok(merged)
    }
}

#[async_trait]
impl DataAdapter for LocalStorageAdapter {
    fn name(&self) -> &str {
        "local_storage"
    }

    async fn insert(&self, collection: &str, record: Record) -> StoreResult<Record> {
        let _guard = self.lock.lock().await;
        let mut records = self.load(collection)?;
        let inserted = Self::insert_into(collection, &mut records, record)?;
        self.save(collection, &records)?;
        debug!("Inserted {}/{}", collection, inserted.id().unwrap_or_default());
        Ok(inserted)
    }

    async fn update(&self, collection: &str, id: &str, changes: Record) -> StoreResult<Record> {
        let _guard = self.lock.lock().await;
        let mut records = self.load(collection)?;
        let updated = Self::update_in(collection, &mut records, id, &changes)?;
        self.save(collection, &records)?;
        Ok(updated)
    }

    async fn replace(&self, collection: &str, id: &str, record: Record) -> StoreResult<Record> {
        let _guard = self.lock.lock().await;
        let mut records = self.load(collection)?;
        let index = Self::position(&records, id)
            .ok_or_else(|| StoreError::not_found(collection, id))?;
        let replaced = prepare_replace(&records[index], record);
        records[index] = replaced.clone();
        self.save(collection, &records)?;
        Ok(replaced)
    }

    async fn remove(&self, collection: &str, id: &str) -> StoreResult<()> {
        let _guard = self.lock.lock().await;
        let mut records = self.load(collection)?;
        let before = records.len();
        records.retain(|r| r.id() != Some(id));
        if records.len() != before {
            self.save(collection, &records)?;
        }
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Record>> {
        let records = self.load(collection)?;
        Ok(records.into_iter().find(|r| r.id() == Some(id)))
    }

    async fn query(&self, collection: &str, options: &QueryOptions) -> StoreResult<Vec<Record>> {
        let records = self.load(collection)?;
        Ok(execute_query(records, options))
    }

    async fn bulk_insert(
        &self,
        collection: &str,
        items: Vec<Record>,
        options: BulkOptions,
    ) -> StoreResult<Vec<BulkItemResult>> {
        let _guard = self.lock.lock().await;
        let mut records = self.load(collection)?;
        let mut results = Vec::with_capacity(items.len());

        for (index, item) in items.into_iter().enumerate() {
            let id = item.id().map(str::to_string);
            match Self::insert_into(collection, &mut records, item) {
                Ok(record) => results.push(BulkItemResult::success(index, record)),
                Err(e) if options.mode == BulkMode::AbortAll => {
                    return Err(StoreError::BulkAborted {
                        index,
                        source: Box::new(e),
                    });
                }
                Err(e) => results.push(BulkItemResult::failure(index, id, &e)),
            }
        }

        self.save(collection, &records)?;
        Ok(results)
    }

    async fn bulk_update(
        &self,
        collection: &str,
        updates: Vec<BulkUpdate>,
        options: BulkOptions,
    ) -> StoreResult<Vec<BulkItemResult>> {
        let _guard = self.lock.lock().await;
        let mut records = self.load(collection)?;
        let mut results = Vec::with_capacity(updates.len());

        for (index, update) in updates.into_iter().enumerate() {
            match Self::update_in(collection, &mut records, &update.id, &update.changes) {
                Ok(record) => results.push(BulkItemResult::success(index, record)),
                Err(e) if options.mode == BulkMode::AbortAll => {
                    return Err(StoreError::BulkAborted {
                        index,
                        source: Box::new(e),
                    });
                }
                Err(e) => results.push(BulkItemResult::failure(index, Some(update.id), &e)),
            }
        }

        self.save(collection, &records)?;
        Ok(results)
    }

    async fn aggregate(
        &self,
        collection: &str,
        options: &AggregateOptions,
    ) -> StoreResult<AggregateResult> {
        let records = self.load(collection)?;
        Ok(aggregate_records(&records, options))
    }
}
