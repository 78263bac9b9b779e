//! Data adapters
//!
//! A `DataAdapter` is the uniform async storage contract every backend
//! implements. Collections and the sync engine hold adapters as
//! `Arc<dyn DataAdapter>` and never depend on a concrete backend.
//!
//! ## Architecture
//!
//! - **LocalStorage**: whole-dataset reads and writes on a key-value store
//! - **IndexedDb**: transactional object stores on SQLite
//! - **Api**: one HTTP request per call
//! - **Composite** (in `sync`): local primary plus remote with an offline queue
//!
//! ## Shared semantics
//!
//! - `insert` assigns a UUID when the record has no `id` and stamps
//!   `createdAt`/`updatedAt` unless supplied; inserting an existing `id`
//!   fails with `Conflict`
//! - `update` never changes `id` and fails with `NotFound` for absent ids
//! - `replace` swaps in a whole record, dropping keys the new one lacks
//! - `remove` of an absent id succeeds
//! - Filtering, sorting and aggregation all go through `crate::query`

pub mod api;
pub mod indexed_db;
pub mod local_storage;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::query::{AggregateOptions, AggregateResult, QueryOptions};
use crate::record::{keys, Record};

pub use api::ApiAdapter;
pub use indexed_db::IndexedDbAdapter;
pub use local_storage::LocalStorageAdapter;

/// Partial-failure policy for bulk operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BulkMode {
    /// First failure aborts the batch and nothing is written
    #[default]
    AbortAll,
    /// Valid items are written; failures are reported per item
    BestEffort,
}

/// Options for bulk operations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkOptions {
    pub mode: BulkMode,
}

impl BulkOptions {
    pub fn abort_all() -> Self {
        Self {
            mode: BulkMode::AbortAll,
        }
    }

    pub fn best_effort() -> Self {
        Self {
            mode: BulkMode::BestEffort,
        }
    }
}

/// One item of a bulk update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkUpdate {
    pub id: String,
    pub changes: Record,
}

impl BulkUpdate {
    pub fn new(id: impl Into<String>, changes: Record) -> Self {
        Self {
            id: id.into(),
            changes,
        }
    }
}

/// Outcome of one bulk item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkItemResult {
    /// Position in the input batch
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Stored record on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<Record>,
    /// Error message on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BulkItemResult {
    pub fn success(index: usize, record: Record) -> Self {
        Self {
            index,
            id: record.id().map(str::to_string),
            record: Some(record),
            error: None,
        }
    }

    pub fn failure(index: usize, id: Option<String>, error: &StoreError) -> Self {
        Self {
            index,
            id,
            record: None,
            error: Some(error.to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Uniform async storage contract
#[async_trait]
pub trait DataAdapter: Send + Sync {
    /// Short backend name for logs and status output
    fn name(&self) -> &str;

    /// Insert a record, assigning an ID if absent
    async fn insert(&self, collection: &str, record: Record) -> StoreResult<Record>;

    /// Merge `changes` into an existing record
    async fn update(&self, collection: &str, id: &str, changes: Record) -> StoreResult<Record>;

    /// Replace an existing record wholesale
    ///
    /// Keys absent from `record` are dropped. A supplied `updatedAt` is
    /// stored as given.
    async fn replace(&self, collection: &str, id: &str, record: Record) -> StoreResult<Record>;

    /// Delete a record; absent ids are not an error
    async fn remove(&self, collection: &str, id: &str) -> StoreResult<()>;

    /// Fetch one record
    async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Record>>;

    /// Filter, sort and paginate a collection
    async fn query(&self, collection: &str, options: &QueryOptions) -> StoreResult<Vec<Record>>;

    /// Insert many records
    async fn bulk_insert(
        &self,
        collection: &str,
        records: Vec<Record>,
        options: BulkOptions,
    ) -> StoreResult<Vec<BulkItemResult>>;

    /// Update many records
    async fn bulk_update(
        &self,
        collection: &str,
        updates: Vec<BulkUpdate>,
        options: BulkOptions,
    ) -> StoreResult<Vec<BulkItemResult>>;

    /// Compute an aggregate
    async fn aggregate(
        &self,
        collection: &str,
        options: &AggregateOptions,
    ) -> StoreResult<AggregateResult>;
}

/// Shared adapter handle
pub type SharedAdapter = Arc<dyn DataAdapter>;

/// Next `updatedAt` stamp, strictly after `previous`
///
/// Stamps are stored with millisecond precision, so the clock is truncated
/// before comparing; otherwise two writes in the same millisecond would
/// store the same stamp.
pub fn next_stamp(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    let now = now.duration_trunc(Duration::milliseconds(1)).unwrap_or(now);
    match previous {
        Some(prev) if now <= prev => prev + Duration::milliseconds(1),
        _ => now,
    }
}

/// Assign ID and timestamps to a record about to be inserted
pub fn prepare_insert(mut record: Record) -> Record {
    if record.id().map_or(true, str::is_empty) {
        record.set_id(Uuid::new_v4().to_string());
    }
    if record.updated_at().is_none() {
        record.set_updated_at(next_stamp(None));
    }
    if !record.contains(keys::CREATED_AT) {
        if let Some(stamp) = record.updated_at_raw().map(str::to_string) {
            record.set(keys::CREATED_AT, stamp);
        }
    }
    record
}

/// Merge `changes` into `existing`
///
/// A caller-supplied `updatedAt` different from the stored one is kept;
/// otherwise the stamp advances.
pub fn merge_update(existing: &Record, changes: &Record) -> Record {
    let mut merged = existing.clone();
    merged.merge(changes);

    let supplied = changes.updated_at_raw();
    if supplied.is_none() || supplied == existing.updated_at_raw() {
        merged.set_updated_at(next_stamp(existing.updated_at()));
    }
    merged
}

/// Build the record that replaces `existing`
///
/// The stored `id` wins. `createdAt` carries over when the replacement has
/// none, and `updatedAt` advances only when it is missing.
pub fn prepare_replace(existing: &Record, mut record: Record) -> Record {
    if let Some(id) = existing.id() {
        record.set_id(id);
    }
    if !record.contains(keys::CREATED_AT) {
        if let Some(created) = existing.get(keys::CREATED_AT) {
            record.set(keys::CREATED_AT, created.clone());
        }
    }
    if record.updated_at().is_none() {
        record.set_updated_at(next_stamp(existing.updated_at()));
    }
    record
}

/// Error for inserting an ID that already exists
pub(crate) fn duplicate_id(collection: &str, id: &str) -> StoreError {
    StoreError::Conflict {
        collection: collection.to_string(),
        id: id.to_string(),
        details: "a record with this id already exists".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        Record::from_value(value).unwrap()
    }

    #[test]
    fn test_prepare_insert_assigns_id_and_stamps() {
        let prepared = prepare_insert(record(json!({"name": "Acme"})));

        let id = prepared.id().unwrap();
        assert!(Uuid::parse_str(id).is_ok());
        assert!(prepared.updated_at().is_some());
        assert_eq!(
            prepared.get(keys::CREATED_AT).and_then(|v| v.as_str()),
            prepared.updated_at_raw()
        );
    }

    #[test]
    fn test_prepare_insert_keeps_supplied_values() {
        let prepared = prepare_insert(record(json!({
            "id": "e1",
            "updatedAt": "2024-03-01T10:00:00.000Z"
        })));

        assert_eq!(prepared.id(), Some("e1"));
        assert_eq!(prepared.updated_at_raw(), Some("2024-03-01T10:00:00.000Z"));
    }

    #[test]
    fn test_merge_update_advances_stamp() {
        let existing = record(json!({
            "id": "e1",
            "name": "Acme",
            "updatedAt": "2999-01-01T00:00:00.000Z"
        }));
        let merged = merge_update(&existing, &record(json!({"id": "zzz", "name": "Acme Ltd"})));

        assert_eq!(merged.id(), Some("e1"));
        assert_eq!(merged.get("name"), Some(&json!("Acme Ltd")));
        // Clock is behind the stored stamp; still strictly after it
        assert_eq!(merged.updated_at_raw(), Some("2999-01-01T00:00:00.001Z"));
    }

    #[test]
    fn test_merge_update_keeps_new_supplied_stamp() {
        let existing = record(json!({"id": "e1", "updatedAt": "2024-01-01T00:00:00.000Z"}));
        let merged = merge_update(
            &existing,
            &record(json!({"updatedAt": "2024-02-01T00:00:00.000Z"})),
        );
        assert_eq!(merged.updated_at_raw(), Some("2024-02-01T00:00:00.000Z"));

        // Echoing the stored stamp does not freeze it
        let merged = merge_update(
            &existing,
            &record(json!({"updatedAt": "2024-01-01T00:00:00.000Z"})),
        );
        assert_ne!(merged.updated_at_raw(), Some("2024-01-01T00:00:00.000Z"));
    }

    #[test]
    fn test_next_stamp_advances_within_one_millisecond() {
        use crate::record::{format_timestamp, parse_timestamp};

        let mut prev = parse_timestamp(&format_timestamp(next_stamp(None))).unwrap();
        for _ in 0..1000 {
            let next = next_stamp(Some(prev));
            let stored = format_timestamp(next);
            assert_ne!(stored, format_timestamp(prev));
            prev = parse_timestamp(&stored).unwrap();
        }
    }

    #[test]
    fn test_back_to_back_updates_store_distinct_stamps() {
        let mut current = prepare_insert(record(json!({"id": "e1", "n": 0})));
        for n in 1..200 {
            let updated = merge_update(&current, &record(json!({"n": n})));
            assert!(updated.updated_at() > current.updated_at());
            current = updated;
        }
    }

    #[test]
    fn test_prepare_replace_drops_missing_keys() {
        let existing = record(json!({
            "id": "e1",
            "name": "Acme",
            "note": "stale",
            "createdAt": "2024-01-01T00:00:00.000Z",
            "updatedAt": "2024-01-02T00:00:00.000Z"
        }));
        let replaced = prepare_replace(&existing, record(json!({"id": "zzz", "name": "Acme Ltd"})));

        assert_eq!(replaced.id(), Some("e1"));
        assert!(replaced.get("note").is_none());
        assert_eq!(
            replaced.get(keys::CREATED_AT),
            Some(&json!("2024-01-01T00:00:00.000Z"))
        );
        assert!(replaced.updated_at() > existing.updated_at());

        let exact = prepare_replace(
            &existing,
            record(json!({"name": "Acme", "updatedAt": "2024-01-03T00:00:00.000Z"})),
        );
        assert_eq!(exact.updated_at_raw(), Some("2024-01-03T00:00:00.000Z"));
    }

    #[test]
    fn test_bulk_item_result() {
        let ok = BulkItemResult::success(0, record(json!({"id": "a"})));
        assert!(ok.is_ok());
        assert_eq!(ok.id.as_deref(), Some("a"));

        let failed = BulkItemResult::failure(1, Some("b".into()), &StoreError::not_found("job", "b"));
        assert!(!failed.is_ok());
        assert!(failed.error.unwrap().contains("not found"));
    }
}
