//! IndexedDb adapter
//!
//! Transactional object stores on SQLite. Each collection is an object
//! store; each record is one JSON document row. Every adapter call runs as a
//! single transaction on a blocking thread, and calls are serialized through
//! an async mutex around the connection, so a write to a record is never
//! observed half-applied and concurrent writes to one id resolve as
//! last-write-wins.
//!
//! Storage location: `<data_dir>/ledger.db` (configurable via `Config`)

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tokio::sync::Mutex;
use tracing::debug;

use super::{
    duplicate_id, merge_update, prepare_insert, prepare_replace, BulkItemResult, BulkMode, BulkOptions, BulkUpdate,
    DataAdapter,
};
use crate::error::{StoreError, StoreResult};
use crate::query::{aggregate_records, execute_query, AggregateOptions, AggregateResult, QueryOptions};
use crate::record::{format_timestamp, Record};
use crate::storage::{init_schema, needs_init};

/// SQLite-backed object-store adapter
pub struct IndexedDbAdapter {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl IndexedDbAdapter {
    /// Open (or create) a database file
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::from_io(e, parent.to_path_buf()))?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn, Some(path.to_path_buf()))
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?, None)
    }

    fn from_connection(conn: Connection, path: Option<PathBuf>) -> StoreResult<Self> {
        if needs_init(&conn) {
            init_schema(&conn)?;
        }
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// Database file, if file-backed
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Names of all object stores
    pub async fn object_stores(&self) -> StoreResult<Vec<String>> {
        self.with_tx(|tx| {
            let mut stmt = tx.prepare("SELECT name FROM object_stores ORDER BY name")?;
            let names = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(names)
        })
        .await
    }

    /// Run `f` inside one transaction on a blocking thread
    ///
    /// The transaction commits when `f` returns `Ok` and rolls back otherwise.
    async fn with_tx<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Transaction<'_>) -> StoreResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || -> StoreResult<T> {
            let mut guard = conn.blocking_lock();
            let tx = guard.transaction()?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
        .await
        .map_err(|e| StoreError::Storage(format!("database task failed: {}", e)))?
    }
}

fn ensure_store(tx: &Transaction<'_>, store: &str) -> StoreResult<()> {
    tx.execute(
        "INSERT OR IGNORE INTO object_stores (name, created_at) VALUES (?1, ?2)",
        params![store, format_timestamp(Utc::now())],
    )?;
    Ok(())
}

fn get_row(tx: &Transaction<'_>, store: &str, id: &str) -> StoreResult<Option<Record>> {
    let data: Option<String> = tx
        .query_row(
            "SELECT data FROM records WHERE store = ?1 AND id = ?2",
            params![store, id],
            |row| row.get(0),
        )
        .optional()?;
    match data {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

fn load_store(tx: &Transaction<'_>, store: &str) -> StoreResult<Vec<Record>> {
    let mut stmt = tx.prepare("SELECT data FROM records WHERE store = ?1 ORDER BY rowid")?;
    let rows = stmt
        .query_map(params![store], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    rows.iter()
        .map(|json| serde_json::from_str(json).map_err(StoreError::from))
        .collect()
}

fn insert_row(tx: &Transaction<'_>, store: &str, record: Record) -> StoreResult<Record> {
    let record = prepare_insert(record);
    let id = record.id().unwrap_or_default().to_string();
    if get_row(tx, store, &id)?.is_some() {
        return Err(duplicate_id(store, &id));
    }
    tx.execute(
        "INSERT INTO records (store, id, data) VALUES (?1, ?2, ?3)",
        params![store, id, serde_json::to_string(&record)?],
    )?;
    Ok(record)
}

fn update_row(
    tx: &Transaction<'_>,
    store: &str,
    id: &str,
    changes: &Record,
) -> StoreResult<Record> {
    let existing = get_row(tx, store, id)?.ok_or_else(|| StoreError::not_found(store, id))?;
    let merged = merge_update(&existing, changes);
    tx.execute(
        "UPDATE records SET data = ?3 WHERE store = ?1 AND id = ?2",
        params![store, id, serde_json::to_string(&merged)?],
    )?;
    Ok(merged)
}

#[async_trait]
impl DataAdapter for IndexedDbAdapter {
    fn name(&self) -> &str {
        "indexed_db"
    }

    async fn insert(&self, collection: &str, record: Record) -> StoreResult<Record> {
        let store = collection.to_string();
        let inserted = self
            .with_tx(move |tx| {
                ensure_store(tx, &store)?;
                insert_row(tx, &store, record)
            })
            .await?;
        debug!("Inserted {}/{}", collection, inserted.id().unwrap_or_default());
        Ok(inserted)
    }

    async fn update(&self, collection: &str, id: &str, changes: Record) -> StoreResult<Record> {
        let store = collection.to_string();
        let id = id.to_string();
        self.with_tx(move |tx| update_row(tx, &store, &id, &changes))
            .await
    }

    async fn replace(&self, collection: &str, id: &str, record: Record) -> StoreResult<Record> {
        let store = collection.to_string();
        let id = id.to_string();
        self.with_tx(move |tx| {
            let existing =
                get_row(tx, &store, &id)?.ok_or_else(|| StoreError::not_found(&store, &id))?;
            let replaced = prepare_replace(&existing, record);
            tx.execute(
                "UPDATE records SET data = ?3 WHERE store = ?1 AND id = ?2",
                params![store, id, serde_json::to_string(&replaced)?],
            )?;
            Ok(replaced)
        })
        .await
    }

    async fn remove(&self, collection: &str, id: &str) -> StoreResult<()> {
        let store = collection.to_string();
        let id = id.to_string();
        self.with_tx(move |tx| {
            tx.execute(
                "DELETE FROM records WHERE store = ?1 AND id = ?2",
                params![store, id],
            )?;
            Ok(())
        })
        .await
    }

    async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Record>> {
        let store = collection.to_string();
        let id = id.to_string();
        self.with_tx(move |tx| get_row(tx, &store, &id)).await
    }

    async fn query(&self, collection: &str, options: &QueryOptions) -> StoreResult<Vec<Record>> {
        let store = collection.to_string();
        let records = self.with_tx(move |tx| load_store(tx, &store)).await?;
        Ok(execute_query(records, options))
    }

    async fn bulk_insert(
        &self,
        collection: &str,
        items: Vec<Record>,
        options: BulkOptions,
    ) -> StoreResult<Vec<BulkItemResult>> {
        let store = collection.to_string();
        self.with_tx(move |tx| {
            ensure_store(tx, &store)?;
            let mut results = Vec::with_capacity(items.len());
            for (index, item) in items.into_iter().enumerate() {
                let id = item.id().map(str::to_string);
                match insert_row(tx, &store, item) {
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
            Ok(results)
        })
        .await
    }

    async fn bulk_update(
        &self,
        collection: &str,
        updates: Vec<BulkUpdate>,
        options: BulkOptions,
    ) -> StoreResult<Vec<BulkItemResult>> {
        let store = collection.to_string();
        self.with_tx(move |tx| {
            let mut results = Vec::with_capacity(updates.len());
            for (index, update) in updates.into_iter().enumerate() {
                match update_row(tx, &store, &update.id, &update.changes) {
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
            Ok(results)
        })
        .await
    }

    async fn aggregate(
        &self,
        collection: &str,
        options: &AggregateOptions,
    ) -> StoreResult<AggregateResult> {
        let store = collection.to_string();
        let records = self.with_tx(move |tx| load_store(tx, &store)).await?;
        Ok(aggregate_records(&records, options))
    }
}
