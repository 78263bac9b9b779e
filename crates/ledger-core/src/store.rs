//! Store context
//!
//! The `Store` is the one object an application constructs at start-up and
//! passes to its services. It owns:
//! - the configuration and schema registry
//! - the event bus
//! - the adapter stack: the local backend, optionally wrapped in a
//!   `CompositeAdapter` with an `ApiAdapter` remote
//! - the background sync task, once started
//!
//! ## Start-up migration
//!
//! On open, every registered collection whose stored records are behind
//! the schema version is migrated in place on the local backend. A
//! collection whose migration chain is broken is marked unavailable:
//! `collection()` returns the migration error for it while every other
//! collection keeps working.
//!
//! ## Usage
//!
//! ```ignore
//! let mut store = Store::open().await?;
//! store.start_sync();
//!
//! let jobs = store.collection("job")?;
//! jobs.insert(record).await?;
//!
//! store.teardown().await?;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::adapter::{
    ApiAdapter, DataAdapter, IndexedDbAdapter, LocalStorageAdapter, SharedAdapter,
};
use crate::collection::{Collection, TypedCollection};
use crate::config::{Config, LocalBackend};
use crate::error::{StoreError, StoreResult};
use crate::events::{EventBus, StoreEvent};
use crate::models::Model;
use crate::query::QueryOptions;
use crate::record::Record;
use crate::schema::SchemaRegistry;
use crate::storage::FileStorage;
use crate::sync::{
    spawn_sync_task, CompositeAdapter, ConflictLog, ConnectionStatus, DrainReport, SyncQueue,
    SyncRules, SyncTaskHandle,
};

/// Why a collection cannot be used
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unavailable {
    /// A migration step is missing
    MissingMigration { from: u32, to: u32 },
    /// A migration step failed on a record
    MigrationFailed { id: String, from: u32, details: String },
    /// Stored records could not be read or rewritten
    Storage(String),
}

impl Unavailable {
    fn from_error(error: &StoreError) -> Self {
        match error {
            StoreError::MigrationConfig { from, to, .. } => Unavailable::MissingMigration {
                from: *from,
                to: *to,
            },
            StoreError::MigrationFailed {
                id, from, details, ..
            } => Unavailable::MigrationFailed {
                id: id.clone(),
                from: *from,
                details: details.clone(),
            },
            other => Unavailable::Storage(other.to_string()),
        }
    }

    fn to_error(&self, collection: &str) -> StoreError {
        match self {
            Unavailable::MissingMigration { from, to } => StoreError::MigrationConfig {
                collection: collection.to_string(),
                from: *from,
                to: *to,
            },
            Unavailable::MigrationFailed { id, from, details } => StoreError::MigrationFailed {
                collection: collection.to_string(),
                id: id.clone(),
                from: *from,
                details: details.clone(),
            },
            Unavailable::Storage(details) => StoreError::Storage(details.clone()),
        }
    }
}

/// Outcome of a manual sync
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub drain: DrainReport,
    pub pulled: usize,
}

/// Explicit store context
pub struct Store {
    config: Config,
    registry: Arc<SchemaRegistry>,
    events: EventBus,
    local: SharedAdapter,
    adapter: SharedAdapter,
    composite: Option<Arc<CompositeAdapter>>,
    sync_task: Option<SyncTaskHandle>,
    unavailable: BTreeMap<String, Unavailable>,
}

impl Store {
    /// Open the store using configuration from the default location
    pub async fn open() -> Result<Self> {
        let config = Config::load().context("Failed to load configuration")?;
        Self::open_with_config(config).await
    }

    /// Open the store with a specific configuration
    ///
    /// Builds the local backend, and the composite sync stack when sync is
    /// enabled and a remote URL is configured. The background sync task is
    /// not started; see `start_sync`.
    pub async fn open_with_config(config: Config) -> Result<Self> {
        let registry = SchemaRegistry::with_builtin().context("Failed to install built-in schemas")?;

        let local: SharedAdapter = match config.local_backend {
            LocalBackend::LocalStorage => {
                let storage = FileStorage::new(config.local_storage_dir())
                    .with_quota(config.storage_quota_bytes);
                Arc::new(LocalStorageAdapter::new(Arc::new(storage)))
            }
            LocalBackend::IndexedDb => Arc::new(
                IndexedDbAdapter::open(config.indexed_db_path())
                    .context("Failed to open local database")?,
            ),
        };

        let remote: Option<SharedAdapter> = match (&config.remote_url, config.sync_enabled) {
            (Some(url), true) => Some(Arc::new(
                ApiAdapter::with_timeout(url.as_str(), config.sync.request_timeout())
                    .context("Failed to create remote adapter")?,
            )),
            (None, true) => {
                warn!("Sync is enabled but no remote_url is configured; running local only");
                None
            }
            _ => None,
        };

        Self::open_with_parts(config, registry, local, remote).await
    }

    /// Open the store from explicit parts
    ///
    /// Queue, conflict log and sync rules are persisted under the
    /// configured data directory.
    pub async fn open_with_parts(
        config: Config,
        registry: SchemaRegistry,
        local: SharedAdapter,
        remote: Option<SharedAdapter>,
    ) -> Result<Self> {
        let registry = Arc::new(registry);
        let events = EventBus::new();

        let composite = match remote {
            Some(remote) => {
                let composite = CompositeAdapter::new(local.clone(), remote, events.clone())
                    .with_queue(
                        SyncQueue::with_path(config.sync_queue_path())
                            .context("Failed to load sync queue")?,
                    )
                    .with_conflict_log(
                        ConflictLog::with_path(config.conflict_log_path())
                            .context("Failed to load conflict log")?,
                    )
                    .with_rules(
                        SyncRules::with_path(config.sync_rules_path())
                            .context("Failed to load sync rules")?,
                    )
                    .with_policy(config.sync.retry_policy())
                    .with_active_user(config.user_id.clone());
                composite.track_collections(registry.collections());
                Some(Arc::new(composite))
            }
            None => None,
        };

        let adapter: SharedAdapter = match composite {
            Some(ref composite) => composite.clone(),
            None => local.clone(),
        };

        let mut unavailable = BTreeMap::new();
        for name in registry.collections() {
            match migrate_collection(&registry, local.as_ref(), &name).await {
                Ok(0) => {}
                Ok(count) => info!("Migrated {} record(s) in '{}'", count, name),
                Err(e) => {
                    warn!("Collection '{}' is unavailable: {}", name, e);
                    unavailable.insert(name, Unavailable::from_error(&e));
                }
            }
        }

        info!(
            "Store opened ({} backend{})",
            local.name(),
            if composite.is_some() { ", sync enabled" } else { "" }
        );

        Ok(Self {
            config,
            registry,
            events,
            local,
            adapter,
            composite,
            sync_task: None,
            unavailable,
        })
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Subscribe to store events
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Adapter collections write through (composite when syncing)
    pub fn adapter(&self) -> &SharedAdapter {
        &self.adapter
    }

    /// Local backend
    pub fn local_adapter(&self) -> &SharedAdapter {
        &self.local
    }

    /// Sync engine, when sync is configured
    pub fn composite(&self) -> Option<&Arc<CompositeAdapter>> {
        self.composite.as_ref()
    }

    /// Collections that failed start-up migration
    pub fn unavailable(&self) -> &BTreeMap<String, Unavailable> {
        &self.unavailable
    }

    /// Get a collection by name
    pub fn collection(&self, name: &str) -> StoreResult<Collection> {
        if let Some(reason) = self.unavailable.get(name) {
            return Err(reason.to_error(name));
        }
        Collection::new(
            name,
            self.registry.clone(),
            self.adapter.clone(),
            self.events.clone(),
        )
    }

    /// Get the typed collection of a model
    pub fn typed<T: Model>(&self) -> StoreResult<TypedCollection<T>> {
        Ok(TypedCollection::from_collection(
            self.collection(T::COLLECTION)?,
        ))
    }

    // ==================== Sync ====================

    /// Start the background sync task; returns false without a remote
    pub fn start_sync(&mut self) -> bool {
        let Some(ref composite) = self.composite else {
            return false;
        };
        if self.sync_task.is_none() {
            self.sync_task = Some(spawn_sync_task(
                composite.clone(),
                self.config.sync.task_config(),
            ));
            info!("Background sync started");
        }
        true
    }

    /// Status of the background sync task, if running
    pub fn sync_status(&self) -> Option<ConnectionStatus> {
        self.sync_task.as_ref().map(SyncTaskHandle::status)
    }

    /// Drain the queue and pull every collection now
    pub async fn sync_now(&self) -> Result<SyncSummary> {
        let composite = self
            .composite
            .as_ref()
            .context("Sync is not configured. Set remote_url and sync_enabled.")?;
        let drain = composite.drain().await.context("Failed to drain sync queue")?;
        let pulled = composite
            .pull_all()
            .await
            .context("Failed to pull remote changes")?;
        Ok(SyncSummary { drain, pulled })
    }

    /// Stop the sync task and persist the queue
    pub async fn teardown(mut self) -> Result<()> {
        if let Some(handle) = self.sync_task.take() {
            handle.shutdown().await;
        }
        if let Some(ref composite) = self.composite {
            composite
                .persist()
                .await
                .context("Failed to persist sync queue")?;
        }
        info!("Store closed");
        Ok(())
    }
}

/// Rewrite records stored behind the schema version
///
/// Returns the number of records migrated. The chain is checked before any
/// record is written, and each migrated record replaces the stored one
/// whole, so keys a migration removed are gone.
async fn migrate_collection(
    registry: &SchemaRegistry,
    local: &dyn DataAdapter,
    collection: &str,
) -> StoreResult<usize> {
    let Some(schema) = registry.get(collection) else {
        return Ok(0);
    };
    let stale: Vec<Record> = local
        .query(collection, &QueryOptions::new())
        .await?
        .into_iter()
        .filter(|r| r.version() < schema.version)
        .collect();
    if stale.is_empty() {
        return Ok(0);
    }

    let count = stale.len();
    let migrated = registry.migrate(collection, stale, 0, schema.version)?;

    for record in migrated {
        let Some(id) = record.id().map(str::to_string) else {
            continue;
        };
        local.replace(collection, &id, record).await?;
    }
    Ok(count)
}
