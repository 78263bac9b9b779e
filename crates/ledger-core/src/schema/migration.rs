//! Versioned record migrations
//!
//! Each collection has a linear chain of steps, one per version bump. Going
//! from version `v` to `v + 2` applies the `v → v+1` step and then the
//! `v+1 → v+2` step, threading the record through each.
//!
//! Steps are pure functions over a single record. The engine stamps the new
//! version after each step, so a step only has to reshape the data. A record
//! whose stamp is already at the target version is returned unchanged.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::record::Record;

type TransformFn = dyn Fn(Record) -> anyhow::Result<Record> + Send + Sync;

/// A single `from → from + 1` migration step
#[derive(Clone)]
pub struct Migration {
    pub from: u32,
    pub description: String,
    transform: Arc<TransformFn>,
}

impl Migration {
    pub fn new<F>(from: u32, description: impl Into<String>, transform: F) -> Self
    where
        F: Fn(Record) -> anyhow::Result<Record> + Send + Sync + 'static,
    {
        Self {
            from,
            description: description.into(),
            transform: Arc::new(transform),
        }
    }

    /// Target version of this step
    pub fn to(&self) -> u32 {
        self.from + 1
    }

    fn apply(&self, record: Record) -> anyhow::Result<Record> {
        (self.transform)(record)
    }
}

impl std::fmt::Debug for Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration")
            .field("from", &self.from)
            .field("description", &self.description)
            .finish()
    }
}

/// Registry and runner of migration chains
#[derive(Debug, Default, Clone)]
pub struct MigrationEngine {
    chains: HashMap<String, BTreeMap<u32, Migration>>,
}

impl MigrationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step for a collection
    ///
    /// Fails if a step starting at the same version already exists.
    pub fn register(&mut self, collection: &str, migration: Migration) -> StoreResult<()> {
        let chain = self.chains.entry(collection.to_string()).or_default();
        if chain.contains_key(&migration.from) {
            return Err(StoreError::InvalidSchema {
                collection: collection.to_string(),
                details: format!(
                    "migration from version {} is already registered",
                    migration.from
                ),
            });
        }
        chain.insert(migration.from, migration);
        Ok(())
    }

    /// Check that every step between `from` and `to` exists
    pub fn check_chain(&self, collection: &str, from: u32, to: u32) -> StoreResult<()> {
        for version in from..to {
            self.step(collection, version)?;
        }
        Ok(())
    }

    /// Number of steps registered for a collection
    pub fn step_count(&self, collection: &str) -> usize {
        self.chains.get(collection).map_or(0, BTreeMap::len)
    }

    fn step(&self, collection: &str, from: u32) -> StoreResult<&Migration> {
        self.chains
            .get(collection)
            .and_then(|chain| chain.get(&from))
            .ok_or_else(|| StoreError::MigrationConfig {
                collection: collection.to_string(),
                from,
                to: from + 1,
            })
    }

    /// Migrate one record up to `to`
    ///
    /// The record's own version stamp wins over `from` when present.
    pub fn migrate_record(
        &self,
        collection: &str,
        record: Record,
        from: u32,
        to: u32,
    ) -> StoreResult<Record> {
        let start = if record.contains(crate::record::keys::VERSION) {
            record.version()
        } else {
            from
        };
        if start >= to {
            return Ok(record);
        }

        let mut current = record;
        for version in start..to {
            let step = self.step(collection, version)?;
            let id = current.id().unwrap_or_default().to_string();
            current = step
                .apply(current)
                .map_err(|e| StoreError::MigrationFailed {
                    collection: collection.to_string(),
                    id,
                    from: version,
                    details: e.to_string(),
                })?;
            current.set_version(step.to());
        }
        Ok(current)
    }

    /// Migrate a batch of records from `from` to `to`
    ///
    /// `from` applies to records without a version stamp. The chain is
    /// checked from the lowest version present in the batch before any record
    /// is touched, so a missing step halts the batch without partial results.
    pub fn migrate(
        &self,
        collection: &str,
        records: Vec<Record>,
        from: u32,
        to: u32,
    ) -> StoreResult<Vec<Record>> {
        let lowest = records
            .iter()
            .map(|r| {
                if r.contains(crate::record::keys::VERSION) {
                    r.version()
                } else {
                    from
                }
            })
            .min()
            .unwrap_or(to);
        self.check_chain(collection, lowest, to)?;

        debug!(
            "Migrating {} record(s) of '{}' to version {}",
            records.len(),
            collection,
            to
        );

        records
            .into_iter()
            .map(|record| self.migrate_record(collection, record, from, to))
            .collect()
    }
}
