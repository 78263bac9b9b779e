//! Collection facade
//!
//! A `Collection` binds one registered schema to an adapter. Every write is
//! validated against the schema before it reaches the adapter, deletes
//! follow the relation graph, and each successful mutation publishes a
//! `StoreEvent::Changed`.
//!
//! ## Deletes
//!
//! Removing a record runs in two phases:
//! 1. **Plan**: walk dependents through `SchemaRegistry::dependents_of`,
//!    collecting `cascade` deletes and `nullify` updates. Each
//!    `(collection, id)` pair is visited once, so cyclic relations
//!    terminate. A `restrict` dependent that is not itself being deleted
//!    fails the whole delete before anything is written.
//! 2. **Execute**: clear foreign keys, then delete dependents before the
//!    records they point at.
//!
//! Dependent collections are reached through the same adapter as the
//! collection being deleted from.

use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::adapter::{BulkItemResult, BulkMode, BulkOptions, BulkUpdate, SharedAdapter};
use crate::error::{StoreError, StoreResult};
use crate::events::{ChangeEvent, ChangeOperation, EventBus, StoreEvent};
use crate::models::{require_id, Model};
use crate::query::{AggregateOptions, AggregateResult, Filter, QueryOptions};
use crate::record::Record;
use crate::schema::{CascadePolicy, SchemaDef, SchemaRegistry};

/// Schema-bound view of one collection
#[derive(Clone)]
pub struct Collection {
    name: String,
    registry: Arc<SchemaRegistry>,
    adapter: SharedAdapter,
    events: EventBus,
}

enum CascadeStep {
    Nullify {
        collection: String,
        id: String,
        foreign_key: String,
    },
    Delete {
        collection: String,
        record: Record,
    },
}

impl Collection {
    /// Bind a registered collection to an adapter
    pub fn new(
        name: impl Into<String>,
        registry: Arc<SchemaRegistry>,
        adapter: SharedAdapter,
        events: EventBus,
    ) -> StoreResult<Self> {
        let name = name.into();
        if !registry.contains(&name) {
            return Err(StoreError::UnknownCollection { collection: name });
        }
        Ok(Self {
            name,
            registry,
            adapter,
            events,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current schema (fields appended after binding are included)
    pub fn schema(&self) -> StoreResult<Arc<SchemaDef>> {
        self.registry
            .get(&self.name)
            .ok_or_else(|| StoreError::UnknownCollection {
                collection: self.name.clone(),
            })
    }

    pub fn adapter(&self) -> &SharedAdapter {
        &self.adapter
    }

    fn validate(&self, record: &Record) -> StoreResult<()> {
        let errors = self.registry.validate(&self.name, record);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(StoreError::validation(&self.name, errors))
        }
    }

    fn publish(
        &self,
        collection: &str,
        operation: ChangeOperation,
        before: Option<Record>,
        after: Option<Record>,
    ) {
        self.events.publish(StoreEvent::Changed(ChangeEvent {
            collection: collection.to_string(),
            operation,
            before,
            after,
        }));
    }

    /// Bring records stored at an older schema version up to date
    fn upgrade(&self, records: Vec<Record>) -> StoreResult<Vec<Record>> {
        let version = self.schema()?.version;
        if records.iter().all(|r| r.version() >= version) {
            return Ok(records);
        }
        self.registry.migrate(&self.name, records, 0, version)
    }

    // ==== Reads ====

    pub async fn get(&self, id: &str) -> StoreResult<Option<Record>> {
        match self.adapter.get(&self.name, id).await? {
            Some(record) => Ok(self.upgrade(vec![record])?.pop()),
            None => Ok(None),
        }
    }

    pub async fn query(&self, options: &QueryOptions) -> StoreResult<Vec<Record>> {
        let records = self.adapter.query(&self.name, options).await?;
        self.upgrade(records)
    }

    /// Every record in the collection
    pub async fn all(&self) -> StoreResult<Vec<Record>> {
        self.query(&QueryOptions::new()).await
    }

    /// Number of records matching `filters`
    pub async fn count(&self, filters: Vec<Filter>) -> StoreResult<usize> {
        let mut options = AggregateOptions::count();
        options.filters = filters;
        let result = self.adapter.aggregate(&self.name, &options).await?;
        Ok(result.value.unwrap_or(0.0) as usize)
    }

    pub async fn aggregate(&self, options: &AggregateOptions) -> StoreResult<AggregateResult> {
        self.adapter.aggregate(&self.name, options).await
    }

    // ==== Writes ====

    /// Validate and insert a record
    ///
    /// The record is stamped with the current schema version.
    pub async fn insert(&self, mut record: Record) -> StoreResult<Record> {
        record.set_version(self.schema()?.version);
        self.validate(&record)?;

        let inserted = self.adapter.insert(&self.name, record).await?;
        self.publish(&self.name, ChangeOperation::Insert, None, Some(inserted.clone()));
        Ok(inserted)
    }

    /// Validate `changes` against the stored record
    ///
    /// Returns the record before the update and the changes to send. A
    /// record stored at an older version is rewritten whole so the stored
    /// copy carries its migrated fields.
    async fn prepare_update(&self, id: &str, mut changes: Record) -> StoreResult<(Record, Record)> {
        let version = self.schema()?.version;
        let stored = self
            .adapter
            .get(&self.name, id)
            .await?
            .ok_or_else(|| StoreError::not_found(&self.name, id))?;
        let stale = stored.version() < version;
        let before = match self.upgrade(vec![stored])?.pop() {
            Some(record) => record,
            None => return Err(StoreError::not_found(&self.name, id)),
        };

        changes.set_version(version);
        let mut merged = before.clone();
        merged.merge(&changes);
        self.validate(&merged)?;

        Ok((before, if stale { merged } else { changes }))
    }

    /// Merge `changes` into a record after validating the result
    pub async fn update(&self, id: &str, changes: Record) -> StoreResult<Record> {
        let (before, changes) = self.prepare_update(id, changes).await?;

        let after = self.adapter.update(&self.name, id, changes).await?;
        self.publish(
            &self.name,
            ChangeOperation::Update,
            Some(before),
            Some(after.clone()),
        );
        Ok(after)
    }

    /// Delete a record, applying relation cascade policies
    ///
    /// Removing an absent id succeeds without publishing anything.
    pub async fn remove(&self, id: &str) -> StoreResult<()> {
        let Some(root) = self.adapter.get(&self.name, id).await? else {
            return Ok(());
        };

        let steps = self.plan_delete(root).await?;
        for step in steps {
            match step {
                CascadeStep::Nullify {
                    collection,
                    id,
                    foreign_key,
                } => {
                    let before = self.adapter.get(&collection, &id).await?;
                    let mut changes = Record::new();
                    changes.set(foreign_key.as_str(), Value::Null);
                    let after = self.adapter.update(&collection, &id, changes).await?;
                    debug!("Cleared {}.{} on '{}'", collection, foreign_key, id);
                    self.publish(&collection, ChangeOperation::Update, before, Some(after));
                }
                CascadeStep::Delete { collection, record } => {
                    let Some(record_id) = record.id().map(str::to_string) else {
                        continue;
                    };
                    self.adapter.remove(&collection, &record_id).await?;
                    self.publish(&collection, ChangeOperation::Delete, Some(record), None);
                }
            }
        }
        Ok(())
    }

    /// Collect every mutation a delete implies, failing on `restrict`
    async fn plan_delete(&self, root: Record) -> StoreResult<Vec<CascadeStep>> {
        let mut visited: HashSet<(String, String)> = HashSet::new();
        let mut deletes: Vec<(String, Record)> = Vec::new();
        let mut nullify: Vec<(String, String, String)> = Vec::new();
        let mut restricted: Vec<(String, String, String, String)> = Vec::new();
        let mut stack: Vec<(String, Record)> = vec![(self.name.clone(), root)];

        while let Some((collection, record)) = stack.pop() {
            let Some(id) = record.id().map(str::to_string) else {
                continue;
            };
            if !visited.insert((collection.clone(), id.clone())) {
                continue;
            }

            for edge in self.registry.dependents_of(&collection) {
                let options = QueryOptions::new().filter(Filter::eq(edge.foreign_key.clone(), id.clone()));
                let dependents = self.adapter.query(&edge.collection, &options).await?;

                for dependent in dependents {
                    let Some(dependent_id) = dependent.id().map(str::to_string) else {
                        continue;
                    };
                    match edge.cascade {
                        CascadePolicy::Cascade => {
                            stack.push((edge.collection.clone(), dependent));
                        }
                        CascadePolicy::Nullify => {
                            nullify.push((
                                edge.collection.clone(),
                                dependent_id,
                                edge.foreign_key.clone(),
                            ));
                        }
                        CascadePolicy::Restrict => {
                            restricted.push((
                                collection.clone(),
                                id.clone(),
                                edge.collection.clone(),
                                dependent_id,
                            ));
                        }
                    }
                }
            }
            deletes.push((collection, record));
        }

        // A restrict dependent blocks unless it is deleted by this same plan
        let blocking: Vec<_> = restricted
            .into_iter()
            .filter(|(_, _, dep_collection, dep_id)| {
                !visited.contains(&(dep_collection.clone(), dep_id.clone()))
            })
            .collect();
        if let Some((collection, id, dependent, _)) = blocking.first() {
            let count = blocking
                .iter()
                .filter(|(c, i, d, _)| c == collection && i == id && d == dependent)
                .count();
            return Err(StoreError::RelationRestricted {
                collection: collection.clone(),
                id: id.clone(),
                dependent: dependent.clone(),
                count,
            });
        }

        let mut steps: Vec<CascadeStep> = nullify
            .into_iter()
            .filter(|(c, i, _)| !visited.contains(&(c.clone(), i.clone())))
            .map(|(collection, id, foreign_key)| CascadeStep::Nullify {
                collection,
                id,
                foreign_key,
            })
            .collect();
        // Dependents were discovered after the records they reference
        steps.extend(
            deletes
                .into_iter()
                .rev()
                .map(|(collection, record)| CascadeStep::Delete { collection, record }),
        );
        Ok(steps)
    }

    // ==== Bulk ====

    /// Insert many records
    ///
    /// Invalid records never reach the adapter. With `AbortAll` the first
    /// invalid record fails the batch; with `BestEffort` it is reported in
    /// its slot and the rest are written.
    pub async fn bulk_insert(
        &self,
        records: Vec<Record>,
        options: BulkOptions,
    ) -> StoreResult<Vec<BulkItemResult>> {
        let version = self.schema()?.version;
        let mut rejected = Vec::new();
        let mut accepted = Vec::new();
        let mut positions = Vec::new();

        for (index, mut record) in records.into_iter().enumerate() {
            record.set_version(version);
            match self.validate(&record) {
                Ok(()) => {
                    positions.push(index);
                    accepted.push(record);
                }
                Err(e) if options.mode == BulkMode::AbortAll => {
                    return Err(StoreError::BulkAborted {
                        index,
                        source: Box::new(e),
                    });
                }
                Err(e) => {
                    rejected.push(BulkItemResult::failure(
                        index,
                        record.id().map(str::to_string),
                        &e,
                    ));
                }
            }
        }

        let written = if accepted.is_empty() {
            Vec::new()
        } else {
            self.adapter.bulk_insert(&self.name, accepted, options).await?
        };

        let mut results = rejected;
        for mut result in written {
            if let Some(ref record) = result.record {
                self.publish(&self.name, ChangeOperation::Insert, None, Some(record.clone()));
            }
            result.index = positions.get(result.index).copied().unwrap_or(result.index);
            results.push(result);
        }
        results.sort_by_key(|r| r.index);
        Ok(results)
    }

    /// Update many records, validating each merged result
    pub async fn bulk_update(
        &self,
        updates: Vec<BulkUpdate>,
        options: BulkOptions,
    ) -> StoreResult<Vec<BulkItemResult>> {
        let mut rejected = Vec::new();
        let mut accepted = Vec::new();
        let mut befores = Vec::new();
        let mut positions = Vec::new();

        for (index, update) in updates.into_iter().enumerate() {
            let id = update.id;
            match self.prepare_update(&id, update.changes).await {
                Ok((before, changes)) => {
                    positions.push(index);
                    befores.push(before);
                    accepted.push(BulkUpdate::new(id, changes));
                }
                Err(e) if options.mode == BulkMode::AbortAll => {
                    return Err(StoreError::BulkAborted {
                        index,
                        source: Box::new(e),
                    });
                }
                Err(e) => {
                    rejected.push(BulkItemResult::failure(index, Some(id), &e));
                }
            }
        }

        let written = if accepted.is_empty() {
            Vec::new()
        } else {
            self.adapter.bulk_update(&self.name, accepted, options).await?
        };

        let mut results = rejected;
        for mut result in written {
            if let Some(ref record) = result.record {
                self.publish(
                    &self.name,
                    ChangeOperation::Update,
                    befores.get(result.index).cloned(),
                    Some(record.clone()),
                );
            }
            result.index = positions.get(result.index).copied().unwrap_or(result.index);
            results.push(result);
        }
        results.sort_by_key(|r| r.index);
        Ok(results)
    }
}

/// Collection of one typed model
pub struct TypedCollection<T: Model> {
    inner: Collection,
    _model: PhantomData<T>,
}

impl<T: Model> TypedCollection<T> {
    /// Bind `T::COLLECTION` to an adapter
    pub fn new(
        registry: Arc<SchemaRegistry>,
        adapter: SharedAdapter,
        events: EventBus,
    ) -> StoreResult<Self> {
        Ok(Self::from_collection(Collection::new(
            T::COLLECTION,
            registry,
            adapter,
            events,
        )?))
    }

    pub fn from_collection(inner: Collection) -> Self {
        Self {
            inner,
            _model: PhantomData,
        }
    }

    /// Untyped view
    pub fn raw(&self) -> &Collection {
        &self.inner
    }

    pub async fn insert(&self, model: &T) -> StoreResult<T> {
        T::from_record(self.inner.insert(model.to_record()?).await?)
    }

    /// Write every field of `model` over the stored record
    pub async fn update(&self, model: &T) -> StoreResult<T> {
        let id = require_id(model)?;
        T::from_record(self.inner.update(&id, model.to_record()?).await?)
    }

    pub async fn get(&self, id: &str) -> StoreResult<Option<T>> {
        self.inner.get(id).await?.map(T::from_record).transpose()
    }

    pub async fn query(&self, options: &QueryOptions) -> StoreResult<Vec<T>> {
        self.inner
            .query(options)
            .await?
            .into_iter()
            .map(T::from_record)
            .collect()
    }

    pub async fn remove(&self, id: &str) -> StoreResult<()> {
        self.inner.remove(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{DataAdapter, LocalStorageAdapter};
    use crate::models::{Entity, EntityType, Job};
    use crate::schema::builtin::{EMPLOYEE, ENTITY, JOB, TIME_ENTRY};
    use crate::schema::{FieldDef, RelationDef};
    use crate::storage::MemoryStorage;
    use crate::testing::record;
    use serde_json::json;
    use tokio::sync::broadcast;

    struct Fixture {
        registry: Arc<SchemaRegistry>,
        adapter: SharedAdapter,
        events: EventBus,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_registry(SchemaRegistry::with_builtin().unwrap())
        }

        fn with_registry(registry: SchemaRegistry) -> Self {
            Self {
                registry: Arc::new(registry),
                adapter: Arc::new(LocalStorageAdapter::new(Arc::new(MemoryStorage::new()))),
                events: EventBus::new(),
            }
        }

        fn collection(&self, name: &str) -> Collection {
            Collection::new(
                name,
                self.registry.clone(),
                self.adapter.clone(),
                self.events.clone(),
            )
            .unwrap()
        }
    }

    fn drain_changes(rx: &mut broadcast::Receiver<StoreEvent>) -> Vec<ChangeEvent> {
        let mut changes = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let StoreEvent::Changed(change) = event {
                changes.push(change);
            }
        }
        changes
    }

    #[tokio::test]
    async fn test_insert_assigns_id_and_version() {
        let fx = Fixture::new();
        let mut rx = fx.events.subscribe();
        let entities = fx.collection(ENTITY);

        let inserted = entities
            .insert(record(json!({"name": "Acme", "type": "company"})))
            .await
            .unwrap();

        assert!(inserted.id().is_some());
        assert_eq!(inserted.version(), 2);

        let changes = drain_changes(&mut rx);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].operation, ChangeOperation::Insert);
        assert!(changes[0].before.is_none());
        assert_eq!(changes[0].after.as_ref(), Some(&inserted));
    }

    #[tokio::test]
    async fn test_invalid_insert_never_reaches_adapter() {
        let fx = Fixture::new();
        let entities = fx.collection(ENTITY);

        let err = entities
            .insert(record(json!({"type": "company"})))
            .await
            .unwrap_err();
        match err {
            StoreError::Validation { errors, .. } => {
                assert!(errors.iter().any(|e| e.contains("name")));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(fx.adapter.query(ENTITY, &QueryOptions::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_collection() {
        let fx = Fixture::new();
        let err = Collection::new("invoice", fx.registry.clone(), fx.adapter.clone(), fx.events.clone())
            .err()
            .unwrap();
        assert!(matches!(err, StoreError::UnknownCollection { .. }));
    }

    #[tokio::test]
    async fn test_update_validates_merged_record() {
        let fx = Fixture::new();
        let entities = fx.collection(ENTITY);
        let acme = entities
            .insert(record(json!({"name": "Acme", "type": "company"})))
            .await
            .unwrap();
        let id = acme.id().unwrap();

        let err = entities
            .update(id, record(json!({"type": "alien"})))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation { .. }));
        assert_eq!(entities.get(id).await.unwrap(), Some(acme.clone()));

        let updated = entities
            .update(id, record(json!({"email": "ops@acme.test"})))
            .await
            .unwrap();
        assert_eq!(updated.get("name"), Some(&json!("Acme")));
        assert_eq!(updated.get("email"), Some(&json!("ops@acme.test")));

        let missing = entities.update("nope", record(json!({}))).await.unwrap_err();
        assert!(matches!(missing, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_remove_nullifies_child_entities() {
        let fx = Fixture::new();
        let entities = fx.collection(ENTITY);
        let parent = entities
            .insert(record(json!({"name": "Holding", "type": "company"})))
            .await
            .unwrap();
        let parent_id = parent.id().unwrap();
        let child = entities
            .insert(record(json!({"name": "Sub", "type": "company", "parentId": parent_id})))
            .await
            .unwrap();

        entities.remove(parent_id).await.unwrap();

        assert!(entities.get(parent_id).await.unwrap().is_none());
        let child = entities.get(child.id().unwrap()).await.unwrap().unwrap();
        assert_eq!(child.get("parentId"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn test_restrict_blocks_delete_without_changes() {
        let fx = Fixture::new();
        let entities = fx.collection(ENTITY);
        let jobs = fx.collection(JOB);
        let customer = entities
            .insert(record(json!({"name": "Acme", "type": "customer"})))
            .await
            .unwrap();
        let customer_id = customer.id().unwrap();
        let child = entities
            .insert(record(json!({"name": "Branch", "type": "company", "parentId": customer_id})))
            .await
            .unwrap();
        jobs.insert(record(json!({"name": "Roof", "entityId": customer_id, "status": "bid"})))
            .await
            .unwrap();

        let mut rx = fx.events.subscribe();
        let err = entities.remove(customer_id).await.unwrap_err();
        match err {
            StoreError::RelationRestricted { dependent, count, .. } => {
                assert_eq!(dependent, JOB);
                assert_eq!(count, 1);
            }
            other => panic!("unexpected error: {other}"),
        }

        // Nothing changed, not even the nullify side
        assert!(entities.get(customer_id).await.unwrap().is_some());
        let child = entities.get(child.id().unwrap()).await.unwrap().unwrap();
        assert_eq!(child.get("parentId"), Some(&json!(customer_id)));
        assert!(drain_changes(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_cascade_removes_dependents_transitively() {
        let fx = Fixture::new();
        let entities = fx.collection(ENTITY);
        let employees = fx.collection(EMPLOYEE);
        let time_entries = fx.collection(TIME_ENTRY);

        let employer = entities
            .insert(record(json!({"name": "Acme", "type": "company"})))
            .await
            .unwrap();
        let employer_id = employer.id().unwrap();
        let employee = employees
            .insert(record(json!({"firstName": "Ada", "lastName": "Byron", "entityId": employer_id})))
            .await
            .unwrap();
        let employee_id = employee.id().unwrap();
        for day in ["2024-05-01", "2024-05-02"] {
            time_entries
                .insert(record(json!({"employeeId": employee_id, "date": day, "hours": 8})))
                .await
                .unwrap();
        }

        let mut rx = fx.events.subscribe();
        entities.remove(employer_id).await.unwrap();

        assert_eq!(employees.count(vec![]).await.unwrap(), 0);
        assert_eq!(time_entries.count(vec![]).await.unwrap(), 0);

        let changes = drain_changes(&mut rx);
        assert_eq!(changes.len(), 4);
        assert!(changes.iter().all(|c| c.operation == ChangeOperation::Delete));
        // Parent goes last
        assert_eq!(changes[3].collection, ENTITY);
    }

    #[tokio::test]
    async fn test_cascade_cycle_terminates() {
        let registry = SchemaRegistry::new();
        registry
            .register(
                SchemaDef::new("node", "graph")
                    .field(FieldDef::id("next"))
                    .relation(RelationDef::belongs_to("next", "node", CascadePolicy::Cascade)),
            )
            .unwrap();
        let fx = Fixture::with_registry(registry);
        let nodes = fx.collection("node");

        nodes.insert(record(json!({"id": "a", "next": "b"}))).await.unwrap();
        nodes.insert(record(json!({"id": "b", "next": "a"}))).await.unwrap();

        nodes.remove("a").await.unwrap();
        assert_eq!(nodes.count(vec![]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remove_absent_is_silent() {
        let fx = Fixture::new();
        let mut rx = fx.events.subscribe();
        fx.collection(ENTITY).remove("ghost").await.unwrap();
        assert!(drain_changes(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_bulk_insert_modes() {
        let fx = Fixture::new();
        let entities = fx.collection(ENTITY);
        let batch = || {
            vec![
                record(json!({"name": "A", "type": "company"})),
                record(json!({"type": "company"})),
                record(json!({"name": "C", "type": "person"})),
            ]
        };

        let err = entities
            .bulk_insert(batch(), BulkOptions::abort_all())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::BulkAborted { index: 1, .. }));
        assert_eq!(entities.count(vec![]).await.unwrap(), 0);

        let results = entities
            .bulk_insert(batch(), BulkOptions::best_effort())
            .await
            .unwrap();
        let indices: Vec<_> = results.iter().map(|r| (r.index, r.is_ok())).collect();
        assert_eq!(indices, vec![(0, true), (1, false), (2, true)]);
        assert_eq!(entities.count(vec![]).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_bulk_update_reports_missing() {
        let fx = Fixture::new();
        let jobs = fx.collection(JOB);
        jobs.insert(record(json!({"id": "j1", "name": "Roof", "entityId": "e1", "status": "bid"})))
            .await
            .unwrap();

        let results = jobs
            .bulk_update(
                vec![
                    BulkUpdate::new("missing", record(json!({"status": "active"}))),
                    BulkUpdate::new("j1", record(json!({"status": "active"}))),
                ],
                BulkOptions::best_effort(),
            )
            .await
            .unwrap();

        assert!(!results[0].is_ok());
        assert!(results[1].is_ok());
        let job = jobs.get("j1").await.unwrap().unwrap();
        assert_eq!(job.get("status"), Some(&json!("active")));
    }

    #[tokio::test]
    async fn test_query_and_count() {
        let fx = Fixture::new();
        let jobs = fx.collection(JOB);
        for (name, status) in [("A", "bid"), ("B", "active"), ("C", "active")] {
            jobs.insert(record(json!({"name": name, "entityId": "e1", "status": status})))
                .await
                .unwrap();
        }

        let active = jobs
            .query(&QueryOptions::new().filter(Filter::eq("status", "active")))
            .await
            .unwrap();
        assert_eq!(active.len(), 2);
        assert_eq!(jobs.count(vec![Filter::eq("status", "bid")]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reads_upgrade_legacy_records() {
        let fx = Fixture::new();
        fx.adapter
            .insert(ENTITY, record(json!({"id": "e1", "name": "Old", "kind": "vendor"})))
            .await
            .unwrap();

        let entity = fx.collection(ENTITY).get("e1").await.unwrap().unwrap();
        assert_eq!(entity.version(), 2);
        assert_eq!(entity.get("type"), Some(&json!("vendor")));
    }

    #[tokio::test]
    async fn test_typed_collection() {
        let fx = Fixture::new();
        let entities: TypedCollection<Entity> =
            TypedCollection::new(fx.registry.clone(), fx.adapter.clone(), fx.events.clone()).unwrap();
        let jobs: TypedCollection<Job> =
            TypedCollection::new(fx.registry.clone(), fx.adapter.clone(), fx.events.clone()).unwrap();

        let mut acme = entities
            .insert(&Entity::new("Acme", EntityType::Customer))
            .await
            .unwrap();
        assert_eq!(acme.version, Some(2));

        acme.email = Some("hello@acme.test".to_string());
        let updated = entities.update(&acme).await.unwrap();
        assert_eq!(updated.email.as_deref(), Some("hello@acme.test"));

        let acme_id = acme.id.clone().unwrap();
        let job = jobs.insert(&Job::new("Deck", acme_id.as_str())).await.unwrap();
        let found = jobs
            .query(&QueryOptions::new().filter(Filter::eq("entityId", acme_id.as_str())))
            .await
            .unwrap();
        assert_eq!(found, vec![job]);

        // Models without an id cannot be updated
        assert!(entities
            .update(&Entity::new("Nobody", EntityType::Person))
            .await
            .is_err());
    }
}
