//! Ledger Core Library
//!
//! This crate provides the record store behind Ledger, an offline-first ERP.
//! Every module persists its records through one adapter interface, so the
//! same code runs against browser-style local storage, an embedded SQLite
//! database or a remote REST API.
//!
//! # Architecture
//!
//! - **Schemas**: each collection registers a versioned `SchemaDef`; stored
//!   records carry the version they were written at and are migrated forward
//! - **Adapters**: `DataAdapter` implementations own persistence
//! - **Sync**: `CompositeAdapter` writes locally, queues each mutation and
//!   replays the queue against the remote, resolving conflicts last-write-wins
//! - **Collections**: validation, cascading deletes and change events on top
//!   of whichever adapter the store was opened with
//!
//! # Quick Start
//!
//! ```text
//! let store = Store::open().await?;
//!
//! let entities = store.typed::<Entity>()?;
//! let acme = entities.insert(&Entity::new("Acme", EntityType::Customer)).await?;
//!
//! let jobs = store.collection("job")?;
//! let open = jobs.query(&QueryOptions::new().filter(Filter::eq("status", "active"))).await?;
//! ```
//!
//! # Modules
//!
//! - `store`: Store context (main entry point)
//! - `collection`: Validated collection facade
//! - `schema`: Schema registry and migration engine
//! - `query`: Filters, sorting, pagination and aggregation
//! - `adapter`: The adapter trait and its local and remote implementations
//! - `storage`: Key-value and SQLite persistence primitives
//! - `sync`: Offline queue, conflict log and background sync
//! - `config`: Application configuration

pub mod adapter;
pub mod collection;
pub mod config;
pub mod error;
pub mod events;
pub mod models;
pub mod query;
pub mod record;
pub mod schema;
pub mod storage;
pub mod store;
pub mod sync;

#[cfg(test)]
mod testing;

pub use adapter::{
    ApiAdapter, BulkItemResult, BulkMode, BulkOptions, BulkUpdate, DataAdapter, IndexedDbAdapter,
    LocalStorageAdapter, SharedAdapter,
};
pub use collection::{Collection, TypedCollection};
pub use config::{Config, LocalBackend, SyncSettings};
pub use error::{StoreError, StoreResult};
pub use events::{ChangeEvent, ChangeOperation, EventBus, StoreEvent};
pub use models::{Entity, EntityType, Job, JobStatus, Model};
pub use query::{
    AggregateFn, AggregateOptions, AggregateResult, Filter, FilterOp, QueryOptions, SortDirection,
};
pub use record::Record;
pub use schema::{CascadePolicy, FieldDef, FieldType, RelationDef, SchemaDef, SchemaRegistry};
pub use store::{Store, SyncSummary, Unavailable};
pub use sync::{CompositeAdapter, ConnectionStatus, DrainReport, SyncRules};
