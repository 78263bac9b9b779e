//! Storage layer
//!
//! Physical building blocks used by the local adapters and the sync engine.
//!
//! ## Architecture
//!
//! - **Key-value storage**: string keys to string values, file-backed or
//!   in-memory, with an optional byte quota. Backs the LocalStorage adapter.
//! - **SQLite layout**: versioned object-store tables backing the
//!   IndexedDb adapter.
//! - **Atomic writes**: every file write goes through a temp file and a
//!   rename, so the queue, conflict log and datasets are never half written.

pub mod persistence;
pub mod schema;

pub use persistence::{atomic_write, FileStorage, KeyValueStorage, MemoryStorage};
pub use schema::{init_schema, needs_init, SCHEMA_VERSION};
