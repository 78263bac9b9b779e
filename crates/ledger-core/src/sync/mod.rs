//! Offline-first synchronization
//!
//! Keeps a local adapter authoritative for reads while mutations are
//! replicated to a remote adapter in the background.
//!
//! ## Architecture
//!
//! - `composite`: the `CompositeAdapter` write path, drain and pull
//! - `queue`: persistent pending queue with retry policy
//! - `conflict`: last-write-wins audit log
//! - `rules`: per-user selective sync scopes
//! - `task`: background loop that drains and pulls on a schedule
//!
//! ## Usage
//!
//! ```ignore
//! let composite = Arc::new(CompositeAdapter::new(local, remote, events));
//! let handle = spawn_sync_task(composite.clone(), SyncTaskConfig::default());
//! composite.insert("job", record).await?;
//! handle.shutdown().await;
//! ```

mod composite;
mod conflict;
mod queue;
mod rules;
mod task;

pub use composite::{CompositeAdapter, DrainReport};
pub use conflict::{ConflictKind, ConflictLog, ConflictRecord, Resolution};
pub use queue::{EntryStatus, RetryPolicy, SyncAction, SyncQueue, SyncQueueEntry};
pub use rules::{SelectiveSyncRule, SyncRules};
pub use task::{spawn_sync_task, ConnectionStatus, SyncCommand, SyncTaskConfig, SyncTaskHandle};
