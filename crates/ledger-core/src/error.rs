//! Store error handling
//!
//! Provides the typed error taxonomy shared by the schema registry,
//! adapters, the sync engine and the collection facade.
//!
//! Errors fall into three groups:
//! - **Configuration** (`SchemaCollision`, `MigrationConfig`, ...): programming
//!   errors that stop start-up for the affected collection
//! - **Caller** (`Validation`, `NotFound`, `RelationRestricted`): returned to the
//!   immediate caller, nothing was written
//! - **Transient** (`StorageFull`, `Network`): retried by the sync queue

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during store operations
#[derive(Error, Debug)]
pub enum StoreError {
    /// A schema with this collection name is already registered
    #[error("Schema collision: collection '{collection}' is already registered")]
    SchemaCollision { collection: String },

    /// No schema is registered for this collection
    #[error("Unknown collection '{collection}'")]
    UnknownCollection { collection: String },

    /// Schema definition is malformed
    #[error("Invalid schema for '{collection}': {details}")]
    InvalidSchema { collection: String, details: String },

    /// Field name already exists in the schema
    #[error("Field '{field}' already exists in collection '{collection}'")]
    DuplicateField { collection: String, field: String },

    /// Record failed schema validation
    #[error("Validation failed for '{collection}': {}", errors.join("; "))]
    Validation {
        collection: String,
        errors: Vec<String>,
    },

    /// Record does not exist
    #[error("Record '{id}' not found in '{collection}'")]
    NotFound { collection: String, id: String },

    /// Storage quota exhausted
    #[error("Storage full while writing '{key}': {details}. Free up space and try again.")]
    StorageFull { key: String, details: String },

    /// Remote could not be reached or answered with a retryable status
    #[error("Network error: {0}")]
    Network(String),

    /// Remote rejected the write because of a conflicting change
    #[error("Conflict on '{collection}/{id}': {details}")]
    Conflict {
        collection: String,
        id: String,
        details: String,
    },

    /// A step in the migration chain is missing
    #[error("Missing migration for '{collection}' from version {from} to {to}")]
    MigrationConfig {
        collection: String,
        from: u32,
        to: u32,
    },

    /// A migration step failed on a record
    #[error("Migration of '{collection}' record '{id}' at version {from} failed: {details}")]
    MigrationFailed {
        collection: String,
        id: String,
        from: u32,
        details: String,
    },

    /// Delete blocked by a `restrict` relation
    #[error("Cannot delete '{collection}/{id}': {count} dependent record(s) in '{dependent}' restrict deletion")]
    RelationRestricted {
        collection: String,
        id: String,
        dependent: String,
        count: usize,
    },

    /// An abort-all bulk operation stopped at an item
    #[error("Bulk operation aborted at item {index}: {source}")]
    BulkAborted {
        index: usize,
        #[source]
        source: Box<StoreError>,
    },

    /// Remote answered with an unexpected status
    #[error("Remote returned status {status}: {message}")]
    Remote { status: u16, message: String },

    /// Value is not a valid record (not a JSON object)
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Generic storage failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Failed to read or write a file
    #[error("Failed to write '{path}': {source}")]
    WriteError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// SQLite database error
    #[error("Database error: {0}")]
    Database(rusqlite::Error),

    /// JSON encoding error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StoreError {
    /// Create an error from an I/O error with path context
    ///
    /// Disk-full conditions are classified as `StorageFull` so the sync
    /// queue treats them as transient.
    pub fn from_io(error: io::Error, path: PathBuf) -> Self {
        if is_disk_full_error(&error) {
            return StoreError::StorageFull {
                key: path.display().to_string(),
                details: error.to_string(),
            };
        }
        StoreError::WriteError {
            path,
            source: error,
        }
    }

    /// Shorthand for a validation error
    pub fn validation(collection: impl Into<String>, errors: Vec<String>) -> Self {
        StoreError::Validation {
            collection: collection.into(),
            errors,
        }
    }

    /// Shorthand for a not-found error
    pub fn not_found(collection: impl Into<String>, id: impl Into<String>) -> Self {
        StoreError::NotFound {
            collection: collection.into(),
            id: id.into(),
        }
    }

    /// Check if the sync queue should retry after this error
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::StorageFull { .. } | StoreError::Network(_)
        )
    }

    /// Check if this error is a configuration error that must stop start-up
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::SchemaCollision { .. }
                | StoreError::MigrationConfig { .. }
                | StoreError::InvalidSchema { .. }
        )
    }

    /// Get a recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            StoreError::StorageFull { .. } => Some("Free up disk space or raise the storage quota."),
            StoreError::Network(_) => {
                Some("Queued changes are kept and retried once the remote is reachable.")
            }
            StoreError::MigrationConfig { .. } => {
                Some("Register the missing migration step; the collection stays unavailable until then.")
            }
            StoreError::SchemaCollision { .. } => {
                Some("Each collection name may only be registered once.")
            }
            StoreError::RelationRestricted { .. } => {
                Some("Delete or reassign the dependent records first.")
            }
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    /// `SQLITE_FULL` is classified as `StorageFull` so the sync queue
    /// retries it like any other disk-full condition.
    fn from(error: rusqlite::Error) -> Self {
        match error {
            rusqlite::Error::SqliteFailure(ref failure, _)
                if failure.code == rusqlite::ErrorCode::DiskFull =>
            {
                StoreError::StorageFull {
                    key: "sqlite".to_string(),
                    details: error.to_string(),
                }
            }
            other => StoreError::Database(other),
        }
    }
}

/// Check if an I/O error indicates disk full condition
fn is_disk_full_error(error: &io::Error) -> bool {
    let msg = error.to_string().to_lowercase();
    msg.contains("no space left")
        || msg.contains("disk full")
        || msg.contains("quota exceeded")
        || msg.contains("not enough space")
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;
