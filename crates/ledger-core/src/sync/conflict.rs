//! Conflict audit log
//!
//! Every conflict the sync engine resolves is appended here together with
//! both versions of the record, so the losing side is never silently
//! discarded even though records are not merged field by field.

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreResult;
use crate::record::Record;
use crate::storage::atomic_write;

/// What collided
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictKind {
    /// Local update against a remote record changed since the base stamp
    UpdateUpdate,
    /// Local insert against a different remote record with the same id
    InsertInsert,
    /// Delete on one side against an update on the other: a local delete
    /// of a remote record changed since the base stamp, or a local update
    /// of a record deleted remotely
    DeleteUpdate,
}

/// Which side won
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Local,
    Remote,
}

/// One resolved conflict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub id: String,
    pub collection: String,
    pub record_id: String,
    pub kind: ConflictKind,
    pub resolution: Resolution,
    /// Surviving version (`None` when a delete won)
    pub winner: Option<Record>,
    /// Pre-conflict value of the losing side (`None` when a delete lost
    /// nothing but the deletion itself)
    pub loser: Option<Record>,
    pub local_stamp: Option<String>,
    pub remote_stamp: Option<String>,
    pub resolved_at: DateTime<Utc>,
}

impl ConflictRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        collection: impl Into<String>,
        record_id: impl Into<String>,
        kind: ConflictKind,
        resolution: Resolution,
        winner: Option<Record>,
        loser: Option<Record>,
        local_stamp: Option<String>,
        remote_stamp: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            collection: collection.into(),
            record_id: record_id.into(),
            kind,
            resolution,
            winner,
            loser,
            local_stamp,
            remote_stamp,
            resolved_at: Utc::now(),
        }
    }
}

/// Persistent append-only conflict log
#[derive(Debug, Default)]
pub struct ConflictLog {
    records: Vec<ConflictRecord>,
    path: Option<PathBuf>,
}

impl ConflictLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a log that persists to disk
    pub fn with_path(path: PathBuf) -> StoreResult<Self> {
        let mut log = Self {
            records: Vec::new(),
            path: Some(path.clone()),
        };
        if path.exists() {
            let json = fs::read_to_string(&path)?;
            log.records = serde_json::from_str(&json)?;
        }
        Ok(log)
    }

    /// Append a resolved conflict
    pub fn append(&mut self, record: ConflictRecord) -> StoreResult<()> {
        self.records.push(record);
        self.save()
    }

    /// All conflicts, oldest first
    pub fn records(&self) -> &[ConflictRecord] {
        &self.records
    }

    /// Conflicts for one record
    pub fn for_record(&self, collection: &str, record_id: &str) -> Vec<&ConflictRecord> {
        self.records
            .iter()
            .filter(|c| c.collection == collection && c.record_id == record_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn save(&self) -> StoreResult<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(&self.records)?;
        atomic_write(path, json.as_bytes())
    }
}
