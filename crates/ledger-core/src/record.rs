//! Raw record representation
//!
//! A `Record` is the untyped JSON object that crosses the adapter boundary.
//! Typed models (see `models`) convert to and from it before validation.
//!
//! Reserved keys:
//! - `id` - unique within a collection
//! - `version` - schema version stamp (absent means 0, legacy data)
//! - `createdAt` / `updatedAt` - RFC 3339 timestamps; `updatedAt` doubles as
//!   the concurrency stamp used by the sync engine

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{StoreError, StoreResult};

/// Keys with special meaning in every record
pub mod keys {
    pub const ID: &str = "id";
    pub const VERSION: &str = "version";
    pub const CREATED_AT: &str = "createdAt";
    pub const UPDATED_AT: &str = "updatedAt";
}

/// A JSON object record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    /// Create an empty record
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Get the record ID, if it has a string ID
    pub fn id(&self) -> Option<&str> {
        self.0.get(keys::ID).and_then(Value::as_str)
    }

    /// Set the record ID
    pub fn set_id(&mut self, id: impl Into<String>) {
        self.0.insert(keys::ID.to_string(), Value::String(id.into()));
    }

    /// Schema version stamp; records without one are version 0
    pub fn version(&self) -> u32 {
        self.0
            .get(keys::VERSION)
            .and_then(Value::as_u64)
            .map(|v| v as u32)
            .unwrap_or(0)
    }

    /// Stamp the schema version
    pub fn set_version(&mut self, version: u32) {
        self.0
            .insert(keys::VERSION.to_string(), Value::from(version));
    }

    /// Last modification time, if present and parseable
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.0
            .get(keys::UPDATED_AT)
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
    }

    /// Raw `updatedAt` value as stored
    pub fn updated_at_raw(&self) -> Option<&str> {
        self.0.get(keys::UPDATED_AT).and_then(Value::as_str)
    }

    /// Set the modification time
    pub fn set_updated_at(&mut self, at: DateTime<Utc>) {
        self.0.insert(
            keys::UPDATED_AT.to_string(),
            Value::String(format_timestamp(at)),
        );
    }

    /// Get a top-level field
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Set a top-level field
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(field.into(), value.into());
    }

    /// Remove a top-level field
    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    /// Check if a top-level field is present
    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    /// Shallow-merge `changes` into this record
    ///
    /// The `id` key is never overwritten.
    pub fn merge(&mut self, changes: &Record) {
        for (key, value) in changes.0.iter() {
            if key == keys::ID {
                continue;
            }
            self.0.insert(key.clone(), value.clone());
        }
    }

    /// Iterate over fields
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Borrow the underlying map
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Convert into a JSON value
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Build a record from a JSON value; fails unless it is an object
    pub fn from_value(value: Value) -> StoreResult<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(StoreError::InvalidRecord(format!(
                "expected a JSON object, got {}",
                type_name(&other)
            ))),
        }
    }
}

impl From<Map<String, Value>> for Record {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for Record {
    type Error = StoreError;

    fn try_from(value: Value) -> StoreResult<Self> {
        Self::from_value(value)
    }
}

impl From<Record> for Value {
    fn from(record: Record) -> Self {
        record.into_value()
    }
}

/// Format a timestamp the way records store it
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored timestamp
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Name of a JSON value's type, for error messages
pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
