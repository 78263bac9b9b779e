//! Typed ERP models
//!
//! Strongly-typed views of the built-in collections. Each model converts to
//! and from the raw `Record` used at the adapter boundary; validation still
//! runs against the schema on every write.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::record::Record;
use crate::schema::builtin;

/// A record type bound to one collection
pub trait Model: Serialize + DeserializeOwned + Send + Sync {
    /// Collection this model lives in
    const COLLECTION: &'static str;

    /// Record ID, once assigned
    fn id(&self) -> Option<&str>;

    /// Convert to a raw record
    fn to_record(&self) -> StoreResult<Record> {
        Record::from_value(serde_json::to_value(self)?)
    }

    /// Convert from a raw record
    fn from_record(record: Record) -> StoreResult<Self> {
        Ok(serde_json::from_value(record.into_value())?)
    }
}

/// Kind of business entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Company,
    Person,
    Vendor,
    Customer,
}

/// A company, person, vendor or customer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    /// Parent entity; serialized as `null` when cleared
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Entity {
    pub fn new(name: impl Into<String>, entity_type: EntityType) -> Self {
        Self {
            id: None,
            name: name.into(),
            entity_type,
            email: None,
            phone: None,
            parent_id: None,
            active: true,
            version: None,
            updated_at: None,
        }
    }

    /// Nest this entity under a parent
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }
}

impl Model for Entity {
    const COLLECTION: &'static str = builtin::ENTITY;

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }
}

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Bid,
    Active,
    Complete,
    Cancelled,
}

/// A job performed for an entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub entity_id: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<f64>,
    /// ISO date (`YYYY-MM-DD`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
}

impl Job {
    pub fn new(name: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            entity_id: entity_id.into(),
            status: JobStatus::Bid,
            budget: None,
            start_date: None,
            version: None,
        }
    }
}

impl Model for Job {
    const COLLECTION: &'static str = builtin::JOB;

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }
}

fn default_true() -> bool {
    true
}

/// Require a model to carry an ID (for updates and deletes)
pub(crate) fn require_id<M: Model>(model: &M) -> StoreResult<String> {
    model
        .id()
        .map(str::to_string)
        .ok_or_else(|| StoreError::InvalidRecord(format!("{} record has no id", M::COLLECTION)))
}
