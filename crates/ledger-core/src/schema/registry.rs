//! Schema registry
//!
//! Central map of collection name → schema. Validates records, exposes the
//! relation graph used for cascade deletes, and owns the migration engine.
//!
//! The registry is shared behind an `Arc` by the store context and every
//! collection. Registration normally happens once at start-up; fields can be
//! appended later but never overwritten.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, NaiveDate};
use serde_json::Value;

use super::migration::{Migration, MigrationEngine};
use super::{CascadePolicy, FieldDef, FieldType, RelationType, SchemaDef};
use crate::error::{StoreError, StoreResult};
use crate::record::{type_name, Record};

/// A collection whose records point at another collection's records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependentEdge {
    /// Collection holding the foreign key
    pub collection: String,
    /// Field on the dependent records
    pub foreign_key: String,
    pub cascade: CascadePolicy,
}

#[derive(Default)]
struct Inner {
    schemas: HashMap<String, Arc<SchemaDef>>,
    migrations: MigrationEngine,
}

/// Registry of collection schemas
#[derive(Default)]
pub struct SchemaRegistry {
    inner: RwLock<Inner>,
}

impl SchemaRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry pre-loaded with the built-in ERP schemas
    pub fn with_builtin() -> StoreResult<Self> {
        let registry = Self::new();
        super::builtin::install(&registry)?;
        Ok(registry)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a schema
    ///
    /// Fails with `SchemaCollision` if the collection name is taken, and with
    /// `InvalidSchema`/`DuplicateField` if the schema is malformed.
    pub fn register(&self, schema: SchemaDef) -> StoreResult<()> {
        check_schema(&schema)?;

        let mut inner = self.write();
        if inner.schemas.contains_key(&schema.collection) {
            return Err(StoreError::SchemaCollision {
                collection: schema.collection,
            });
        }
        inner
            .schemas
            .insert(schema.collection.clone(), Arc::new(schema));
        Ok(())
    }

    /// Get a schema by collection name
    pub fn get(&self, collection: &str) -> Option<Arc<SchemaDef>> {
        self.read().schemas.get(collection).cloned()
    }

    /// Check if a collection is registered
    pub fn contains(&self, collection: &str) -> bool {
        self.read().schemas.contains_key(collection)
    }

    /// All registered collection names, sorted
    pub fn collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().schemas.keys().cloned().collect();
        names.sort();
        names
    }

    /// Remove every schema and migration (test isolation)
    pub fn reset(&self) {
        *self.write() = Inner::default();
    }

    /// Validate a record against its collection's schema
    ///
    /// Returns an empty list for valid records. An unknown collection yields a
    /// single error rather than failing, so callers can batch-validate.
    pub fn validate(&self, collection: &str, record: &Record) -> Vec<String> {
        match self.get(collection) {
            Some(schema) => validate_record(&schema, record),
            None => vec![format!("unknown collection: {}", collection)],
        }
    }

    /// Relations declared by a collection; empty if the collection is unknown
    pub fn relations_for(&self, collection: &str) -> Vec<super::RelationDef> {
        self.get(collection)
            .map(|schema| schema.relations.clone())
            .unwrap_or_default()
    }

    /// Collections whose records reference records of `collection`
    ///
    /// Built from `belongsTo` relations on other schemas and `hasMany`
    /// relations on `collection` itself. Duplicate edges declared from both
    /// sides are reported once.
    pub fn dependents_of(&self, collection: &str) -> Vec<DependentEdge> {
        let inner = self.read();
        let mut edges: Vec<DependentEdge> = Vec::new();

        let mut names: Vec<&String> = inner.schemas.keys().collect();
        names.sort();

        for name in names {
            let schema = &inner.schemas[name];
            for relation in &schema.relations {
                let edge = match relation.relation_type {
                    RelationType::BelongsTo if relation.collection == collection => DependentEdge {
                        collection: schema.collection.clone(),
                        foreign_key: relation.foreign_key.clone(),
                        cascade: relation.cascade,
                    },
                    RelationType::HasMany if schema.collection == collection => DependentEdge {
                        collection: relation.collection.clone(),
                        foreign_key: relation.foreign_key.clone(),
                        cascade: relation.cascade,
                    },
                    _ => continue,
                };
                let duplicate = edges.iter().any(|e| {
                    e.collection == edge.collection && e.foreign_key == edge.foreign_key
                });
                if !duplicate {
                    edges.push(edge);
                }
            }
        }
        edges
    }

    /// Append a field to a registered schema
    ///
    /// Schemas are append-only: an existing field is never replaced.
    pub fn add_field(&self, collection: &str, field: FieldDef) -> StoreResult<()> {
        let mut inner = self.write();
        let schema = inner
            .schemas
            .get_mut(collection)
            .ok_or_else(|| StoreError::UnknownCollection {
                collection: collection.to_string(),
            })?;

        if schema.find_field(&field.name).is_some() {
            return Err(StoreError::DuplicateField {
                collection: collection.to_string(),
                field: field.name,
            });
        }

        Arc::make_mut(schema).fields.push(field);
        Ok(())
    }

    /// Register a migration step for a collection
    pub fn register_migration(&self, collection: &str, migration: Migration) -> StoreResult<()> {
        let mut inner = self.write();
        if !inner.schemas.contains_key(collection) {
            return Err(StoreError::UnknownCollection {
                collection: collection.to_string(),
            });
        }
        inner.migrations.register(collection, migration)
    }

    /// Check that the migration chain from `from` to the schema version is complete
    pub fn check_migrations(&self, collection: &str, from: u32) -> StoreResult<()> {
        let inner = self.read();
        let schema = inner
            .schemas
            .get(collection)
            .ok_or_else(|| StoreError::UnknownCollection {
                collection: collection.to_string(),
            })?;
        inner.migrations.check_chain(collection, from, schema.version)
    }

    /// Migrate raw records between versions
    ///
    /// Migrating without a schema is a programming error, so an unknown
    /// collection fails rather than passing records through.
    pub fn migrate(
        &self,
        collection: &str,
        records: Vec<Record>,
        from: u32,
        to: u32,
    ) -> StoreResult<Vec<Record>> {
        let inner = self.read();
        if !inner.schemas.contains_key(collection) {
            return Err(StoreError::UnknownCollection {
                collection: collection.to_string(),
            });
        }
        inner.migrations.migrate(collection, records, from, to)
    }
}

/// Structural checks run on registration
fn check_schema(schema: &SchemaDef) -> StoreResult<()> {
    if schema.collection.trim().is_empty() {
        return Err(StoreError::InvalidSchema {
            collection: schema.collection.clone(),
            details: "collection name is empty".to_string(),
        });
    }
    if schema.version < 1 {
        return Err(StoreError::InvalidSchema {
            collection: schema.collection.clone(),
            details: "version must be at least 1".to_string(),
        });
    }

    let mut seen = std::collections::HashSet::new();
    for field in &schema.fields {
        if !seen.insert(field.name.as_str()) {
            return Err(StoreError::DuplicateField {
                collection: schema.collection.clone(),
                field: field.name.clone(),
            });
        }
        if field.field_type == FieldType::Enum
            && field.enum_values.as_ref().map_or(true, Vec::is_empty)
        {
            return Err(StoreError::InvalidSchema {
                collection: schema.collection.clone(),
                details: format!("enum field '{}' has no values", field.name),
            });
        }
    }

    for relation in &schema.relations {
        if relation.relation_type == RelationType::BelongsTo
            && schema.find_field(&relation.foreign_key).is_none()
        {
            return Err(StoreError::InvalidSchema {
                collection: schema.collection.clone(),
                details: format!(
                    "relation to '{}' uses unknown field '{}'",
                    relation.collection, relation.foreign_key
                ),
            });
        }
    }
    Ok(())
}

/// Run required, type and enum checks for every field
fn validate_record(schema: &SchemaDef, record: &Record) -> Vec<String> {
    let mut errors = Vec::new();

    for field in &schema.fields {
        let value = record.get(&field.name);
        let missing = match value {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.trim().is_empty(),
            Some(_) => false,
        };

        if missing {
            if field.required {
                errors.push(format!("{} is required", field.name));
            }
            continue;
        }

        if let Some(value) = value {
            if let Some(error) = check_type(field, value) {
                errors.push(error);
            }
        }
    }

    errors
}

fn check_type(field: &FieldDef, value: &Value) -> Option<String> {
    let ok = match field.field_type {
        FieldType::String => value.is_string(),
        FieldType::Number | FieldType::Currency => value.is_number(),
        FieldType::Boolean => value.is_boolean(),
        FieldType::Id => value.is_string() || value.is_i64() || value.is_u64(),
        FieldType::Date => value.as_str().is_some_and(is_date),
        FieldType::Enum => {
            let Some(s) = value.as_str() else {
                return Some(format!("{} must be a string, got {}", field.name, type_name(value)));
            };
            let allowed = field.enum_values.as_deref().unwrap_or_default();
            if allowed.iter().any(|v| v == s) {
                true
            } else {
                return Some(format!(
                    "{} must be one of: {}",
                    field.name,
                    allowed.join(", ")
                ));
            }
        }
    };

    if ok {
        None
    } else {
        Some(format!(
            "{} must be a {}, got {}",
            field.name,
            field.field_type,
            type_name(value)
        ))
    }
}

fn is_date(s: &str) -> bool {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok() || DateTime::parse_from_rfc3339(s).is_ok()
}
