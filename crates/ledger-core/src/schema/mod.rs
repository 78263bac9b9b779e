//! Schema definitions
//!
//! Declarative description of each collection: its fields, their types, and
//! the foreign-key relations to other collections with their cascade policy.
//!
//! ## Modules
//!
//! - `registry`: collection name → schema map, validation, relation graph
//! - `migration`: versioned record transforms
//! - `builtin`: schemas for the built-in ERP models

pub mod builtin;
pub mod migration;
pub mod registry;

use serde::{Deserialize, Serialize};

pub use migration::{Migration, MigrationEngine};
pub use registry::{DependentEdge, SchemaRegistry};

/// The data type of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    /// Monetary amount, stored as a JSON number
    Currency,
    /// ISO 8601 date or RFC 3339 date-time string
    Date,
    Enum,
    /// Reference to another record's ID
    Id,
    Boolean,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Currency => "currency",
            FieldType::Date => "date",
            FieldType::Enum => "enum",
            FieldType::Id => "id",
            FieldType::Boolean => "boolean",
        };
        f.write_str(name)
    }
}

/// A single field in a schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    /// Allowed values. Only meaningful when the type is `Enum`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
    pub label: String,
}

impl FieldDef {
    /// Create a field with the given type; the label defaults to the name
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        let name = name.into();
        Self {
            label: name.clone(),
            name,
            field_type,
            required: false,
            enum_values: None,
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::String)
    }

    pub fn number(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Number)
    }

    pub fn currency(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Currency)
    }

    pub fn date(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Date)
    }

    pub fn id(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Id)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Boolean)
    }

    /// Shorthand for an enum field with fixed values
    pub fn enumeration<S: Into<String>>(name: impl Into<String>, values: Vec<S>) -> Self {
        let mut field = Self::new(name, FieldType::Enum);
        field.enum_values = Some(values.into_iter().map(Into::into).collect());
        field
    }

    /// Mark the field as required
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Set the display label
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

/// How the relation is oriented relative to the declaring schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RelationType {
    /// The declaring collection holds `foreign_key` pointing at the target
    BelongsTo,
    /// The target collection holds `foreign_key` pointing at the declaring one
    HasMany,
}

/// What happens to dependents when the referenced record is deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CascadePolicy {
    /// Delete dependents, transitively
    Cascade,
    /// Refuse the delete while dependents exist
    Restrict,
    /// Clear the foreign key on dependents
    Nullify,
}

/// A foreign-key relation between two collections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationDef {
    pub foreign_key: String,
    pub collection: String,
    #[serde(rename = "type")]
    pub relation_type: RelationType,
    pub cascade: CascadePolicy,
}

impl RelationDef {
    /// `foreign_key` on this collection references `collection`
    pub fn belongs_to(
        foreign_key: impl Into<String>,
        collection: impl Into<String>,
        cascade: CascadePolicy,
    ) -> Self {
        Self {
            foreign_key: foreign_key.into(),
            collection: collection.into(),
            relation_type: RelationType::BelongsTo,
            cascade,
        }
    }

    /// `foreign_key` on `collection` references this collection
    pub fn has_many(
        foreign_key: impl Into<String>,
        collection: impl Into<String>,
        cascade: CascadePolicy,
    ) -> Self {
        Self {
            foreign_key: foreign_key.into(),
            collection: collection.into(),
            relation_type: RelationType::HasMany,
            cascade,
        }
    }
}

/// Schema of one collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDef {
    /// Unique collection name
    pub collection: String,
    /// Owning application module
    pub module: String,
    /// Current schema version (>= 1)
    pub version: u32,
    pub fields: Vec<FieldDef>,
    #[serde(default)]
    pub relations: Vec<RelationDef>,
}

impl SchemaDef {
    /// Create a version 1 schema with no fields
    pub fn new(collection: impl Into<String>, module: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            module: module.into(),
            version: 1,
            fields: Vec::new(),
            relations: Vec::new(),
        }
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    pub fn relation(mut self, relation: RelationDef) -> Self {
        self.relations.push(relation);
        self
    }

    /// Look up a field by name
    pub fn find_field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// `module/collection` key used in logs
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.module, self.collection)
    }
}
