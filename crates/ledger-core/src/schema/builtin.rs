//! Built-in ERP schemas
//!
//! - `entity/entity` - companies, people, vendors and customers; entities can
//!   be nested through `parentId`
//! - `jobs/job` - jobs performed for an entity
//! - `payroll/employee` - employees of an entity
//! - `payroll/time_entry` - hours logged by an employee, optionally on a job

use super::migration::Migration;
use super::registry::SchemaRegistry;
use super::{CascadePolicy, FieldDef, RelationDef, SchemaDef};
use crate::error::StoreResult;

pub const ENTITY: &str = "entity";
pub const JOB: &str = "job";
pub const EMPLOYEE: &str = "employee";
pub const TIME_ENTRY: &str = "time_entry";

/// Entity types
pub const ENTITY_TYPES: [&str; 4] = ["company", "person", "vendor", "customer"];

/// Job states
pub const JOB_STATUSES: [&str; 4] = ["bid", "active", "complete", "cancelled"];

pub fn entity_schema() -> SchemaDef {
    SchemaDef::new(ENTITY, "entity")
        .version(2)
        .field(FieldDef::string("name").required().label("Name"))
        .field(
            FieldDef::enumeration("type", ENTITY_TYPES.to_vec())
                .required()
                .label("Type"),
        )
        .field(FieldDef::string("email").label("Email"))
        .field(FieldDef::string("phone").label("Phone"))
        .field(FieldDef::id("parentId").label("Parent"))
        .field(FieldDef::boolean("active").label("Active"))
        .relation(RelationDef::belongs_to(
            "parentId",
            ENTITY,
            CascadePolicy::Nullify,
        ))
}

pub fn job_schema() -> SchemaDef {
    SchemaDef::new(JOB, "jobs")
        .field(FieldDef::string("name").required().label("Job name"))
        .field(FieldDef::id("entityId").required().label("Customer"))
        .field(
            FieldDef::enumeration("status", JOB_STATUSES.to_vec())
                .required()
                .label("Status"),
        )
        .field(FieldDef::currency("budget").label("Budget"))
        .field(FieldDef::date("startDate").label("Start date"))
        .relation(RelationDef::belongs_to(
            "entityId",
            ENTITY,
            CascadePolicy::Restrict,
        ))
}

pub fn employee_schema() -> SchemaDef {
    SchemaDef::new(EMPLOYEE, "payroll")
        .field(FieldDef::string("firstName").required().label("First name"))
        .field(FieldDef::string("lastName").required().label("Last name"))
        .field(FieldDef::id("entityId").required().label("Employer"))
        .field(FieldDef::enumeration("payType", vec!["hourly", "salary"]).label("Pay type"))
        .field(FieldDef::currency("rate").label("Rate"))
        .field(FieldDef::date("hiredOn").label("Hired on"))
        .relation(RelationDef::belongs_to(
            "entityId",
            ENTITY,
            CascadePolicy::Cascade,
        ))
        .relation(RelationDef::has_many(
            "employeeId",
            TIME_ENTRY,
            CascadePolicy::Cascade,
        ))
}

pub fn time_entry_schema() -> SchemaDef {
    SchemaDef::new(TIME_ENTRY, "payroll")
        .field(FieldDef::id("employeeId").required().label("Employee"))
        .field(FieldDef::id("jobId").label("Job"))
        .field(FieldDef::date("date").required().label("Date"))
        .field(FieldDef::number("hours").required().label("Hours"))
        .relation(RelationDef::belongs_to(
            "employeeId",
            EMPLOYEE,
            CascadePolicy::Cascade,
        ))
        .relation(RelationDef::belongs_to("jobId", JOB, CascadePolicy::Nullify))
}

/// Register the built-in schemas and their migration chains
pub fn install(registry: &SchemaRegistry) -> StoreResult<()> {
    registry.register(entity_schema())?;
    registry.register(job_schema())?;
    registry.register(employee_schema())?;
    registry.register(time_entry_schema())?;

    registry.register_migration(
        ENTITY,
        Migration::new(0, "stamp legacy entities as active", |mut record| {
            if !record.contains("active") {
                record.set("active", true);
            }
            Ok(record)
        }),
    )?;
    registry.register_migration(
        ENTITY,
        Migration::new(1, "rename kind to type", |mut record| {
            if let Some(kind) = record.remove("kind") {
                record.set("type", kind);
            }
            Ok(record)
        }),
    )?;

    for collection in [JOB, EMPLOYEE, TIME_ENTRY] {
        registry.register_migration(
            collection,
            Migration::new(0, "stamp legacy records", Ok),
        )?;
    }

    Ok(())
}
