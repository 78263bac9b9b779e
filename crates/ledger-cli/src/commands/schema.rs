//! Schema command handlers

use anyhow::{Context, Result};

use ledger_core::Store;

use crate::output::{Output, OutputFormat};

/// List registered collections
pub fn list(store: &Store, output: &Output) -> Result<()> {
    let registry = store.registry();
    let schemas: Vec<_> = registry
        .collections()
        .iter()
        .filter_map(|name| registry.get(name))
        .collect();

    match output.format {
        OutputFormat::Json => {
            let rows: Vec<_> = schemas
                .iter()
                .map(|s| {
                    serde_json::json!({
                        "collection": s.collection,
                        "module": s.module,
                        "version": s.version,
                        "fields": s.fields.len(),
                        "available": !store.unavailable().contains_key(&s.collection),
                    })
                })
                .collect();
            output.print_json(&rows);
        }
        OutputFormat::Quiet => {
            for schema in &schemas {
                println!("{}", schema.collection);
            }
        }
        OutputFormat::Human => {
            for schema in &schemas {
                let marker = if store.unavailable().contains_key(&schema.collection) {
                    " (unavailable)"
                } else {
                    ""
                };
                println!(
                    "{:<12} {:<8} v{}  {} field(s){}",
                    schema.collection,
                    schema.module,
                    schema.version,
                    schema.fields.len(),
                    marker
                );
            }
            println!("\n{} collection(s)", schemas.len());
        }
    }
    Ok(())
}

/// Show one schema
pub fn show(store: &Store, collection: String, output: &Output) -> Result<()> {
    let schema = store
        .registry()
        .get(&collection)
        .with_context(|| format!("Unknown collection: {}", collection))?;
    output.print_schema(&schema);
    Ok(())
}
