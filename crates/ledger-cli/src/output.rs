//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use serde::Serialize;
use serde_json::Value;

use ledger_core::sync::{ConflictRecord, SyncQueueEntry};
use ledger_core::{Record, SchemaDef};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Check if output is in quiet mode
    pub fn is_quiet(&self) -> bool {
        matches!(self.format, OutputFormat::Quiet)
    }

    pub fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Print any serializable value as pretty JSON
    pub fn print_json<T: Serialize + ?Sized>(&self, value: &T) {
        match serde_json::to_string_pretty(value) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Failed to serialize output: {}", e),
        }
    }

    /// Print a single record
    pub fn print_record(&self, record: &Record) {
        match self.format {
            OutputFormat::Human => {
                let width = record.iter().map(|(k, _)| k.len()).max().unwrap_or(0) + 1;
                for (key, value) in record.iter() {
                    println!("{:<width$} {}", format!("{}:", key), display_value(value));
                }
            }
            OutputFormat::Json => self.print_json(record),
            OutputFormat::Quiet => {
                println!("{}", record.id().unwrap_or_default());
            }
        }
    }

    /// Print a list of records
    pub fn print_records(&self, records: &[Record]) {
        match self.format {
            OutputFormat::Human => {
                if records.is_empty() {
                    println!("No records found.");
                    return;
                }
                for record in records {
                    let summary: Vec<String> = record
                        .iter()
                        .filter(|(k, _)| !is_meta_key(k))
                        .map(|(k, v)| format!("{}={}", k, display_value(v)))
                        .collect();
                    println!(
                        "{} | {}",
                        short_id(record.id().unwrap_or_default()),
                        truncate(&summary.join(" "), 70)
                    );
                }
                println!("\n{} record(s)", records.len());
            }
            OutputFormat::Json => self.print_json(records),
            OutputFormat::Quiet => {
                for record in records {
                    println!("{}", record.id().unwrap_or_default());
                }
            }
        }
    }

    /// Print a schema definition
    pub fn print_schema(&self, schema: &SchemaDef) {
        match self.format {
            OutputFormat::Human => {
                println!("Collection: {}", schema.collection);
                println!("Module:     {}", schema.module);
                println!("Version:    {}", schema.version);
                println!();
                println!("── Fields ({}) ──", schema.fields.len());
                for field in &schema.fields {
                    let mut line = format!("{:<14} {:<9}", field.name, field.field_type.to_string());
                    if field.required {
                        line.push_str(" required");
                    }
                    if let Some(ref values) = field.enum_values {
                        line.push_str(&format!(" [{}]", values.join(", ")));
                    }
                    println!("{}", line);
                }
                if !schema.relations.is_empty() {
                    println!();
                    println!("── Relations ({}) ──", schema.relations.len());
                    for relation in &schema.relations {
                        println!(
                            "{} {} -> {} (on delete: {})",
                            label(&relation.relation_type),
                            relation.foreign_key,
                            relation.collection,
                            label(&relation.cascade)
                        );
                    }
                }
            }
            OutputFormat::Json => self.print_json(schema),
            OutputFormat::Quiet => println!("{}", schema.collection),
        }
    }

    /// Print queued sync entries
    pub fn print_queue(&self, entries: &[SyncQueueEntry]) {
        match self.format {
            OutputFormat::Human => {
                if entries.is_empty() {
                    println!("Sync queue is empty.");
                    return;
                }
                for entry in entries {
                    let mut line = format!(
                        "{} | {:<7} {:<6} {}/{} | attempts {}",
                        short_id(&entry.id),
                        label(&entry.status),
                        entry.action.to_string(),
                        entry.collection,
                        short_id(&entry.record_id),
                        entry.attempts
                    );
                    if let Some(ref error) = entry.last_error {
                        line.push_str(&format!(" | {}", truncate(error, 40)));
                    }
                    println!("{}", line);
                }
                println!("\n{} entr(ies)", entries.len());
            }
            OutputFormat::Json => self.print_json(entries),
            OutputFormat::Quiet => {
                for entry in entries {
                    println!("{}", entry.id);
                }
            }
        }
    }

    /// Print resolved conflicts
    pub fn print_conflicts(&self, conflicts: &[ConflictRecord]) {
        match self.format {
            OutputFormat::Human => {
                if conflicts.is_empty() {
                    println!("No conflicts recorded.");
                    return;
                }
                for conflict in conflicts {
                    println!(
                        "[{}] {}/{} {} -> {} wins",
                        conflict.resolved_at.format("%Y-%m-%d %H:%M"),
                        conflict.collection,
                        short_id(&conflict.record_id),
                        label(&conflict.kind),
                        label(&conflict.resolution)
                    );
                }
                println!("\n{} conflict(s)", conflicts.len());
            }
            OutputFormat::Json => self.print_json(conflicts),
            OutputFormat::Quiet => {
                for conflict in conflicts {
                    println!("{}", conflict.id);
                }
            }
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

/// Bookkeeping keys hidden from list summaries
fn is_meta_key(key: &str) -> bool {
    matches!(key, "id" | "version" | "createdAt" | "updatedAt")
}

/// Render a JSON value without quoting plain strings
fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "-".to_string(),
        other => other.to_string(),
    }
}

/// Serialized name of a unit enum (`cascade`, `belongsTo`, ...)
fn label<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(Value::String(s)) => s,
        Ok(other) => other.to_string(),
        Err(_) => "?".to_string(),
    }
}

/// First 8 characters of an ID
fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// Truncate a string to max length, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
