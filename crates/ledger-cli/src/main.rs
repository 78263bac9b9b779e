//! Ledger CLI
//!
//! Operator command-line interface for the Ledger record store: inspect
//! schemas, edit records, and watch or drive the offline sync queue.

use std::fs::OpenOptions;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use ledger_core::{Config, Store};

mod commands;
mod output;

use commands::record::QueryArgs;
use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "ledger")]
#[command(about = "Ledger - offline-first ERP record store")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show store and sync status
    Status,
    /// Inspect registered schemas
    Schema {
        #[command(subcommand)]
        command: SchemaCommands,
    },
    /// Create, read, update and delete records
    Record {
        #[command(subcommand)]
        command: RecordCommands,
    },
    /// Inspect and manage the sync queue
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
    /// Show resolved sync conflicts
    Conflicts {
        /// Only conflicts in this collection
        #[arg(short, long)]
        collection: Option<String>,
    },
    /// Drain the sync queue and pull remote changes
    Sync,
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
enum SchemaCommands {
    /// List registered collections
    #[command(alias = "ls")]
    List,
    /// Show fields and relations of a collection
    Show {
        /// Collection name
        collection: String,
    },
}

#[derive(Subcommand)]
enum RecordCommands {
    /// Insert a record from a JSON object
    #[command(alias = "add")]
    Insert {
        /// Collection name
        collection: String,
        /// Record as a JSON object
        json: String,
    },
    /// Show a record
    Get {
        /// Collection name
        collection: String,
        /// Record ID
        id: String,
    },
    /// Merge a JSON object into a record
    Update {
        /// Collection name
        collection: String,
        /// Record ID
        id: String,
        /// Changes as a JSON object
        json: String,
    },
    /// Remove a record (relation policies apply)
    #[command(alias = "rm")]
    Remove {
        /// Collection name
        collection: String,
        /// Record ID
        id: String,
    },
    /// Query a collection
    Query {
        /// Collection name
        collection: String,
        /// Filter expression, e.g. status=active or budget>=1000 (repeatable)
        #[arg(short = 'w', long = "where")]
        filters: Vec<String>,
        /// Field to sort by
        #[arg(short, long)]
        sort: Option<String>,
        /// Sort descending
        #[arg(long, requires = "sort")]
        desc: bool,
        /// Maximum number of records
        #[arg(short, long)]
        limit: Option<usize>,
        /// Records to skip
        #[arg(long)]
        offset: Option<usize>,
    },
    /// Count records matching the filters
    Count {
        /// Collection name
        collection: String,
        /// Filter expression (repeatable)
        #[arg(short = 'w', long = "where")]
        filters: Vec<String>,
    },
}

#[derive(Subcommand)]
enum QueueCommands {
    /// List queued mutations
    #[command(alias = "ls")]
    List {
        /// Only entries that exhausted their retries
        #[arg(long)]
        failed: bool,
    },
    /// Move failed entries back to pending
    Retry,
    /// Drop a queued entry
    Discard {
        /// Entry ID (full UUID or prefix)
        id: String,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (remote_url, sync_enabled, local_backend, sync.max_attempts, ...)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));

    // Config commands work even when the store cannot open
    if let Commands::Config { command } = &cli.command {
        return handle_config_command(command.clone(), &output);
    }

    let config = Config::load().context("Failed to load configuration")?;
    init_logging(&config);

    let store = Store::open_with_config(config)
        .await
        .context("Failed to open store")?;

    let is_write = matches!(
        &cli.command,
        Commands::Record {
            command: RecordCommands::Insert { .. }
                | RecordCommands::Update { .. }
                | RecordCommands::Remove { .. }
        }
    );

    let result = match cli.command {
        Commands::Status => commands::status::show(&store, &output).await,
        Commands::Schema { command } => handle_schema_command(command, &store, &output),
        Commands::Record { command } => handle_record_command(command, &store, &output).await,
        Commands::Queue { command } => handle_queue_command(command, &store, &output).await,
        Commands::Conflicts { collection } => {
            commands::queue::conflicts(&store, collection, &output).await
        }
        Commands::Sync => commands::sync::sync(&store, &output).await,
        Commands::Config { .. } => unreachable!(), // Handled above
    };

    // Push writes right away instead of waiting for the next sync
    if is_write && result.is_ok() {
        auto_sync(&store, &output).await;
    }

    store.teardown().await?;
    result
}

fn handle_schema_command(command: SchemaCommands, store: &Store, output: &Output) -> Result<()> {
    match command {
        SchemaCommands::List => commands::schema::list(store, output),
        SchemaCommands::Show { collection } => commands::schema::show(store, collection, output),
    }
}

async fn handle_record_command(
    command: RecordCommands,
    store: &Store,
    output: &Output,
) -> Result<()> {
    match command {
        RecordCommands::Insert { collection, json } => {
            commands::record::insert(store, collection, json, output).await
        }
        RecordCommands::Get { collection, id } => {
            commands::record::get(store, collection, id, output).await
        }
        RecordCommands::Update {
            collection,
            id,
            json,
        } => commands::record::update(store, collection, id, json, output).await,
        RecordCommands::Remove { collection, id } => {
            commands::record::remove(store, collection, id, output).await
        }
        RecordCommands::Query {
            collection,
            filters,
            sort,
            desc,
            limit,
            offset,
        } => {
            let args = QueryArgs {
                filters,
                sort,
                desc,
                limit,
                offset,
            };
            commands::record::query(store, collection, args, output).await
        }
        RecordCommands::Count {
            collection,
            filters,
        } => commands::record::count(store, collection, filters, output).await,
    }
}

async fn handle_queue_command(command: QueueCommands, store: &Store, output: &Output) -> Result<()> {
    match command {
        QueueCommands::List { failed } => commands::queue::list(store, failed, output).await,
        QueueCommands::Retry => commands::queue::retry(store, output).await,
        QueueCommands::Discard { id } => commands::queue::discard(store, id, output).await,
    }
}

fn handle_config_command(command: Option<ConfigCommands>, output: &Output) -> Result<()> {
    match command {
        Some(ConfigCommands::Show) | None => commands::config::show(output),
        Some(ConfigCommands::Set { key, value }) => commands::config::set(key, value, output),
    }
}

/// Initialize logging
///
/// `RUST_LOG` wins over the configured level. Logs go to `log_file` when
/// set, otherwise to stderr.
fn init_logging(config: &Config) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "ledger_core={},ledger_cli={}",
            config.log_level, config.log_level
        ))
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);

    // Ignore the error if a subscriber is already installed
    match config.log_file {
        Some(ref path) => {
            let file = match OpenOptions::new().create(true).append(true).open(path) {
                Ok(f) => f,
                Err(e) => {
                    eprintln!("Warning: Could not open log file {:?}: {}", path, e);
                    return;
                }
            };
            let _ = builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
        None => {
            let _ = builder.with_writer(std::io::stderr).try_init();
        }
    }
}

/// Drain the queue once if sync is configured, reporting failures only
async fn auto_sync(store: &Store, output: &Output) {
    let Some(composite) = store.composite() else {
        return;
    };

    match composite.drain().await {
        Ok(report) if !report.is_clean() && !output.is_quiet() => {
            eprintln!(
                "⚠ {} change(s) waiting to sync",
                report.retried + report.deferred + report.failed
            );
        }
        Ok(report) => debug!("Auto-sync pushed {} change(s)", report.synced),
        Err(e) => {
            if !output.is_quiet() {
                eprintln!("⚠ Auto-sync failed: {}", e);
            }
        }
    }
}
