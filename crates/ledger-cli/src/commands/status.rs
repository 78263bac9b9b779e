//! Status command handler

use anyhow::Result;

use ledger_core::Store;

use crate::output::{Output, OutputFormat};

/// Show store and sync status
pub async fn show(store: &Store, output: &Output) -> Result<()> {
    let config = store.config();
    let (pending, failed, conflicts) = match store.composite() {
        Some(composite) => (
            composite.pending_count().await,
            composite.failed_count().await,
            composite.conflicts().await.len(),
        ),
        None => (0, 0, 0),
    };

    let mut counts = Vec::new();
    for name in store.registry().collections() {
        let count = match store.collection(&name) {
            Ok(collection) => collection.count(Vec::new()).await.ok(),
            Err(_) => None,
        };
        counts.push((name, count));
    }

    match output.format {
        OutputFormat::Json => {
            let collections: serde_json::Map<String, serde_json::Value> = counts
                .iter()
                .map(|(name, count)| (name.clone(), serde_json::json!(count)))
                .collect();
            println!(
                "{}",
                serde_json::json!({
                    "backend": store.local_adapter().name(),
                    "data_dir": config.data_dir,
                    "sync_enabled": store.composite().is_some(),
                    "remote_url": config.remote_url,
                    "user_id": config.user_id,
                    "queue": {
                        "pending": pending,
                        "failed": failed
                    },
                    "conflicts": conflicts,
                    "collections": collections,
                    "unavailable": store.unavailable().keys().collect::<Vec<_>>()
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", pending);
        }
        OutputFormat::Human => {
            println!("Ledger Status");
            println!("=============");
            println!();
            println!("Storage:");
            println!("  Backend:  {}", store.local_adapter().name());
            println!("  Location: {}", config.data_dir.display());
            println!();
            println!("Sync:");
            if store.composite().is_some() {
                println!("  Status:    enabled");
                if let Some(ref url) = config.remote_url {
                    println!("  Remote:    {}", url);
                }
                if let Some(ref user) = config.user_id {
                    println!("  User:      {}", user);
                }
                println!("  Pending:   {}", pending);
                println!("  Failed:    {}", failed);
                println!("  Conflicts: {}", conflicts);
            } else {
                println!("  Status:    disabled");
            }
            println!();
            println!("Collections:");
            for (name, count) in &counts {
                match count {
                    Some(count) => println!("  {:<12} {}", name, count),
                    None => println!("  {:<12} unavailable", name),
                }
            }
        }
    }

    Ok(())
}
