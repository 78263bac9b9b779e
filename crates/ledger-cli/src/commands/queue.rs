//! Sync queue command handlers

use anyhow::{bail, Context, Result};

use ledger_core::sync::CompositeAdapter;
use ledger_core::Store;

use crate::output::Output;

fn composite(store: &Store) -> Result<&CompositeAdapter> {
    store.composite().map(|c| c.as_ref()).context(
        "Sync is not configured. Enable it with:\n  \
         ledger config set remote_url https://api.example.com\n  \
         ledger config set sync_enabled true",
    )
}

/// List queued mutations
pub async fn list(store: &Store, failed_only: bool, output: &Output) -> Result<()> {
    let mut entries = composite(store)?.queue_entries().await;
    if failed_only {
        entries.retain(|e| e.is_failed());
    }
    output.print_queue(&entries);
    Ok(())
}

/// Requeue failed entries
pub async fn retry(store: &Store, output: &Output) -> Result<()> {
    let count = composite(store)?.retry_failed().await?;
    output.success(&format!("Requeued {} failed entr(ies)", count));
    Ok(())
}

/// Drop a queued entry by ID or unique prefix
pub async fn discard(store: &Store, id: String, output: &Output) -> Result<()> {
    let composite = composite(store)?;
    let matches: Vec<String> = composite
        .queue_entries()
        .await
        .into_iter()
        .filter(|e| e.id.starts_with(&id))
        .map(|e| e.id)
        .collect();

    let entry_id = match matches.as_slice() {
        [one] => one.clone(),
        [] => bail!("No queued entry matches '{}'", id),
        _ => bail!("'{}' matches {} entries; use a longer prefix", id, matches.len()),
    };

    match composite.discard(&entry_id).await? {
        Some(entry) => output.success(&format!(
            "Discarded {} of {}/{}",
            entry.action, entry.collection, entry.record_id
        )),
        None => bail!("Entry {} is no longer queued", entry_id),
    }
    Ok(())
}

/// Show resolved conflicts
pub async fn conflicts(store: &Store, collection: Option<String>, output: &Output) -> Result<()> {
    let mut conflicts = composite(store)?.conflicts().await;
    if let Some(ref collection) = collection {
        conflicts.retain(|c| &c.collection == collection);
    }
    output.print_conflicts(&conflicts);
    Ok(())
}
