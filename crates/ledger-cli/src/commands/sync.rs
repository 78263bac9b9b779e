//! Sync command handler

use anyhow::{bail, Result};

use ledger_core::Store;

use crate::output::Output;

/// Drain the queue and pull from the remote
pub async fn sync(store: &Store, output: &Output) -> Result<()> {
    let config = store.config();

    if !config.sync_enabled {
        bail!(
            "Sync is not enabled. Enable it with:\n  \
             ledger config set sync_enabled true\n  \
             ledger config set remote_url https://api.example.com"
        );
    }

    if config.remote_url.is_none() {
        bail!(
            "Remote URL not configured. Set it with:\n  \
             ledger config set remote_url https://api.example.com"
        );
    }

    output.message("Syncing with remote...");
    let summary = store.sync_now().await?;
    let report = &summary.drain;

    if output.is_json() {
        println!(
            "{}",
            serde_json::json!({
                "drain": report,
                "pulled": summary.pulled
            })
        );
        return Ok(());
    }

    if report.is_clean() {
        output.success("Sync complete - queue drained");
    } else {
        output.message("Sync finished with entries left in the queue");
    }
    output.message(&format!(
        "  Pushed: {}, Pulled: {}, Conflicts: {}",
        report.synced, summary.pulled, report.conflicts
    ));
    if report.retried + report.deferred > 0 {
        output.message(&format!(
            "  Waiting for retry: {}",
            report.retried + report.deferred
        ));
    }
    if report.failed > 0 {
        output.message(&format!(
            "  Failed: {} (see `ledger queue list --failed`)",
            report.failed
        ));
    }
    Ok(())
}
