//! Config command handlers

use anyhow::{Context, Result};

use ledger_core::Config;

use crate::output::{Output, OutputFormat};

/// Show current configuration
pub fn show(output: &Output) -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => output.print_json(&config),
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            let unset = || "(not set)".to_string();
            println!("Configuration:");
            println!("  data_dir:            {}", config.data_dir.display());
            println!("  local_backend:       {}", config.local_backend);
            println!("  storage_quota_bytes: {}", config.storage_quota_bytes);
            println!(
                "  remote_url:          {}",
                config.remote_url.clone().unwrap_or_else(unset)
            );
            println!("  sync_enabled:        {}", config.sync_enabled);
            println!(
                "  user_id:             {}",
                config.user_id.clone().unwrap_or_else(unset)
            );
            println!(
                "  log_file:            {}",
                config
                    .log_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(unset)
            );
            println!("  log_level:           {}", config.log_level);
            println!();
            println!("Sync:");
            println!("  sync.max_attempts:         {}", config.sync.max_attempts);
            println!("  sync.initial_backoff_ms:   {}", config.sync.initial_backoff_ms);
            println!("  sync.max_backoff_ms:       {}", config.sync.max_backoff_ms);
            println!("  sync.pull_interval_secs:   {}", config.sync.pull_interval_secs);
            println!("  sync.request_timeout_secs: {}", config.sync.request_timeout_secs);
            println!();
            println!("Config file: {}", Config::config_file_path().display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(key: String, value: String, output: &Output) -> Result<()> {
    let path = Config::config_file_path();
    let mut config = Config::load_from_path(&path).context("Failed to load configuration")?;

    config.set_value(&key, &value).with_context(|| {
        format!(
            "Invalid setting '{}'.\n\
             Valid keys: data_dir, local_backend, storage_quota_bytes, remote_url, \
             sync_enabled, user_id, log_file, log_level, sync.*",
            key
        )
    })?;

    config
        .save_to_path(&path)
        .context("Failed to save configuration")?;

    output.success(&format!("Set {} = {}", key, value));
    Ok(())
}
