//! Config command handlers

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use pantry_core::{Config, ConflictStrategy, SyncConfigPatch};

use crate::output::{Output, OutputFormat};

const VALID_KEYS: &str = "data_dir, remote_url, log_file, auto_sync_enabled, sync_interval_ms, \
     conflict_resolution, max_retries, batch_size, request_timeout_ms, initial_backoff_ms, \
     max_backoff_ms";

/// Show current configuration
pub fn show(config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => output.json(&config),
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            let effective_path = config_path
                .cloned()
                .unwrap_or_else(Config::config_file_path);
            let sync = &config.sync;
            println!("Configuration:");
            println!("  data_dir:            {}", config.data_dir.display());
            println!(
                "  remote_url:          {}",
                config.remote_url.as_deref().unwrap_or("(not set)")
            );
            println!(
                "  log_file:            {}",
                config
                    .log_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(not set)".to_string())
            );
            println!();
            println!("Sync:");
            println!("  auto_sync_enabled:   {}", sync.auto_sync_enabled);
            println!("  sync_interval_ms:    {}", sync.sync_interval_ms);
            println!("  conflict_resolution: {}", sync.conflict_resolution.as_str());
            println!("  max_retries:         {}", sync.max_retries);
            println!("  batch_size:          {}", sync.batch_size);
            println!("  request_timeout_ms:  {}", sync.request_timeout_ms);
            println!("  initial_backoff_ms:  {}", sync.initial_backoff_ms);
            println!("  max_backoff_ms:      {}", sync.max_backoff_ms);
            println!();
            println!("Config file: {}", effective_path.display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(
    key: String,
    value: String,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    let mut config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    match key.as_str() {
        "data_dir" => {
            config.data_dir = value.clone().into();
        }
        "remote_url" => {
            config.remote_url = optional(&value);
        }
        "log_file" => {
            config.log_file = optional(&value).map(PathBuf::from);
        }
        _ => {
            let patch = sync_patch(&key, &value)?;
            config
                .sync
                .apply(&patch)
                .with_context(|| format!("Invalid value for {}", key))?;
        }
    }

    // Save to the CLI-specified path or default
    let save_path = config_path
        .cloned()
        .unwrap_or_else(Config::config_file_path);
    config
        .save_to_path(&save_path)
        .context("Failed to save configuration")?;

    output.success(&format!("Set {} = {}", key, value));

    Ok(())
}

fn optional(value: &str) -> Option<String> {
    if value.is_empty() || value == "none" {
        None
    } else {
        Some(value.to_string())
    }
}

/// Partial sync config update for one `key = value`
fn sync_patch(key: &str, value: &str) -> Result<SyncConfigPatch> {
    let mut patch = SyncConfigPatch::default();

    match key {
        "auto_sync_enabled" => {
            patch.auto_sync_enabled = Some(
                value
                    .parse()
                    .context("Invalid value for auto_sync_enabled. Use 'true' or 'false'.")?,
            );
        }
        "sync_interval_ms" => patch.sync_interval_ms = Some(number(key, value)?),
        "conflict_resolution" => {
            patch.conflict_resolution = Some(value.parse::<ConflictStrategy>()?);
        }
        "max_retries" => patch.max_retries = Some(number(key, value)?),
        "batch_size" => patch.batch_size = Some(number(key, value)?),
        "request_timeout_ms" => patch.request_timeout_ms = Some(number(key, value)?),
        "initial_backoff_ms" => patch.initial_backoff_ms = Some(number(key, value)?),
        "max_backoff_ms" => patch.max_backoff_ms = Some(number(key, value)?),
        _ => {
            bail!(
                "Unknown configuration key: '{}'\nValid keys: {}",
                key,
                VALID_KEYS
            );
        }
    }

    Ok(patch)
}

fn number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    match value.parse() {
        Ok(n) => Ok(n),
        Err(_) => bail!("Invalid value for {}: expected a number, got '{}'", key, value),
    }
}
