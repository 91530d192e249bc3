//! Config command handlers

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use fieldsync_core::Config;

use crate::output::{print_json, Output, OutputFormat};

/// Show current configuration
pub fn show(config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => print_json(&config),
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            let effective_path = config_path
                .cloned()
                .unwrap_or_else(Config::config_file_path);
            println!("Configuration:");
            println!("  data_dir:               {}", config.data_dir.display());
            println!("  remote_path:            {}", config.remote_path().display());
            println!("  sync_enabled:           {}", config.sync_enabled);
            println!("  force_offline:          {}", config.force_offline);
            println!("  log_file:               {}", display_opt(&config.log_file));
            println!("  retry.base_delay_ms:    {}", config.retry.base_delay_ms);
            println!("  retry.multiplier:       {}", config.retry.multiplier);
            println!("  retry.max_attempts:     {}", config.retry.max_attempts);
            println!(
                "  retry.max_delay_ms:     {}",
                config
                    .retry
                    .max_delay_ms
                    .map(|ms| ms.to_string())
                    .unwrap_or_else(|| "(not set)".to_string())
            );
            println!("  attempt_timeout_ms:     {}", config.attempt_timeout_ms);
            println!("  pull_batch_size:        {}", config.pull_batch_size);
            println!("  push_batch_size:        {}", config.push_batch_size);
            println!("  sync_interval_secs:     {}", config.sync_interval_secs);
            println!("  reachability_poll_secs: {}", config.reachability_poll_secs);
            println!("  flap_window_secs:       {}", config.flap_window_secs);
            println!("  flap_threshold:         {}", config.flap_threshold);
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

    apply(&mut config, &key, &value)?;

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

fn apply(config: &mut Config, key: &str, value: &str) -> Result<()> {
    let invalid = || format!("Invalid value for {}: '{}'", key, value);
    match key {
        "data_dir" => config.data_dir = value.into(),
        "remote_path" => config.remote_path = optional_path(value),
        "log_file" => config.log_file = optional_path(value),
        "sync_enabled" => config.sync_enabled = value.parse().with_context(invalid)?,
        "force_offline" => config.force_offline = value.parse().with_context(invalid)?,
        "retry.base_delay_ms" => config.retry.base_delay_ms = value.parse().with_context(invalid)?,
        "retry.multiplier" => config.retry.multiplier = value.parse().with_context(invalid)?,
        "retry.max_attempts" => config.retry.max_attempts = value.parse().with_context(invalid)?,
        "retry.max_delay_ms" => {
            config.retry.max_delay_ms = if value.is_empty() || value == "none" {
                None
            } else {
                Some(value.parse().with_context(invalid)?)
            };
        }
        "attempt_timeout_ms" => config.attempt_timeout_ms = value.parse().with_context(invalid)?,
        "pull_batch_size" => config.pull_batch_size = value.parse().with_context(invalid)?,
        "push_batch_size" => config.push_batch_size = value.parse().with_context(invalid)?,
        "sync_interval_secs" => config.sync_interval_secs = value.parse().with_context(invalid)?,
        "reachability_poll_secs" => {
            config.reachability_poll_secs = value.parse().with_context(invalid)?
        }
        "flap_window_secs" => config.flap_window_secs = value.parse().with_context(invalid)?,
        "flap_threshold" => config.flap_threshold = value.parse().with_context(invalid)?,
        _ => {
            bail!(
                "Unknown configuration key: '{}'\n\
                 Valid keys: data_dir, remote_path, log_file, sync_enabled, force_offline,\n  \
                 retry.base_delay_ms, retry.multiplier, retry.max_attempts, retry.max_delay_ms,\n  \
                 attempt_timeout_ms, pull_batch_size, push_batch_size, sync_interval_secs,\n  \
                 reachability_poll_secs, flap_window_secs, flap_threshold",
                key
            );
        }
    }
    Ok(())
}

fn optional_path(value: &str) -> Option<PathBuf> {
    if value.is_empty() || value == "none" {
        None
    } else {
        Some(value.into())
    }
}

fn display_opt(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(not set)".to_string())
}
