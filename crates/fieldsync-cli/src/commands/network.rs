//! Network command handler
//!
//! The CLI runs one command per process, so a forced network state is kept
//! in the config file (`force_offline`) and applies to every later command.

use std::path::PathBuf;

use anyhow::{Context, Result};

use fieldsync_core::{Config, NetworkState, RemoteBackend, SqliteRemote};

use crate::output::{Output, OutputFormat};

/// Force the network state, or show it when `state` is `None`
pub async fn network(
    state: Option<NetworkState>,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    let mut config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    let Some(state) = state else {
        return show(&config, output).await;
    };

    config.force_offline = !state.is_online();
    let save_path = config_path
        .cloned()
        .unwrap_or_else(Config::config_file_path);
    config
        .save_to_path(&save_path)
        .context("Failed to save configuration")?;

    match state {
        NetworkState::Offline => {
            output.success("Network forced offline; saves will be queued")
        }
        NetworkState::Online => output.success("Network online; run `fieldsync sync` to push queued saves"),
    }
    Ok(())
}

async fn show(config: &Config, output: &Output) -> Result<()> {
    let path = config.remote_path();
    let reachable = match SqliteRemote::open(&path) {
        Ok(remote) => remote.reachability().await,
        Err(_) => NetworkState::Offline,
    };
    let effective = if config.force_offline {
        NetworkState::Offline
    } else {
        reachable
    };

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "state": effective,
                    "forced_offline": config.force_offline,
                    "remote_reachable": reachable.is_online(),
                    "remote_path": path
                })
            );
        }
        OutputFormat::Quiet => println!("{}", effective),
        OutputFormat::Human => {
            println!("Network: {}", effective);
            if config.force_offline {
                println!("  (forced offline; `fieldsync network online` to undo)");
            }
            println!(
                "Remote:  {} ({})",
                path.display(),
                if reachable.is_online() {
                    "reachable"
                } else {
                    "unreachable"
                }
            );
        }
    }
    Ok(())
}
