//! FieldSync CLI
//!
//! Command-line interface for FieldSync - offline-first record saves with
//! multi-device sync through a shared remote file.

use std::fs::OpenOptions;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use fieldsync_core::{Config, Engine, ManualChoice, NetworkState};

mod commands;
mod output;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "fieldsync")]
#[command(about = "FieldSync - Offline-first record saves with multi-device sync")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Config file to use instead of the default
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Save field values to a record
    Save {
        /// Record ID
        id: String,
        /// Record kind
        #[arg(short, long, default_value = "record")]
        kind: String,
        /// Field assignment as name=value (value parsed as JSON when valid)
        #[arg(short, long = "set", value_name = "NAME=VALUE", required = true, value_parser = commands::record::parse_assignment)]
        set: Vec<(String, serde_json::Value)>,
    },
    /// Show a record
    Show {
        /// Record ID
        id: String,
    },
    /// List all records
    #[command(alias = "ls")]
    List,
    /// List changes waiting to be pushed
    Pending,
    /// Sync with the remote
    Sync,
    /// Settle a conflict that needs a manual decision
    Resolve {
        /// Record ID
        id: String,
        /// Which side wins overlapping fields
        #[arg(long, value_enum)]
        keep: Side,
    },
    /// Show status (device, network, queue, last sync)
    Status,
    /// Show or force the network state
    Network {
        /// Force online or offline; shows the current state when omitted
        #[arg(value_enum)]
        state: Option<NetworkArg>,
    },
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (data_dir, remote_path, sync_enabled, ...)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Side {
    Local,
    Remote,
}

impl From<Side> for ManualChoice {
    fn from(side: Side) -> Self {
        match side {
            Side::Local => ManualChoice::KeepLocal,
            Side::Remote => ManualChoice::TakeRemote,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum NetworkArg {
    Online,
    Offline,
}

impl From<NetworkArg> for NetworkState {
    fn from(arg: NetworkArg) -> Self {
        match arg {
            NetworkArg::Online => NetworkState::Online,
            NetworkArg::Offline => NetworkState::Offline,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));
    let config_path = cli.config.as_ref();

    // Commands that don't need the engine
    match &cli.command {
        Commands::Config { command } => {
            return handle_config_command(command.clone(), config_path, &output);
        }
        Commands::Network { state } => {
            return commands::network::network(state.map(Into::into), config_path, &output).await;
        }
        _ => {}
    }

    let config = Config::load_with_cli_override(config_path)?;
    init_logging(&config);

    let engine = Engine::builder(config).build()?;

    let is_write = matches!(&cli.command, Commands::Save { .. });
    let is_manual_sync = matches!(&cli.command, Commands::Sync | Commands::Resolve { .. });

    // Sync before read commands (to get latest data)
    if !is_write && !is_manual_sync {
        auto_sync(&engine, &output).await;
    }

    let result = match cli.command {
        Commands::Save { id, kind, set } => commands::record::save(&engine, id, kind, set, &output).await,
        Commands::Show { id } => commands::record::show(&engine, id, &output),
        Commands::List => commands::record::list(&engine, &output),
        Commands::Pending => commands::pending::list(&engine, &output),
        Commands::Sync => commands::sync::sync(&engine, &output).await,
        Commands::Resolve { id, keep } => {
            commands::sync::resolve(&engine, id, keep.into(), &output).await
        }
        Commands::Status => commands::status::show(&engine, &output),
        Commands::Config { .. } | Commands::Network { .. } => unreachable!(), // Handled above
    };

    // Sync after write commands (to push earlier offline changes)
    if is_write && result.is_ok() {
        auto_sync(&engine, &output).await;
    }

    engine.shutdown().await;
    result
}

fn handle_config_command(
    command: Option<ConfigCommands>,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    match command {
        Some(ConfigCommands::Show) | None => commands::config::show(config_path, output),
        Some(ConfigCommands::Set { key, value }) => {
            commands::config::set(key, value, config_path, output)
        }
    }
}

/// Initialize logging
///
/// Only initializes if FIELDSYNC_LOG environment variable is set.
/// Logs to config.log_file when set, otherwise to stderr.
fn init_logging(config: &Config) {
    let Ok(log_level) = std::env::var("FIELDSYNC_LOG") else {
        return;
    };

    let env_filter = EnvFilter::new(format!(
        "fieldsync_core={},fieldsync_cli={}",
        log_level, log_level
    ));

    match &config.log_file {
        Some(log_path) => {
            let log_file = match OpenOptions::new().create(true).append(true).open(log_path) {
                Ok(f) => f,
                Err(e) => {
                    eprintln!("Warning: Could not open log file {:?}: {}", log_path, e);
                    return;
                }
            };
            let _ = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(log_file)
                .try_init();
            info!("Logging initialized to {:?}", log_path);
        }
        None => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .try_init();
        }
    }
}

/// Auto-sync if sync is enabled, silently handles errors
async fn auto_sync(engine: &Engine, output: &Output) {
    if !engine.config().sync_enabled || !engine.network().is_online() {
        return;
    }

    if let Err(e) = commands::sync::sync_quiet(engine).await {
        if !output.is_quiet() {
            eprintln!("⚠ Auto-sync failed: {}", e);
        }
    }
}
