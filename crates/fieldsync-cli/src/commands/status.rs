//! Status command handler

use anyhow::Result;

use fieldsync_core::Engine;

use crate::output::{Output, OutputFormat};

/// Show status information
pub fn show(engine: &Engine, output: &Output) -> Result<()> {
    let config = engine.config();
    let network = engine.network().current();
    let last_sync = engine.last_sync_timestamp();

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "device_id": engine.device_id(),
                    "network": network,
                    "sync_enabled": config.sync_enabled,
                    "remote_path": config.remote_path(),
                    "pending": engine.pending_change_count(),
                    "watermark": engine.watermark(),
                    "last_sync_at": last_sync,
                    "data_dir": config.data_dir
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", engine.pending_change_count());
        }
        OutputFormat::Human => {
            println!("FieldSync Status");
            println!("================");
            println!();
            println!("Device:");
            println!("  ID:       {}", engine.device_id());
            println!("  Data dir: {}", config.data_dir.display());
            println!();
            println!("Sync:");
            println!("  Network:  {}", network);
            println!(
                "  Auto:     {}",
                if config.sync_enabled {
                    "enabled"
                } else {
                    "disabled"
                }
            );
            println!("  Remote:   {}", config.remote_path().display());
            println!(
                "  Last:     {}",
                last_sync
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "never".to_string())
            );
            println!("  Position: {}", engine.watermark());
            println!();
            println!("Queue:");
            println!("  Pending:  {}", engine.pending_change_count());
        }
    }

    Ok(())
}
