//! Sync command handlers

use anyhow::{bail, Result};

use fieldsync_core::{Engine, ManualChoice, RecordId, SyncResult};

use crate::output::Output;

/// Run a sync pass and report it
pub async fn sync(engine: &Engine, output: &Output) -> Result<()> {
    if !engine.network().is_online() {
        bail!(
            "Network is forced offline. Bring it back with:\n  \
             fieldsync network online"
        );
    }

    output.message(&format!(
        "Syncing with {}...",
        engine.config().remote_path().display()
    ));

    match engine.sync_now().await {
        SyncResult::Completed(report) => {
            output.print_sync_report(&report);
            Ok(())
        }
        SyncResult::Failed(failure) => bail!(
            "Sync failed ({}) after {} of {} batch(es): {}",
            failure.kind,
            failure.completed_batches,
            failure.completed_batches + failure.remaining_batches,
            failure.message
        ),
        SyncResult::Busy => bail!("A sync pass is already running"),
    }
}

/// Sync quietly (for auto-sync) - no output on success
pub async fn sync_quiet(engine: &Engine) -> Result<()> {
    match engine.sync_now().await {
        SyncResult::Completed(_) | SyncResult::Busy => Ok(()),
        SyncResult::Failed(failure) => bail!("{} ({})", failure.message, failure.kind),
    }
}

/// Settle a conflict by hand and push the result
///
/// Conflicts are detected by a sync pass, so one runs first.
pub async fn resolve(
    engine: &Engine,
    id: String,
    choice: ManualChoice,
    output: &Output,
) -> Result<()> {
    let record_id = RecordId::new(&id)?;

    if !engine.unresolved_conflicts().contains(&record_id) {
        sync_quiet(engine).await?;
    }
    if !engine.unresolved_conflicts().contains(&record_id) {
        bail!("No conflict waiting for a decision on {}", id);
    }

    let resolved = engine.resolve_conflict(&record_id, choice)?;
    output.success(&format!("Resolved conflict on {}", id));
    output.print_record(&resolved);

    match engine.sync_now().await {
        SyncResult::Completed(_) => output.message("Resolution pushed"),
        _ => output.message("Resolution queued for the next sync"),
    }
    Ok(())
}
