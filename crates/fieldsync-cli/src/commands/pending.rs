//! Pending queue command handler

use anyhow::Result;

use fieldsync_core::Engine;

use crate::output::Output;

/// List changes waiting to be pushed
pub fn list(engine: &Engine, output: &Output) -> Result<()> {
    output.print_pending(&engine.pending_changes());
    Ok(())
}
