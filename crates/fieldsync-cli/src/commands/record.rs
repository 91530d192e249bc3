//! Record command handlers

use anyhow::{bail, Context, Result};
use serde_json::Value;

use fieldsync_core::{Engine, Mutation, RecordId, RecordKind, SaveOutcome};

use crate::output::Output;

/// Parse a `name=value` assignment; the value is JSON when it parses as
/// JSON and a plain string otherwise
pub fn parse_assignment(s: &str) -> Result<(String, Value), String> {
    let Some((name, raw)) = s.split_once('=') else {
        return Err(format!("expected NAME=VALUE, got '{}'", s));
    };
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing field name in '{}'", s));
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((name.to_string(), value))
}

/// Save field values to a record
pub async fn save(
    engine: &Engine,
    id: String,
    kind: String,
    assignments: Vec<(String, Value)>,
    output: &Output,
) -> Result<()> {
    let record_id = RecordId::new(&id)?;
    let mutation = assignments
        .into_iter()
        .fold(Mutation::new(record_id, RecordKind::new(kind)), |m, (name, value)| {
            m.set(name, value)
        });

    let outcome = engine.request_save(mutation).await;
    output.print_save_outcome(&id, &outcome);

    match outcome {
        SaveOutcome::Success | SaveOutcome::Queued => Ok(()),
        SaveOutcome::Failed(failure) => bail!("Save failed: {}", failure.kind),
        SaveOutcome::Cancelled => bail!("Save cancelled"),
    }
}

/// Show a single record
pub fn show(engine: &Engine, id: String, output: &Output) -> Result<()> {
    let record_id = RecordId::new(&id)?;
    let record = engine
        .load(&record_id)
        .context("Failed to load record")?
        .ok_or_else(|| anyhow::anyhow!("Record not found: {}", id))?;

    output.print_record(&record);
    Ok(())
}

/// List all records
pub fn list(engine: &Engine, output: &Output) -> Result<()> {
    let records = engine.list().context("Failed to list records")?;
    output.print_records(&records);
    Ok(())
}
