//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use serde::Serialize;

use fieldsync_core::{PendingChange, RevisionedPayload, SaveOutcome, SyncReport};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Check if output is in quiet mode
    pub fn is_quiet(&self) -> bool {
        matches!(self.format, OutputFormat::Quiet)
    }

    /// Print a single record with its fields
    pub fn print_record(&self, record: &RevisionedPayload) {
        match self.format {
            OutputFormat::Human => {
                println!("ID:       {}", record.record_id);
                println!("Kind:     {}", record.kind);
                println!("Clock:    {}", record.clock);
                println!("Origin:   {}", short(&record.origin));
                println!("Modified: {}", record.modified_at.format("%Y-%m-%d %H:%M:%S"));
                if !record.fields.is_empty() {
                    println!();
                    println!("── Fields ({}) ──", record.fields.len());
                    for (name, field) in &record.fields {
                        println!("{} = {}", name, field.value);
                    }
                }
            }
            OutputFormat::Json => print_json(record),
            OutputFormat::Quiet => {
                println!("{}", record.record_id);
            }
        }
    }

    /// Print a list of records
    pub fn print_records(&self, records: &[RevisionedPayload]) {
        match self.format {
            OutputFormat::Human => {
                if records.is_empty() {
                    println!("No records found.");
                    return;
                }
                for record in records {
                    let fields = serde_json::to_string(&record.values()).unwrap_or_default();
                    println!(
                        "{} | {} | {}",
                        truncate(record.record_id.as_str(), 20),
                        truncate(record.kind.as_str(), 15),
                        truncate(&fields, 50)
                    );
                }
                println!("\n{} record(s)", records.len());
            }
            OutputFormat::Json => print_json(&records),
            OutputFormat::Quiet => {
                for record in records {
                    println!("{}", record.record_id);
                }
            }
        }
    }

    /// Print queued changes
    pub fn print_pending(&self, changes: &[PendingChange]) {
        match self.format {
            OutputFormat::Human => {
                if changes.is_empty() {
                    println!("Nothing pending.");
                    return;
                }
                for change in changes {
                    println!(
                        "{} | {} | queued {} | {} attempt(s)",
                        &change.change_id.to_string()[..8],
                        truncate(change.record_id.as_str(), 20),
                        change.enqueued_at.format("%Y-%m-%d %H:%M:%S"),
                        change.attempts
                    );
                }
                println!("\n{} pending change(s)", changes.len());
            }
            OutputFormat::Json => print_json(&changes),
            OutputFormat::Quiet => {
                for change in changes {
                    println!("{}", change.record_id);
                }
            }
        }
    }

    /// Print the outcome of a save
    pub fn print_save_outcome(&self, record_id: &str, outcome: &SaveOutcome) {
        match self.format {
            OutputFormat::Human => match outcome {
                SaveOutcome::Success => println!("✓ Saved {}", record_id),
                SaveOutcome::Queued => {
                    println!("✓ Saved {} locally (offline, queued for sync)", record_id)
                }
                SaveOutcome::Failed(failure) => println!(
                    "✗ Save of {} failed ({}, {} attempt(s)): {}",
                    record_id, failure.kind, failure.attempts, failure.message
                ),
                SaveOutcome::Cancelled => println!("Save of {} was cancelled", record_id),
            },
            OutputFormat::Json => print_json(outcome),
            OutputFormat::Quiet => {}
        }
    }

    /// Print the summary of a completed sync pass
    pub fn print_sync_report(&self, report: &SyncReport) {
        match self.format {
            OutputFormat::Human => {
                println!("✓ Sync complete");
                println!("  Pulled:   {} ({} applied)", report.pulled, report.applied);
                println!("  Pushed:   {}", report.pushed);
                if report.deferred > 0 {
                    println!("  Deferred: {}", report.deferred);
                }
                println!("  Batches:  {}", report.total_batches);
                println!("  Position: {}", report.watermark);

                let auto = report.conflicts.len() - report.manual_conflicts().count();
                if auto > 0 {
                    println!("  Merged:   {} concurrent edit(s)", auto);
                }
                for conflict in report.manual_conflicts() {
                    println!();
                    println!("Conflict on {} needs a decision:", conflict.record_id);
                    for candidate in &conflict.candidates {
                        println!(
                            "  {}: local {} / remote {}",
                            candidate.field, candidate.local, candidate.remote
                        );
                    }
                    println!(
                        "  Resolve with: fieldsync resolve {} --keep local|remote",
                        conflict.record_id
                    );
                }
                for failure in &report.failures {
                    println!(
                        "⚠ {} failed ({}, {} attempt(s)): {}",
                        failure.record_id, failure.kind, failure.attempts, failure.message
                    );
                }
            }
            OutputFormat::Json => print_json(report),
            OutputFormat::Quiet => {}
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Failed to serialize output: {}", e),
    }
}

/// Truncate a string to max length, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

fn short(device: &str) -> &str {
    device.get(..8).unwrap_or(device)
}
