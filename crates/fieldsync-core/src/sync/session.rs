//! Sync session bookkeeping
//!
//! A session describes one sync pass: how many batches it planned, how many
//! it finished and what it ran into. Observers see snapshots; the
//! orchestrator owns the live copy.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::conflict::ConflictRecord;
use crate::error::ErrorKind;
use crate::models::{RecordId, Watermark};

/// Lifecycle of a sync session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Running,
    Completed,
    Failed,
}

/// Snapshot of a sync pass
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncSession {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub total_batches: usize,
    pub completed_batches: usize,
    pub conflicts: Vec<ConflictRecord>,
    pub status: SyncStatus,
}

impl SyncSession {
    pub fn start() -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            total_batches: 0,
            completed_batches: 0,
            conflicts: Vec::new(),
            status: SyncStatus::Running,
        }
    }

    pub fn remaining_batches(&self) -> usize {
        self.total_batches.saturating_sub(self.completed_batches)
    }

    pub fn progress(&self) -> SyncProgress {
        SyncProgress {
            session_id: self.id,
            total_batches: self.total_batches,
            completed_batches: self.completed_batches,
        }
    }
}

/// Progress of a running pass, emitted after every batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncProgress {
    pub session_id: Uuid,
    pub total_batches: usize,
    pub completed_batches: usize,
}

impl SyncProgress {
    /// Completed fraction in `[0, 1]`; an empty pass counts as done
    pub fn fraction(&self) -> f64 {
        if self.total_batches == 0 {
            1.0
        } else {
            self.completed_batches as f64 / self.total_batches as f64
        }
    }
}

/// A record the pass could not process
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordFailure {
    pub record_id: RecordId,
    pub kind: ErrorKind,
    pub attempts: u32,
    pub message: String,
}

/// Summary of a completed pass
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub session_id: Uuid,
    /// Remote changes received
    pub pulled: usize,
    /// Remote or merged versions written locally
    pub applied: usize,
    /// Queued changes confirmed by the remote
    pub pushed: usize,
    /// Queued changes left for a later pass
    pub deferred: usize,
    pub conflicts: Vec<ConflictRecord>,
    pub failures: Vec<RecordFailure>,
    pub total_batches: usize,
    /// Watermark after the pass
    pub watermark: Watermark,
}

impl SyncReport {
    pub fn manual_conflicts(&self) -> impl Iterator<Item = &ConflictRecord> {
        self.conflicts.iter().filter(|c| c.is_manual())
    }
}

/// Why a pass aborted
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncFailure {
    pub session_id: Uuid,
    pub kind: ErrorKind,
    pub completed_batches: usize,
    pub remaining_batches: usize,
    pub message: String,
}

/// Result of asking for a sync pass
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SyncResult {
    /// Another pass is running; this request was refused, not queued
    Busy,
    Completed(SyncReport),
    Failed(SyncFailure),
}

impl SyncResult {
    pub fn is_completed(&self) -> bool {
        matches!(self, SyncResult::Completed(_))
    }

    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            SyncResult::Completed(report) => Some(report),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_fraction() {
        let mut session = SyncSession::start();
        assert_eq!(session.progress().fraction(), 1.0);

        session.total_batches = 4;
        session.completed_batches = 1;
        assert_eq!(session.progress().fraction(), 0.25);
        assert_eq!(session.remaining_batches(), 3);
    }

    #[test]
    fn test_result_serialization() {
        let json = serde_json::to_value(SyncResult::Busy).unwrap();
        assert_eq!(json["result"], "busy");
    }
}
