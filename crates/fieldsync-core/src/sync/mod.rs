//! Sync orchestration
//!
//! One sync pass reconciles the local store with the remote change stream:
//!
//! 1. Refuse with [`SyncResult::Busy`] if a pass is already running
//! 2. Read the remote head and pull everything past the watermark in batches
//! 3. Resolve every pulled record that also exists locally
//! 4. Push the pending queue in batches through the save coordinator
//! 5. Emit [`SyncProgress`] after every batch
//! 6. Advance the watermark, unless the pass aborted
//!
//! ## Failures
//!
//! A record that cannot be applied or pushed is recorded in the report and
//! the pass moves on. Losing the network, running out of pull retries or
//! being cancelled aborts the pass: the queue and the watermark stay as they
//! were, and the failure reports how many batches were done.
//!
//! The watermark never moves past a pulled change that failed to apply or
//! still needs a manual decision, so the next pass sees it again.

mod session;

pub use session::{
    RecordFailure, SyncFailure, SyncProgress, SyncReport, SyncResult, SyncSession, SyncStatus,
};

use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::conflict::{ConflictRecord, ConflictResolver, FieldMerge, Resolution};
use crate::error::{EngineError, EngineResult, ErrorKind, RemoteError};
use crate::events::{EngineEvent, EventBus};
use crate::models::{PendingChange, RecordId, RevisionedPayload, Watermark};
use crate::propagate::{PropagationOutcome, Propagator};
use crate::queue::PendingChangeQueue;
use crate::save::SaveCoordinator;
use crate::store::LocalStore;

/// Batch sizes for a sync pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    pub pull_batch_size: usize,
    pub push_batch_size: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            pull_batch_size: 50,
            push_batch_size: 25,
        }
    }
}

/// Which side wins a conflict the user settles by hand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManualChoice {
    KeepLocal,
    TakeRemote,
}

fn batch_count(items: usize, size: usize) -> usize {
    let size = size.max(1);
    (items + size - 1) / size
}

/// Reason a pass stopped early
struct PassAbort {
    kind: ErrorKind,
    message: String,
}

impl PassAbort {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "sync pass cancelled")
    }
}

/// Running totals for one pass
#[derive(Default)]
struct Tally {
    pulled: usize,
    applied: usize,
    pushed: usize,
    deferred: usize,
    conflicts: Vec<ConflictRecord>,
    failures: Vec<RecordFailure>,
}

impl Tally {
    fn fail(&mut self, record_id: &RecordId, kind: ErrorKind, attempts: u32, message: String) {
        warn!(%record_id, %kind, %message, "Record failed during sync");
        self.failures.push(RecordFailure {
            record_id: record_id.clone(),
            kind,
            attempts,
            message,
        });
    }
}

/// What happened to one pulled change
#[derive(Debug, PartialEq, Eq)]
enum Incorporated {
    Done,
    /// Must be pulled again by a later pass
    Retry,
}

struct RunningPass {
    session: SyncSession,
    token: CancellationToken,
}

/// Marks the running session finished when the pass ends, however it ends
struct PassGuard<'a> {
    orchestrator: &'a SyncOrchestrator,
    token: CancellationToken,
}

impl PassGuard<'_> {
    fn finish(&self, status: SyncStatus) {
        self.orchestrator.with_session(|s| s.status = status);
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        let finished = self.orchestrator.running().take();
        if let Some(mut pass) = finished {
            if pass.session.status == SyncStatus::Running {
                pass.session.status = SyncStatus::Failed;
            }
            *self
                .orchestrator
                .last
                .lock()
                .unwrap_or_else(|p| p.into_inner()) = Some(pass.session);
        }
    }
}

/// Runs sync passes, one at a time
pub struct SyncOrchestrator {
    store: Arc<dyn LocalStore>,
    queue: Arc<PendingChangeQueue>,
    saves: Arc<SaveCoordinator>,
    propagator: Propagator,
    resolver: ConflictResolver,
    events: EventBus,
    settings: SyncSettings,
    running: Mutex<Option<RunningPass>>,
    last: Mutex<Option<SyncSession>>,
    /// Remote versions waiting for a manual decision
    unresolved: Mutex<HashMap<RecordId, RevisionedPayload>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("settings", &self.settings)
            .field("resolver", &self.resolver)
            .field("running", &self.is_running())
            .finish()
    }
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<dyn LocalStore>,
        queue: Arc<PendingChangeQueue>,
        saves: Arc<SaveCoordinator>,
        propagator: Propagator,
        resolver: ConflictResolver,
        events: EventBus,
        settings: SyncSettings,
    ) -> Self {
        Self {
            store,
            queue,
            saves,
            propagator,
            resolver,
            events,
            settings,
            running: Mutex::new(None),
            last: Mutex::new(None),
            unresolved: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Run one sync pass now
    pub async fn sync_now(&self) -> SyncResult {
        let Some(guard) = self.begin() else {
            debug!("Sync already running, refusing");
            return SyncResult::Busy;
        };

        let session_id = self.with_session(|s| s.id).unwrap_or_default();
        info!(%session_id, "Sync started");
        self.events.emit(EngineEvent::SyncStarted);

        match self.run_pass(&guard.token).await {
            Ok(mut report) => {
                report.session_id = session_id;
                report.total_batches = self.with_session(|s| s.total_batches).unwrap_or(0);
                guard.finish(SyncStatus::Completed);
                info!(
                    %session_id,
                    pulled = report.pulled,
                    pushed = report.pushed,
                    conflicts = report.conflicts.len(),
                    failures = report.failures.len(),
                    watermark = report.watermark,
                    "Sync completed"
                );
                self.events.emit(EngineEvent::SyncCompleted(report.clone()));
                SyncResult::Completed(report)
            }
            Err(abort) => {
                let (completed, remaining) = self
                    .with_session(|s| (s.completed_batches, s.remaining_batches()))
                    .unwrap_or((0, 0));
                guard.finish(SyncStatus::Failed);
                warn!(
                    %session_id,
                    kind = %abort.kind,
                    completed,
                    remaining,
                    message = %abort.message,
                    "Sync failed"
                );
                self.events.emit(EngineEvent::SyncFailed {
                    kind: abort.kind,
                    completed_batches: completed,
                    remaining_batches: remaining,
                    message: abort.message.clone(),
                });
                SyncResult::Failed(SyncFailure {
                    session_id,
                    kind: abort.kind,
                    completed_batches: completed,
                    remaining_batches: remaining,
                    message: abort.message,
                })
            }
        }
    }

    /// Snapshot of the running session
    pub fn current_session(&self) -> Option<SyncSession> {
        self.running().as_ref().map(|pass| pass.session.clone())
    }

    /// The most recently finished session
    pub fn last_session(&self) -> Option<SyncSession> {
        self.last.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }

    /// Cancel the running pass, if any
    pub fn cancel_current(&self) {
        if let Some(pass) = self.running().as_ref() {
            pass.token.cancel();
        }
    }

    /// Cancel the running pass and refuse to start new ones
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Records with a conflict waiting for a manual decision
    pub fn unresolved_conflicts(&self) -> Vec<RecordId> {
        let unresolved = self.unresolved();
        let ids: BTreeSet<&RecordId> = unresolved.keys().collect();
        ids.into_iter().cloned().collect()
    }

    /// Settle a conflict by hand
    ///
    /// Fields only one side changed are kept from that side; fields both
    /// sides changed take the chosen side's value. The result descends from
    /// both versions and is queued for the next pass.
    pub fn resolve_manual(
        &self,
        record_id: &RecordId,
        choice: ManualChoice,
    ) -> EngineResult<RevisionedPayload> {
        let remote = self.unresolved().get(record_id).cloned().ok_or_else(|| {
            EngineError::InvalidRequest(format!("no unresolved conflict for '{}'", record_id))
        })?;
        let local = self.store.load(record_id)?.ok_or_else(|| {
            EngineError::InvalidRequest(format!("no local version of '{}'", record_id))
        })?;

        let device_id = self.store.device_id().to_string();
        let mut clock = local.clock.merged(&remote.clock);
        clock.increment(&device_id);

        let (chosen, other) = match choice {
            ManualChoice::KeepLocal => (&local, &remote),
            ManualChoice::TakeRemote => (&remote, &local),
        };

        let names: BTreeSet<&String> = local.fields.keys().chain(remote.fields.keys()).collect();
        let mut resolved = chosen.clone();
        resolved.fields.clear();
        for name in names {
            let mine = chosen.fields.get(name);
            let theirs = other.fields.get(name);
            match FieldMerge::merge_field(name, mine, theirs) {
                Ok(Some(field)) => {
                    resolved.fields.insert(name.clone(), field);
                }
                Ok(None) => {}
                Err(_) => {
                    if let Some(field) = mine {
                        let mut field = field.clone();
                        field.clock = clock.clone();
                        resolved.fields.insert(name.clone(), field);
                    }
                }
            }
        }
        resolved.clock = clock;
        resolved.modified_at = Utc::now();
        resolved.origin = device_id;

        if !self.store.apply_remote(&resolved)? {
            return Err(EngineError::InvalidRequest(format!(
                "'{}' changed locally; sync again before resolving",
                record_id
            )));
        }
        self.queue.enqueue(PendingChange::new(resolved.clone(), 0))?;
        self.unresolved().remove(record_id);

        info!(%record_id, ?choice, "Conflict resolved manually");
        Ok(resolved)
    }

    fn begin(&self) -> Option<PassGuard<'_>> {
        let mut running = self.running();
        if running.is_some() {
            return None;
        }
        let token = self.shutdown.child_token();
        *running = Some(RunningPass {
            session: SyncSession::start(),
            token: token.clone(),
        });
        Some(PassGuard {
            orchestrator: self,
            token,
        })
    }

    fn running(&self) -> MutexGuard<'_, Option<RunningPass>> {
        self.running.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn unresolved(&self) -> MutexGuard<'_, HashMap<RecordId, RevisionedPayload>> {
        self.unresolved.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn with_session<R>(&self, f: impl FnOnce(&mut SyncSession) -> R) -> Option<R> {
        self.running().as_mut().map(|pass| f(&mut pass.session))
    }

    fn set_total_batches(&self, total: usize) {
        self.with_session(|s| s.total_batches = total.max(s.completed_batches));
    }

    fn complete_batch(&self) {
        let progress = self.with_session(|s| {
            s.completed_batches += 1;
            s.total_batches = s.total_batches.max(s.completed_batches);
            s.progress()
        });
        if let Some(progress) = progress {
            debug!(
                completed = progress.completed_batches,
                total = progress.total_batches,
                "Sync batch done"
            );
            self.events.emit(EngineEvent::SyncProgress(progress));
        }
    }

    /// Call the remote under the retry policy; anything but success aborts the pass
    async fn remote_call<T, F, Fut>(&self, token: &CancellationToken, op: F) -> Result<T, PassAbort>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        match self.propagator.run(token, |_| {}, op).await {
            PropagationOutcome::Done { value, .. } => Ok(value),
            PropagationOutcome::Offline { .. } => Err(PassAbort::new(
                ErrorKind::TransientNetwork,
                "remote is offline",
            )),
            PropagationOutcome::Exhausted { error, .. }
            | PropagationOutcome::Permanent { error, .. } => {
                Err(PassAbort::new(error.kind(), error.to_string()))
            }
            PropagationOutcome::Cancelled { .. } => Err(PassAbort::cancelled()),
        }
    }

    async fn run_pass(&self, token: &CancellationToken) -> Result<SyncReport, PassAbort> {
        let mut tally = Tally::default();
        let remote = self.propagator.remote().clone();
        let pull_size = self.settings.pull_batch_size.max(1);
        let push_size = self.settings.push_batch_size.max(1);

        let start = self.queue.watermark();
        let head = self.remote_call(token, || remote.head()).await?;
        let behind = usize::try_from(head.saturating_sub(start)).unwrap_or(usize::MAX);
        self.set_total_batches(batch_count(behind, pull_size) + batch_count(self.queue.len(), push_size));

        // Pull
        let mut cursor = start;
        let mut replay_from: Option<Watermark> = None;
        while cursor < head {
            if token.is_cancelled() {
                return Err(PassAbort::cancelled());
            }
            let since = cursor;
            let changes = self
                .remote_call(token, || remote.pull_since(since, pull_size))
                .await?;
            if changes.is_empty() {
                break;
            }
            for change in changes {
                cursor = cursor.max(change.seq);
                tally.pulled += 1;
                if self.incorporate(change.payload, &mut tally) == Incorporated::Retry {
                    replay_from = Some(replay_from.map_or(change.seq, |seq| seq.min(change.seq)));
                }
            }
            self.with_session(|s| s.conflicts = tally.conflicts.clone());
            self.complete_batch();
        }

        // Push
        let held: HashSet<RecordId> = self.unresolved().keys().cloned().collect();
        let (pending, held_back): (Vec<PendingChange>, Vec<PendingChange>) = self
            .queue
            .drain()
            .into_iter()
            .partition(|change| !held.contains(&change.record_id));
        tally.deferred += held_back.len();
        for change in &held_back {
            tally.fail(
                &change.record_id,
                ErrorKind::ConflictUnresolved,
                change.attempts,
                "waiting for a manual conflict decision".to_string(),
            );
        }

        let completed = self.with_session(|s| s.completed_batches).unwrap_or(0);
        self.set_total_batches(completed + batch_count(pending.len(), push_size));

        for batch in pending.chunks(push_size) {
            if token.is_cancelled() {
                return Err(PassAbort::cancelled());
            }
            for change in batch {
                self.push_change(change, token, &mut tally).await?;
            }
            self.complete_batch();
        }

        let target = match replay_from {
            Some(seq) => seq.saturating_sub(1).max(start),
            None => cursor,
        };
        let watermark = self
            .queue
            .advance_watermark(target, Utc::now())
            .map_err(|e| PassAbort::new(ErrorKind::LocalCommit, e.to_string()))?;

        Ok(SyncReport {
            session_id: Default::default(),
            pulled: tally.pulled,
            applied: tally.applied,
            pushed: tally.pushed,
            deferred: tally.deferred,
            conflicts: tally.conflicts,
            failures: tally.failures,
            total_batches: 0,
            watermark,
        })
    }

    async fn push_change(
        &self,
        change: &PendingChange,
        token: &CancellationToken,
        tally: &mut Tally,
    ) -> Result<(), PassAbort> {
        let record_id = &change.record_id;
        let Some(outcome) = self.saves.propagate_queued(change, token).await else {
            debug!(%record_id, "Save in progress, deferring queued change");
            tally.deferred += 1;
            return Ok(());
        };

        match outcome {
            PropagationOutcome::Done { .. } => {
                match self.queue.confirm(change) {
                    Ok(_) => tally.pushed += 1,
                    Err(e) => tally.fail(record_id, ErrorKind::LocalCommit, 0, e.to_string()),
                }
                Ok(())
            }
            PropagationOutcome::Offline { .. } => Err(PassAbort::new(
                ErrorKind::TransientNetwork,
                "remote went offline",
            )),
            PropagationOutcome::Cancelled { .. } if token.is_cancelled() => {
                Err(PassAbort::cancelled())
            }
            PropagationOutcome::Cancelled { .. } => {
                // A save superseded this push and delivers a newer version
                tally.deferred += 1;
                Ok(())
            }
            PropagationOutcome::Exhausted { attempts, error }
            | PropagationOutcome::Permanent { attempts, error } => {
                if let Err(e) = self.queue.record_attempts(change.change_id, attempts) {
                    warn!(%record_id, error = %e, "Failed to record push attempts");
                }
                tally.fail(record_id, error.kind(), attempts, error.to_string());
                Ok(())
            }
        }
    }

    /// Reconcile one pulled version with the local store
    fn incorporate(&self, remote: RevisionedPayload, tally: &mut Tally) -> Incorporated {
        let record_id = remote.record_id.clone();

        let local = match self.store.load(&record_id) {
            Ok(local) => local,
            Err(e) => {
                tally.fail(&record_id, e.kind(), 0, e.to_string());
                return Incorporated::Retry;
            }
        };

        let Some(local) = local else {
            return self.apply(&remote, tally);
        };

        match self.resolver.resolve(&local, &remote) {
            Resolution::Identical => {
                self.unresolved().remove(&record_id);
                self.clear_delivered(&remote);
                Incorporated::Done
            }
            Resolution::KeepLocal => {
                self.unresolved().remove(&record_id);
                if !self.queue.contains(&record_id) {
                    if let Err(e) = self.queue.enqueue(PendingChange::new(local, 0)) {
                        tally.fail(&record_id, ErrorKind::LocalCommit, 0, e.to_string());
                    }
                }
                Incorporated::Done
            }
            Resolution::TakeRemote => {
                self.unresolved().remove(&record_id);
                let outcome = self.apply(&remote, tally);
                if outcome == Incorporated::Done {
                    self.clear_delivered(&remote);
                }
                outcome
            }
            Resolution::Merged { payload, record } => {
                self.unresolved().remove(&record_id);
                tally.conflicts.push(record);
                match self.store.apply_remote(&payload) {
                    Ok(true) => {
                        tally.applied += 1;
                        if let Err(e) = self.queue.enqueue(PendingChange::new(payload, 0)) {
                            tally.fail(&record_id, ErrorKind::LocalCommit, 0, e.to_string());
                        }
                        Incorporated::Done
                    }
                    // Local moved on during the pass; resolve again next time
                    Ok(false) => Incorporated::Retry,
                    Err(e) => {
                        tally.fail(&record_id, e.kind(), 0, e.to_string());
                        Incorporated::Retry
                    }
                }
            }
            Resolution::ManualRequired(record) => {
                info!(
                    %record_id,
                    fields = record.candidates.len(),
                    "Conflict requires manual resolution"
                );
                self.unresolved().insert(record_id, remote);
                self.events
                    .emit(EngineEvent::ConflictRequiresManualResolution(record.clone()));
                tally.conflicts.push(record);
                Incorporated::Retry
            }
        }
    }

    fn apply(&self, remote: &RevisionedPayload, tally: &mut Tally) -> Incorporated {
        match self.store.apply_remote(remote) {
            Ok(applied) => {
                if applied {
                    tally.applied += 1;
                }
                Incorporated::Done
            }
            Err(e) => {
                tally.fail(&remote.record_id, e.kind(), 0, e.to_string());
                Incorporated::Retry
            }
        }
    }

    fn clear_delivered(&self, remote: &RevisionedPayload) {
        if let Err(e) = self.queue.remove_delivered(remote) {
            warn!(record_id = %remote.record_id, error = %e, "Failed to clear delivered change");
        }
    }
}
