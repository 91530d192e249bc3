//! Save coordinator
//!
//! Turns a save request into a local commit plus remote propagation, with
//! at most one request per record doing work at any time.
//!
//! ## Per-record state machine
//!
//! ```text
//! Idle -> Committing -> Propagating -> (Retrying -> Propagating)* -> Idle
//! ```
//!
//! - A failed local commit ends the request with `LocalCommit`; nothing is
//!   queued because nothing was written.
//! - Once the commit succeeded the change is never lost: every outcome
//!   other than a confirmed push leaves it on the pending queue.
//! - A newer request for the same record cancels the current one, waits
//!   for it to reach Idle and then starts fresh.
//!
//! ## Single flight
//!
//! Requests for one record take turns on a per-record async lock, held
//! from commit to the end of propagation. The map from record to slot is
//! only locked briefly and never across an await.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ErrorKind;
use crate::events::{EngineEvent, EventBus};
use crate::models::{Mutation, PendingChange, RecordId, RevisionedPayload};
use crate::propagate::{PropagationOutcome, PropagationStep, Propagator};
use crate::queue::PendingChangeQueue;
use crate::store::LocalStore;

/// Where a record's active save request currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SaveState {
    Idle,
    Committing,
    Propagating { attempt: u32 },
    Retrying { attempt: u32, delay: Duration },
}

/// Why a save did not complete
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SaveFailure {
    pub kind: ErrorKind,
    pub record_id: RecordId,
    pub attempts: u32,
    pub message: String,
}

/// Terminal outcome of a save request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SaveOutcome {
    /// Committed locally and confirmed by the remote
    Success,
    /// Committed locally; the remote was offline so the change was queued
    Queued,
    Failed(SaveFailure),
    /// Superseded or torn down
    Cancelled,
}

impl SaveOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SaveOutcome::Success)
    }

    pub fn failure(&self) -> Option<&SaveFailure> {
        match self {
            SaveOutcome::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

struct ActiveRequest {
    revision: u64,
    token: CancellationToken,
}

/// Per-record coordination state
struct RecordSlot {
    gate: tokio::sync::Mutex<()>,
    current: Mutex<Option<ActiveRequest>>,
    state: Mutex<SaveState>,
}

impl RecordSlot {
    fn new() -> Self {
        Self {
            gate: tokio::sync::Mutex::new(()),
            current: Mutex::new(None),
            state: Mutex::new(SaveState::Idle),
        }
    }

    fn current(&self) -> MutexGuard<'_, Option<ActiveRequest>> {
        self.current.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, state: SaveState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }

    fn state(&self) -> SaveState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn observe(&self, step: PropagationStep) {
        match step {
            PropagationStep::Attempting(attempt) => {
                self.set_state(SaveState::Propagating { attempt })
            }
            PropagationStep::RetryScheduled(retry) => self.set_state(SaveState::Retrying {
                attempt: retry.attempt_number,
                delay: retry.scheduled_delay,
            }),
        }
    }
}

/// Releases a record slot when a request finishes, however it finishes
struct SlotLease<'a> {
    coordinator: &'a SaveCoordinator,
    record_id: RecordId,
    slot: Arc<RecordSlot>,
    revision: u64,
}

impl Drop for SlotLease<'_> {
    fn drop(&mut self) {
        self.coordinator
            .release(&self.record_id, &self.slot, self.revision);
    }
}

/// Coordinates save requests across records
pub struct SaveCoordinator {
    store: Arc<dyn LocalStore>,
    queue: Arc<PendingChangeQueue>,
    propagator: Propagator,
    events: EventBus,
    slots: Mutex<HashMap<RecordId, Arc<RecordSlot>>>,
    revision: AtomicU64,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for SaveCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaveCoordinator")
            .field("active", &self.active_count())
            .field("revision", &self.revision.load(Ordering::SeqCst))
            .finish()
    }
}

impl SaveCoordinator {
    pub fn new(
        store: Arc<dyn LocalStore>,
        queue: Arc<PendingChangeQueue>,
        propagator: Propagator,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            queue,
            propagator,
            events,
            slots: Mutex::new(HashMap::new()),
            revision: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    /// Commit a mutation locally and propagate it
    pub async fn request_save(&self, mutation: Mutation) -> SaveOutcome {
        let record_id = mutation.record_id.clone();
        if let Err(e) = mutation.validate() {
            return SaveOutcome::Failed(SaveFailure {
                kind: e.kind(),
                record_id,
                attempts: 0,
                message: e.to_string(),
            });
        }

        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        let token = self.shutdown.child_token();
        let lease = self.acquire(&record_id, revision, token.clone());

        let _turn = lease.slot.gate.lock().await;
        if token.is_cancelled() {
            debug!(%record_id, revision, "Superseded before commit");
            return SaveOutcome::Cancelled;
        }

        self.events.emit(EngineEvent::SaveStarted {
            record_id: record_id.clone(),
            revision,
        });

        lease.slot.set_state(SaveState::Committing);
        let payload = match self.store.commit_locally(&mutation) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(%record_id, error = %e, "Local commit failed");
                return self.fail(record_id, e.kind(), 0, e.to_string());
            }
        };

        let outcome = self
            .propagator
            .push(&record_id, &payload, &token, |step| lease.slot.observe(step))
            .await;

        self.settle(record_id, payload, outcome)
    }

    /// Push a queued change on behalf of a sync pass
    ///
    /// Returns `None` while a save for the record is in progress; that save
    /// delivers a version at least as new. A save arriving during the push
    /// supersedes it like any other request.
    pub(crate) async fn propagate_queued(
        &self,
        change: &PendingChange,
        pass: &CancellationToken,
    ) -> Option<PropagationOutcome<()>> {
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        let token = pass.child_token();
        let lease = self.try_acquire(&change.record_id, revision, token.clone())?;

        let _turn = lease.slot.gate.lock().await;
        let outcome = self
            .propagator
            .push(&change.record_id, &change.payload, &token, |step| {
                lease.slot.observe(step)
            })
            .await;
        Some(outcome)
    }

    /// Cancel the active request for a record; no-op when idle
    pub fn cancel_pending(&self, record_id: &RecordId) {
        let slots = self.slots();
        if let Some(slot) = slots.get(record_id) {
            if let Some(active) = slot.current().as_ref() {
                debug!(%record_id, revision = active.revision, "Cancelling save");
                active.token.cancel();
            }
        }
    }

    /// Cancel every request; later requests are cancelled immediately
    pub fn cancel_all(&self) {
        info!("Cancelling all save requests");
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// State of the active request for a record
    pub fn state(&self, record_id: &RecordId) -> SaveState {
        self.slots()
            .get(record_id)
            .map(|slot| slot.state())
            .unwrap_or(SaveState::Idle)
    }

    /// Number of records with a request in progress
    pub fn active_count(&self) -> usize {
        self.slots()
            .values()
            .filter(|slot| slot.current().is_some())
            .count()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<RecordId, Arc<RecordSlot>>> {
        self.slots.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Claim a record for a new request, cancelling the one it supersedes
    fn acquire(&self, record_id: &RecordId, revision: u64, token: CancellationToken) -> SlotLease<'_> {
        let mut slots = self.slots();
        let slot = slots
            .entry(record_id.clone())
            .or_insert_with(|| Arc::new(RecordSlot::new()))
            .clone();

        if let Some(previous) = slot.current().replace(ActiveRequest { revision, token }) {
            debug!(
                %record_id,
                superseded = previous.revision,
                by = revision,
                "Superseding save request"
            );
            previous.token.cancel();
        }

        SlotLease {
            coordinator: self,
            record_id: record_id.clone(),
            slot,
            revision,
        }
    }

    /// Claim an idle record; `None` when a request already holds it
    fn try_acquire(
        &self,
        record_id: &RecordId,
        revision: u64,
        token: CancellationToken,
    ) -> Option<SlotLease<'_>> {
        let mut slots = self.slots();
        let slot = slots
            .entry(record_id.clone())
            .or_insert_with(|| Arc::new(RecordSlot::new()))
            .clone();

        let mut current = slot.current();
        if current.is_some() {
            return None;
        }
        *current = Some(ActiveRequest { revision, token });
        drop(current);

        Some(SlotLease {
            coordinator: self,
            record_id: record_id.clone(),
            slot,
            revision,
        })
    }

    fn release(&self, record_id: &RecordId, slot: &Arc<RecordSlot>, revision: u64) {
        let mut slots = self.slots();
        let mut current = slot.current();
        if current.as_ref().map(|a| a.revision) == Some(revision) {
            *current = None;
            slot.set_state(SaveState::Idle);
            drop(current);
            slots.remove(record_id);
        }
    }

    fn settle(
        &self,
        record_id: RecordId,
        payload: RevisionedPayload,
        outcome: PropagationOutcome<()>,
    ) -> SaveOutcome {
        let attempts = outcome.attempts();
        match outcome {
            PropagationOutcome::Done { .. } => {
                if let Err(e) = self.queue.remove_delivered(&payload) {
                    warn!(%record_id, error = %e, "Failed to clear queued change");
                }
                info!(%record_id, attempts, "Save confirmed");
                self.events.emit(EngineEvent::SaveSucceeded {
                    record_id,
                    attempts,
                });
                SaveOutcome::Success
            }
            PropagationOutcome::Offline { .. } => {
                match self.enqueue(&record_id, payload, attempts) {
                    Ok(()) => SaveOutcome::Queued,
                    Err(outcome) => outcome,
                }
            }
            PropagationOutcome::Cancelled { .. } => {
                // Committed but unconfirmed; keep it for the next sync
                match self.enqueue(&record_id, payload, attempts) {
                    Ok(()) => SaveOutcome::Cancelled,
                    Err(outcome) => outcome,
                }
            }
            PropagationOutcome::Exhausted { error, .. }
            | PropagationOutcome::Permanent { error, .. } => {
                if let Err(outcome) = self.enqueue(&record_id, payload, attempts) {
                    return outcome;
                }
                self.fail(record_id, error.kind(), attempts, error.to_string())
            }
        }
    }

    fn enqueue(
        &self,
        record_id: &RecordId,
        payload: RevisionedPayload,
        attempts: u32,
    ) -> Result<(), SaveOutcome> {
        match self.queue.enqueue(PendingChange::new(payload, attempts)) {
            Ok(()) => {
                debug!(%record_id, attempts, "Change queued");
                self.events.emit(EngineEvent::ChangeQueued {
                    record_id: record_id.clone(),
                    attempts,
                });
                Ok(())
            }
            Err(e) => {
                warn!(%record_id, error = %e, "Failed to queue committed change");
                Err(self.fail(
                    record_id.clone(),
                    ErrorKind::LocalCommit,
                    attempts,
                    e.to_string(),
                ))
            }
        }
    }

    fn fail(&self, record_id: RecordId, kind: ErrorKind, attempts: u32, message: String) -> SaveOutcome {
        self.events.emit(EngineEvent::SaveFailed {
            record_id: record_id.clone(),
            kind,
            attempts,
            message: message.clone(),
        });
        SaveOutcome::Failed(SaveFailure {
            kind,
            record_id,
            attempts,
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{LocalCommitError, RemoteError};
    use crate::models::RecordKind;
    use crate::network::{NetworkMonitor, NetworkState};
    use crate::remote::MemoryRemote;
    use crate::retry::RetryPolicy;
    use crate::store::MemoryStore;
    use serde_json::json;

    struct Harness {
        coordinator: Arc<SaveCoordinator>,
        store: Arc<MemoryStore>,
        remote: Arc<MemoryRemote>,
        queue: Arc<PendingChangeQueue>,
        network: Arc<NetworkMonitor>,
        events: EventBus,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new("dev-a"));
        let remote = Arc::new(MemoryRemote::new());
        let queue = Arc::new(PendingChangeQueue::in_memory());
        let network = Arc::new(NetworkMonitor::new(NetworkState::Online));
        let events = EventBus::new();
        let propagator = Propagator::new(
            remote.clone(),
            network.clone(),
            RetryPolicy::new(Duration::from_secs(1), 2.0, 3),
            Duration::from_secs(10),
        );
        let coordinator = Arc::new(SaveCoordinator::new(
            store.clone(),
            queue.clone(),
            propagator,
            events.clone(),
        ));
        Harness {
            coordinator,
            store,
            remote,
            queue,
            network,
            events,
        }
    }

    fn rid(id: &str) -> RecordId {
        RecordId::new(id).unwrap()
    }

    fn mutation(id: &str, value: impl Into<serde_json::Value>) -> Mutation {
        Mutation::new(rid(id), RecordKind::new("form")).set("status", value)
    }

    fn transient(n: usize) -> Vec<RemoteError> {
        (0..n).map(|_| RemoteError::Transient("reset".into())).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_save() {
        let h = harness();
        let mut rx = h.events.subscribe();

        let outcome = h.coordinator.request_save(mutation("r1", "open")).await;
        assert_eq!(outcome, SaveOutcome::Success);
        assert!(h.queue.is_empty());
        assert_eq!(
            h.remote.latest(&rid("r1")).unwrap().value("status"),
            Some(&json!("open"))
        );
        assert_eq!(h.coordinator.state(&rid("r1")), SaveState::Idle);
        assert_eq!(h.coordinator.active_count(), 0);

        assert!(matches!(rx.try_recv(), Ok(EngineEvent::SaveStarted { revision: 1, .. })));
        assert!(matches!(
            rx.try_recv(),
            Ok(EngineEvent::SaveSucceeded { attempts: 1, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_mutation_is_rejected() {
        let h = harness();
        let outcome = h
            .coordinator
            .request_save(Mutation::new(rid("r1"), RecordKind::new("form")))
            .await;
        assert_eq!(outcome.failure().unwrap().kind, ErrorKind::InvalidRequest);
        assert!(h.store.load(&rid("r1")).unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_commit_failure_is_not_retried_or_queued() {
        let h = harness();
        h.store
            .fail_next_commit(LocalCommitError::StorageFull("no space left".into()));

        let outcome = h.coordinator.request_save(mutation("r1", "open")).await;
        let failure = outcome.failure().unwrap();
        assert_eq!(failure.kind, ErrorKind::LocalCommit);
        assert_eq!(failure.attempts, 0);
        assert!(h.queue.is_empty());
        assert_eq!(h.remote.push_attempts(&rid("r1")), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_save_is_queued() {
        let h = harness();
        h.network.simulate(NetworkState::Offline);
        let mut rx = h.events.subscribe();

        let outcome = h.coordinator.request_save(mutation("r1", "open")).await;
        assert_eq!(outcome, SaveOutcome::Queued);
        assert_eq!(h.queue.len(), 1);
        assert_eq!(h.remote.push_attempts(&rid("r1")), 0);
        assert!(h.store.load(&rid("r1")).unwrap().is_some());

        let _ = rx.try_recv();
        assert!(matches!(
            rx.try_recv(),
            Ok(EngineEvent::ChangeQueued { attempts: 0, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_fail_and_queue() {
        let h = harness();
        h.remote.fail_next_pushes(transient(10));

        let outcome = h.coordinator.request_save(mutation("r1", "open")).await;
        let failure = outcome.failure().unwrap();
        assert_eq!(failure.kind, ErrorKind::TransientNetwork);
        assert_eq!(failure.attempts, 3);
        assert_eq!(failure.record_id, rid("r1"));
        assert_eq!(h.queue.get(&rid("r1")).unwrap().attempts, 3);
        assert_eq!(h.remote.push_attempts(&rid("r1")), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_surfaces_immediately() {
        let h = harness();
        h.remote
            .fail_next_pushes([RemoteError::unauthorized("token expired")]);

        let start = tokio::time::Instant::now();
        let outcome = h.coordinator.request_save(mutation("r1", "open")).await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        let failure = outcome.failure().unwrap();
        assert_eq!(failure.kind, ErrorKind::PermanentRemote);
        assert_eq!(failure.attempts, 1);
        assert!(h.queue.contains(&rid("r1")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_clears_earlier_queued_change() {
        let h = harness();
        h.network.simulate(NetworkState::Offline);
        h.coordinator.request_save(mutation("r1", "draft")).await;
        assert_eq!(h.queue.len(), 1);

        h.network.simulate(NetworkState::Online);
        let outcome = h.coordinator.request_save(mutation("r1", "final")).await;
        assert!(outcome.is_success());
        assert!(h.queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_flight_last_request_wins() {
        let h = harness();
        h.remote.set_push_latency(Duration::from_millis(100));

        let mut handles = Vec::new();
        for i in 1..=5 {
            let coordinator = h.coordinator.clone();
            handles.push(tokio::spawn(async move {
                coordinator.request_save(mutation("r1", i)).await
            }));
            tokio::task::yield_now().await;
        }

        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.push(handle.await.unwrap());
        }

        assert_eq!(h.remote.max_in_flight_per_record(), 1);
        assert_eq!(outcomes.last(), Some(&SaveOutcome::Success));
        assert!(outcomes[1..4].iter().all(|o| *o == SaveOutcome::Cancelled));
        assert_eq!(
            h.remote.latest(&rid("r1")).unwrap().value("status"),
            Some(&json!(5))
        );
        assert_eq!(h.coordinator.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_records_do_not_block_each_other() {
        let h = harness();
        h.remote.set_push_latency(Duration::from_secs(1));

        let start = tokio::time::Instant::now();
        let (a, b) = tokio::join!(
            h.coordinator.request_save(mutation("a", 1)),
            h.coordinator.request_save(mutation("b", 2)),
        );
        assert!(a.is_success() && b.is_success());
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_retry_keeps_change_queued() {
        let h = harness();
        h.remote.fail_next_pushes(transient(10));

        let coordinator = h.coordinator.clone();
        let handle =
            tokio::spawn(async move { coordinator.request_save(mutation("r1", "open")).await });

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(
            h.coordinator.state(&rid("r1")),
            SaveState::Retrying {
                attempt: 2,
                delay: Duration::from_secs(2)
            }
        );
        h.coordinator.cancel_pending(&rid("r1"));

        assert_eq!(handle.await.unwrap(), SaveOutcome::Cancelled);
        assert!(h.queue.contains(&rid("r1")));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.remote.push_attempts(&rid("r1")), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_push_yields_to_active_save() {
        let h = harness();
        h.remote.set_push_latency(Duration::from_secs(1));
        let queued = PendingChange::new(
            h.store.commit_locally(&mutation("r1", "queued")).unwrap(),
            0,
        );

        let coordinator = h.coordinator.clone();
        let save =
            tokio::spawn(async move { coordinator.request_save(mutation("r1", "fresh")).await });
        tokio::task::yield_now().await;

        let pass = CancellationToken::new();
        assert!(h.coordinator.propagate_queued(&queued, &pass).await.is_none());
        assert!(save.await.unwrap().is_success());

        let outcome = h.coordinator.propagate_queued(&queued, &pass).await;
        assert!(matches!(outcome, Some(PropagationOutcome::Done { .. })));
        assert_eq!(h.remote.max_in_flight_per_record(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_idle_record_is_noop() {
        let h = harness();
        h.coordinator.cancel_pending(&rid("nothing"));
        assert!(h
            .coordinator
            .request_save(mutation("nothing", 1))
            .await
            .is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_stops_new_requests() {
        let h = harness();
        h.coordinator.cancel_all();
        assert!(h.coordinator.is_shut_down());

        let outcome = h.coordinator.request_save(mutation("r1", "open")).await;
        assert_eq!(outcome, SaveOutcome::Cancelled);
        assert!(h.store.load(&rid("r1")).unwrap().is_none());
    }
}
