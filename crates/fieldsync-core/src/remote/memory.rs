//! In-process remote backend
//!
//! Keeps the change stream in memory. Several engines can share one
//! instance through an `Arc` to simulate devices syncing through the same
//! cloud store. Faults, latency and reachability can be injected.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::RemoteBackend;
use crate::error::RemoteError;
use crate::models::{CausalOrder, RecordId, RemoteChange, RevisionedPayload, Watermark};
use crate::network::NetworkState;

#[derive(Debug, Default)]
struct Inner {
    log: Vec<RemoteChange>,
    latest: HashMap<RecordId, RevisionedPayload>,
    scripted_push_failures: VecDeque<RemoteError>,
    scripted_pull_failures: VecDeque<RemoteError>,
    push_attempts: HashMap<RecordId, u32>,
    in_flight: HashMap<RecordId, usize>,
    max_in_flight: usize,
}

/// In-memory remote backend
#[derive(Debug)]
pub struct MemoryRemote {
    inner: Mutex<Inner>,
    reachable: AtomicBool,
    push_latency: Mutex<Duration>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            reachable: AtomicBool::new(true),
            push_latency: Mutex::new(Duration::ZERO),
        }
    }

    /// Make the backend (un)reachable
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Delay every push by `latency`
    pub fn set_push_latency(&self, latency: Duration) {
        *self
            .push_latency
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = latency;
    }

    /// The next pushes fail with these errors, in order
    pub fn fail_next_pushes(&self, errors: impl IntoIterator<Item = RemoteError>) {
        self.lock().scripted_push_failures.extend(errors);
    }

    /// The next pulls fail with these errors, in order
    pub fn fail_next_pulls(&self, errors: impl IntoIterator<Item = RemoteError>) {
        self.lock().scripted_pull_failures.extend(errors);
    }

    /// Insert a change as if another device had pushed it
    pub fn seed(&self, payload: RevisionedPayload) -> Watermark {
        let mut inner = self.lock();
        append(&mut inner, payload)
    }

    /// Latest stored version of a record
    pub fn latest(&self, record_id: &RecordId) -> Option<RevisionedPayload> {
        self.lock().latest.get(record_id).cloned()
    }

    /// Every version of a record accepted by the backend, oldest first
    pub fn history(&self, record_id: &RecordId) -> Vec<RevisionedPayload> {
        self.lock()
            .log
            .iter()
            .filter(|change| &change.payload.record_id == record_id)
            .map(|change| change.payload.clone())
            .collect()
    }

    /// Number of push attempts seen for a record (including failed ones)
    pub fn push_attempts(&self, record_id: &RecordId) -> u32 {
        self.lock()
            .push_attempts
            .get(record_id)
            .copied()
            .unwrap_or(0)
    }

    /// Highest number of simultaneous pushes ever observed for one record
    pub fn max_in_flight_per_record(&self) -> usize {
        self.lock().max_in_flight
    }

    pub fn change_count(&self) -> usize {
        self.lock().log.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn latency(&self) -> Duration {
        *self
            .push_latency
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}

/// Append a payload to the log unless the stored version already descends from it
fn append(inner: &mut Inner, payload: RevisionedPayload) -> Watermark {
    if let Some(existing) = inner.latest.get(&payload.record_id) {
        if matches!(
            existing.causal_order(&payload),
            CausalOrder::After | CausalOrder::Equal
        ) {
            return inner.log.last().map(|c| c.seq).unwrap_or(0);
        }
    }

    let seq = inner.log.last().map(|c| c.seq).unwrap_or(0) + 1;
    inner
        .latest
        .insert(payload.record_id.clone(), payload.clone());
    inner.log.push(RemoteChange { seq, payload });
    seq
}

#[async_trait]
impl RemoteBackend for MemoryRemote {
    async fn push(
        &self,
        record_id: &RecordId,
        payload: &RevisionedPayload,
    ) -> Result<(), RemoteError> {
        {
            let mut inner = self.lock();
            *inner.push_attempts.entry(record_id.clone()).or_insert(0) += 1;
            let count = {
                let entry = inner.in_flight.entry(record_id.clone()).or_insert(0);
                *entry += 1;
                *entry
            };
            inner.max_in_flight = inner.max_in_flight.max(count);
        }

        let latency = self.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut inner = self.lock();
        if let Some(count) = inner.in_flight.get_mut(record_id) {
            *count = count.saturating_sub(1);
        }

        if !self.is_reachable() {
            return Err(RemoteError::Unreachable);
        }
        if let Some(error) = inner.scripted_push_failures.pop_front() {
            debug!(%record_id, %error, "Injected push failure");
            return Err(error);
        }

        append(&mut inner, payload.clone());
        Ok(())
    }

    async fn pull_since(
        &self,
        since: Watermark,
        limit: usize,
    ) -> Result<Vec<RemoteChange>, RemoteError> {
        if !self.is_reachable() {
            return Err(RemoteError::Unreachable);
        }
        let mut inner = self.lock();
        if let Some(error) = inner.scripted_pull_failures.pop_front() {
            return Err(error);
        }
        Ok(inner
            .log
            .iter()
            .filter(|change| change.seq > since)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn head(&self) -> Result<Watermark, RemoteError> {
        if !self.is_reachable() {
            return Err(RemoteError::Unreachable);
        }
        Ok(self.lock().log.last().map(|c| c.seq).unwrap_or(0))
    }

    async fn reachability(&self) -> NetworkState {
        if self.is_reachable() {
            NetworkState::Online
        } else {
            NetworkState::Offline
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Mutation, RecordKind};

    fn payload(id: &str, device: &str, field: &str, value: &str) -> RevisionedPayload {
        let record_id = RecordId::new(id).unwrap();
        let mut p = RevisionedPayload::new(record_id.clone(), RecordKind::new("form"), device);
        p.apply(
            &Mutation::new(record_id, RecordKind::new("form")).set(field, value),
            device,
        );
        p
    }

    #[tokio::test]
    async fn test_push_then_pull() {
        let remote = MemoryRemote::new();
        let p = payload("r1", "dev-a", "name", "Ada");

        remote.push(&p.record_id, &p).await.unwrap();
        assert_eq!(remote.head().await.unwrap(), 1);

        let changes = remote.pull_since(0, 10).await.unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].payload, p);
        assert!(remote.pull_since(1, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_push_is_ignored() {
        let remote = MemoryRemote::new();
        let mut p = payload("r1", "dev-a", "name", "Ada");
        let old = p.clone();
        p.apply(
            &Mutation::new(p.record_id.clone(), RecordKind::new("form")).set("name", "Grace"),
            "dev-a",
        );

        remote.push(&p.record_id, &p).await.unwrap();
        remote.push(&old.record_id, &old).await.unwrap();

        assert_eq!(remote.change_count(), 1);
        assert_eq!(remote.latest(&p.record_id).unwrap(), p);
    }

    #[tokio::test]
    async fn test_injected_failures_and_reachability() {
        let remote = MemoryRemote::new();
        let p = payload("r1", "dev-a", "name", "Ada");

        remote.fail_next_pushes([RemoteError::Transient("reset".into())]);
        assert!(remote.push(&p.record_id, &p).await.is_err());
        assert!(remote.push(&p.record_id, &p).await.is_ok());
        assert_eq!(remote.push_attempts(&p.record_id), 2);

        remote.set_reachable(false);
        assert_eq!(remote.reachability().await, NetworkState::Offline);
        assert_eq!(
            remote.push(&p.record_id, &p).await,
            Err(RemoteError::Unreachable)
        );
        assert!(remote.head().await.is_err());
    }

    #[tokio::test]
    async fn test_pull_respects_limit() {
        let remote = MemoryRemote::new();
        for i in 0..5 {
            remote.seed(payload(&format!("r{}", i), "dev-b", "n", "v"));
        }
        let first = remote.pull_since(0, 2).await.unwrap();
        assert_eq!(first.iter().map(|c| c.seq).collect::<Vec<_>>(), vec![1, 2]);
        let rest = remote.pull_since(2, 10).await.unwrap();
        assert_eq!(rest.len(), 3);
    }
}
