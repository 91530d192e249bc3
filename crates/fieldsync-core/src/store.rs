//! Local persistence collaborator
//!
//! The engine commits every save locally before it talks to the remote.
//! [`LocalStore`] is the seam: the CLI uses the SQLite-backed
//! [`SqliteStore`](crate::storage::SqliteStore), tests use [`MemoryStore`].
//!
//! ## Contract
//!
//! - `commit_locally` is atomic and durable: after `Ok` the new revision
//!   survives a crash, after `Err` nothing changed.
//! - `apply_remote` only replaces the stored version with one that descends
//!   from it. A version that lost a race with a local commit is skipped and
//!   reported as not applied, so a later sync can resolve it again.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use crate::error::LocalCommitError;
use crate::models::{CausalOrder, Mutation, RecordId, RevisionedPayload};

/// Local persistence used by the engine
pub trait LocalStore: Send + Sync {
    /// Device id stamped into vector clocks for local writes
    fn device_id(&self) -> &str;

    /// Apply a mutation as a new local revision and persist it
    fn commit_locally(&self, mutation: &Mutation) -> Result<RevisionedPayload, LocalCommitError>;

    /// Current local version of a record
    fn load(&self, record_id: &RecordId) -> Result<Option<RevisionedPayload>, LocalCommitError>;

    /// Store a remote or merged version; returns whether it was applied
    fn apply_remote(&self, payload: &RevisionedPayload) -> Result<bool, LocalCommitError>;

    /// All records, ordered by id
    fn list(&self) -> Result<Vec<RevisionedPayload>, LocalCommitError>;
}

/// Whether `incoming` may replace `stored`
pub(crate) fn supersedes(stored: Option<&RevisionedPayload>, incoming: &RevisionedPayload) -> bool {
    match stored {
        None => true,
        Some(stored) => matches!(incoming.causal_order(stored), CausalOrder::After),
    }
}

/// Build the next local revision of a record
pub(crate) fn next_revision(
    existing: Option<RevisionedPayload>,
    mutation: &Mutation,
    device_id: &str,
) -> RevisionedPayload {
    let mut payload = existing.unwrap_or_else(|| {
        RevisionedPayload::new(mutation.record_id.clone(), mutation.kind.clone(), device_id)
    });
    payload.apply(mutation, device_id);
    payload
}

/// In-memory local store with injectable commit failures
pub struct MemoryStore {
    device_id: String,
    records: Mutex<BTreeMap<RecordId, RevisionedPayload>>,
    commit_failures: Mutex<VecDeque<LocalCommitError>>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("device_id", &self.device_id)
            .finish()
    }
}

impl MemoryStore {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            records: Mutex::new(BTreeMap::new()),
            commit_failures: Mutex::new(VecDeque::new()),
        }
    }

    /// The next commit fails with `error`
    pub fn fail_next_commit(&self, error: LocalCommitError) {
        self.commit_failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(error);
    }

    fn records(&self) -> std::sync::MutexGuard<'_, BTreeMap<RecordId, RevisionedPayload>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl LocalStore for MemoryStore {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn commit_locally(&self, mutation: &Mutation) -> Result<RevisionedPayload, LocalCommitError> {
        if let Some(error) = self
            .commit_failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
        {
            return Err(error);
        }

        let mut records = self.records();
        let payload = next_revision(
            records.get(&mutation.record_id).cloned(),
            mutation,
            &self.device_id,
        );
        records.insert(payload.record_id.clone(), payload.clone());
        Ok(payload)
    }

    fn load(&self, record_id: &RecordId) -> Result<Option<RevisionedPayload>, LocalCommitError> {
        Ok(self.records().get(record_id).cloned())
    }

    fn apply_remote(&self, payload: &RevisionedPayload) -> Result<bool, LocalCommitError> {
        let mut records = self.records();
        if !supersedes(records.get(&payload.record_id), payload) {
            return Ok(false);
        }
        records.insert(payload.record_id.clone(), payload.clone());
        Ok(true)
    }

    fn list(&self) -> Result<Vec<RevisionedPayload>, LocalCommitError> {
        Ok(self.records().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordKind;

    fn mutation(id: &str, field: &str, value: &str) -> Mutation {
        Mutation::new(RecordId::new(id).unwrap(), RecordKind::new("form")).set(field, value)
    }

    #[test]
    fn test_commit_increments_revision() {
        let store = MemoryStore::new("dev-a");
        let first = store.commit_locally(&mutation("r1", "a", "1")).unwrap();
        let second = store.commit_locally(&mutation("r1", "b", "2")).unwrap();

        assert_eq!(first.clock.get("dev-a"), 1);
        assert_eq!(second.clock.get("dev-a"), 2);
        assert_eq!(second.values().len(), 2);
    }

    #[test]
    fn test_failed_commit_changes_nothing() {
        let store = MemoryStore::new("dev-a");
        store.fail_next_commit(LocalCommitError::StorageFull("full".into()));

        assert!(store.commit_locally(&mutation("r1", "a", "1")).is_err());
        assert!(store.load(&RecordId::new("r1").unwrap()).unwrap().is_none());
        assert!(store.commit_locally(&mutation("r1", "a", "1")).is_ok());
    }

    #[test]
    fn test_apply_remote_only_moves_forward() {
        let store = MemoryStore::new("dev-a");
        let local = store.commit_locally(&mutation("r1", "a", "1")).unwrap();

        let mut remote = local.clone();
        remote.apply(&mutation("r1", "a", "2"), "dev-b");
        assert!(store.apply_remote(&remote).unwrap());

        // The stale version is refused
        assert!(!store.apply_remote(&local).unwrap());

        // A concurrent version is refused as well
        let mut concurrent = local.clone();
        concurrent.apply(&mutation("r1", "a", "3"), "dev-c");
        assert!(!store.apply_remote(&concurrent).unwrap());

        let stored = store.load(&local.record_id).unwrap().unwrap();
        assert_eq!(stored, remote);
    }
}
