//! SQLite-file remote backend
//!
//! Stores the remote change stream in a single SQLite file. Pointing
//! several data directories at the same file gives each of them a shared
//! "cloud" to sync through, which is how the CLI exercises multi-device
//! sync without a server.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use super::RemoteBackend;
use crate::error::RemoteError;
use crate::models::{CausalOrder, RecordId, RemoteChange, RevisionedPayload, Watermark};
use crate::network::NetworkState;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS remote_changes (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        record_id TEXT NOT NULL,
        payload TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_remote_changes_record ON remote_changes(record_id, seq);
"#;

/// Remote backend stored in a SQLite file
pub struct SqliteRemote {
    path: PathBuf,
    conn: Mutex<Connection>,
    reachable: AtomicBool,
}

impl std::fmt::Debug for SqliteRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteRemote")
            .field("path", &self.path)
            .field("reachable", &self.reachable.load(Ordering::SeqCst))
            .finish()
    }
}

impl SqliteRemote {
    /// Open (or create) the remote file
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                // Creation failures surface as an open error below
                let _ = std::fs::create_dir_all(parent);
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        debug!(?path, "Opened SQLite remote");
        Ok(Self {
            path: path.to_path_buf(),
            conn: Mutex::new(conn),
            reachable: AtomicBool::new(true),
        })
    }

    /// Open an in-memory remote (tests)
    pub fn open_in_memory() -> Result<Self, rusqlite::Error> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            path: PathBuf::from(":memory:"),
            conn: Mutex::new(conn),
            reachable: AtomicBool::new(true),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Force the backend offline (or back online)
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_reachable(&self) -> Result<(), RemoteError> {
        if self.is_reachable() {
            Ok(())
        } else {
            Err(RemoteError::Unreachable)
        }
    }
}

/// Database errors on the remote side are indistinguishable from a flaky link
fn transient(error: impl std::fmt::Display) -> RemoteError {
    RemoteError::Transient(error.to_string())
}

fn decode(record_id: &str, json: &str) -> Result<RevisionedPayload, RemoteError> {
    serde_json::from_str(json).map_err(|e| {
        warn!(record_id, error = %e, "Undecodable remote payload");
        RemoteError::Permanent {
            reason: crate::error::PermanentReason::Rejected,
            message: format!("undecodable payload for '{}': {}", record_id, e),
        }
    })
}

#[async_trait]
impl RemoteBackend for SqliteRemote {
    async fn push(
        &self,
        record_id: &RecordId,
        payload: &RevisionedPayload,
    ) -> Result<(), RemoteError> {
        self.check_reachable()?;
        let json = serde_json::to_string(payload).map_err(transient)?;

        let mut conn = self.lock();
        let tx = conn.transaction().map_err(transient)?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT payload FROM remote_changes WHERE record_id = ?1 ORDER BY seq DESC LIMIT 1",
                params![record_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(transient)?;

        if let Some(existing) = existing {
            let existing = decode(record_id.as_str(), &existing)?;
            if matches!(
                existing.causal_order(payload),
                CausalOrder::After | CausalOrder::Equal
            ) {
                debug!(%record_id, "Remote already has this version");
                return Ok(());
            }
        }

        tx.execute(
            "INSERT INTO remote_changes (record_id, payload) VALUES (?1, ?2)",
            params![record_id.as_str(), json],
        )
        .map_err(transient)?;
        tx.commit().map_err(transient)?;
        Ok(())
    }

    async fn pull_since(
        &self,
        since: Watermark,
        limit: usize,
    ) -> Result<Vec<RemoteChange>, RemoteError> {
        self.check_reachable()?;
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT seq, record_id, payload FROM remote_changes
                 WHERE seq > ?1 ORDER BY seq ASC LIMIT ?2",
            )
            .map_err(transient)?;

        let since = i64::try_from(since).unwrap_or(i64::MAX);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(params![since, limit], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(transient)?;

        let mut changes = Vec::new();
        for row in rows {
            let (seq, record_id, json) = row.map_err(transient)?;
            changes.push(RemoteChange {
                seq: seq as Watermark,
                payload: decode(&record_id, &json)?,
            });
        }
        Ok(changes)
    }

    async fn head(&self) -> Result<Watermark, RemoteError> {
        self.check_reachable()?;
        let conn = self.lock();
        let head: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(seq), 0) FROM remote_changes",
                [],
                |row| row.get(0),
            )
            .map_err(transient)?;
        Ok(head as Watermark)
    }

    async fn reachability(&self) -> NetworkState {
        let parent_ok = self
            .path
            .parent()
            .map(|p| p.as_os_str().is_empty() || p.exists())
            .unwrap_or(true);
        if self.is_reachable() && parent_ok {
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
    use tempfile::TempDir;

    fn payload(id: &str, device: &str, value: &str) -> RevisionedPayload {
        let record_id = RecordId::new(id).unwrap();
        let mut p = RevisionedPayload::new(record_id.clone(), RecordKind::new("form"), device);
        p.apply(
            &Mutation::new(record_id, RecordKind::new("form")).set("status", value),
            device,
        );
        p
    }

    #[tokio::test]
    async fn test_shared_file_between_handles() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("remote.db");

        let writer = SqliteRemote::open(&path).unwrap();
        let p = payload("r1", "dev-a", "open");
        writer.push(&p.record_id, &p).await.unwrap();

        let reader = SqliteRemote::open(&path).unwrap();
        assert_eq!(reader.head().await.unwrap(), 1);
        let changes = reader.pull_since(0, 100).await.unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].payload, p);
    }

    #[tokio::test]
    async fn test_duplicate_push_is_idempotent() {
        let remote = SqliteRemote::open_in_memory().unwrap();
        let p = payload("r1", "dev-a", "open");
        remote.push(&p.record_id, &p).await.unwrap();
        remote.push(&p.record_id, &p).await.unwrap();
        assert_eq!(remote.head().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_forced_offline() {
        let remote = SqliteRemote::open_in_memory().unwrap();
        remote.set_reachable(false);
        assert_eq!(remote.reachability().await, NetworkState::Offline);

        let p = payload("r1", "dev-a", "open");
        assert_eq!(
            remote.push(&p.record_id, &p).await,
            Err(RemoteError::Unreachable)
        );
    }
}
