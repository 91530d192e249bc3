//! Pending change queue
//!
//! Ordered record of committed local writes the remote has not confirmed
//! yet. The queue keeps at most one entry per record (the latest wins) and
//! hands them out oldest first.
//!
//! ## Durability
//!
//! When opened on a file the queue writes every mutation to SQLite before
//! touching its in-memory view, so a crash at any point leaves a queue that
//! can be replayed as-is. Draining never removes entries; only a confirmed
//! propagation does.
//!
//! ## Watermark
//!
//! The sync watermark lives behind the same lock as the entries. A
//! save-triggered enqueue racing a sync-triggered drain or watermark update
//! is therefore always serialized.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::QueueError;
use crate::models::{
    CausalOrder, PendingChange, RecordId, RecordKind, RevisionedPayload, Watermark,
};

pub mod schema;

pub use schema::{init_schema, SCHEMA_VERSION};

const WATERMARK_KEY: &str = "watermark";
const LAST_SYNC_KEY: &str = "last_sync_at";

struct QueueInner {
    entries: Vec<PendingChange>,
    watermark: Watermark,
    last_sync_at: Option<DateTime<Utc>>,
    conn: Option<Connection>,
}

/// Thread-safe pending change queue
pub struct PendingChangeQueue {
    inner: Mutex<QueueInner>,
}

impl std::fmt::Debug for PendingChangeQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("PendingChangeQueue")
            .field("entries", &inner.entries.len())
            .field("watermark", &inner.watermark)
            .field("durable", &inner.conn.is_some())
            .finish()
    }
}

impl Default for PendingChangeQueue {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl PendingChangeQueue {
    /// Queue that lives only as long as the process
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                entries: Vec::new(),
                watermark: 0,
                last_sync_at: None,
                conn: None,
            }),
        }
    }

    /// Open a durable queue backed by a SQLite file, loading existing entries
    pub fn open(path: &Path) -> Result<Self, QueueError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| {
                    QueueError::CreateDirectory {
                        path: parent.to_path_buf(),
                        source,
                    }
                })?;
            }
        }

        let conn = Connection::open(path)?;
        init_schema(&conn)?;

        let entries = load_entries(&conn)?;
        let watermark = read_meta(&conn, WATERMARK_KEY)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let last_sync_at = read_meta(&conn, LAST_SYNC_KEY)?
            .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
            .map(|dt| dt.with_timezone(&Utc));

        debug!(?path, entries = entries.len(), watermark, "Opened pending change queue");

        Ok(Self {
            inner: Mutex::new(QueueInner {
                entries,
                watermark,
                last_sync_at,
                conn: Some(conn),
            }),
        })
    }

    /// Add a change, replacing any earlier entry for the same record
    ///
    /// A change older than the one already queued for its record is
    /// dropped; the queued version already contains it.
    pub fn enqueue(&self, change: PendingChange) -> Result<(), QueueError> {
        let mut inner = self.lock();

        if let Some(existing) = inner.entries.iter().find(|e| e.record_id == change.record_id) {
            if existing.payload.causal_order(&change.payload) == CausalOrder::After {
                debug!(record_id = %change.record_id, "Queued change already newer, skipping");
                return Ok(());
            }
        }

        if let Some(ref mut conn) = inner.conn {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM pending_changes WHERE record_id = ?1",
                params![change.record_id.as_str()],
            )?;
            tx.execute(
                "INSERT INTO pending_changes
                    (record_id, change_id, record_kind, payload, enqueued_at, attempts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    change.record_id.as_str(),
                    change.change_id.to_string(),
                    change.record_kind.as_str(),
                    serde_json::to_string(&change.payload)?,
                    change.enqueued_at.to_rfc3339(),
                    change.attempts,
                ],
            )?;
            tx.commit()?;
        }

        let replaced = remove_entry(&mut inner.entries, &change.record_id);
        debug!(
            record_id = %change.record_id,
            replaced = replaced.is_some(),
            "Enqueued pending change"
        );
        inner.entries.push(change);
        Ok(())
    }

    /// Snapshot of the queue, oldest first, one entry per record
    ///
    /// Does not remove anything; draining twice returns the same changes.
    pub fn drain(&self) -> Vec<PendingChange> {
        let mut changes = self.lock().entries.clone();
        changes.sort_by_key(|change| change.enqueued_at);
        changes
    }

    /// Remove the entry for a record; absent records are a no-op
    pub fn remove(&self, record_id: &RecordId) -> Result<bool, QueueError> {
        let mut inner = self.lock();
        if let Some(ref conn) = inner.conn {
            conn.execute(
                "DELETE FROM pending_changes WHERE record_id = ?1",
                params![record_id.as_str()],
            )?;
        }
        Ok(remove_entry(&mut inner.entries, record_id).is_some())
    }

    /// Remove the entry for a record if `delivered` covers it
    ///
    /// Used once a version reached the remote: a queued version that the
    /// delivered one equals or descends from is no longer pending.
    pub fn remove_delivered(&self, delivered: &RevisionedPayload) -> Result<bool, QueueError> {
        let mut inner = self.lock();
        let covered = inner.entries.iter().any(|e| {
            e.record_id == delivered.record_id && delivered.clock.descends(&e.payload.clock)
        });
        if !covered {
            return Ok(false);
        }

        if let Some(ref conn) = inner.conn {
            conn.execute(
                "DELETE FROM pending_changes WHERE record_id = ?1",
                params![delivered.record_id.as_str()],
            )?;
        }
        remove_entry(&mut inner.entries, &delivered.record_id);
        Ok(true)
    }

    /// Remove exactly this change if it is still the queued one
    ///
    /// A newer change enqueued for the same record in the meantime stays.
    pub fn confirm(&self, change: &PendingChange) -> Result<bool, QueueError> {
        let mut inner = self.lock();
        let still_queued = inner
            .entries
            .iter()
            .any(|e| e.record_id == change.record_id && e.change_id == change.change_id);
        if !still_queued {
            return Ok(false);
        }

        if let Some(ref conn) = inner.conn {
            conn.execute(
                "DELETE FROM pending_changes WHERE record_id = ?1 AND change_id = ?2",
                params![change.record_id.as_str(), change.change_id.to_string()],
            )?;
        }
        remove_entry(&mut inner.entries, &change.record_id);
        Ok(true)
    }

    /// Count a failed propagation attempt against a queued change
    pub fn record_attempts(&self, change_id: Uuid, attempts: u32) -> Result<(), QueueError> {
        let mut inner = self.lock();
        let Some(entry) = inner.entries.iter_mut().find(|e| e.change_id == change_id) else {
            return Ok(());
        };
        entry.attempts = entry.attempts.saturating_add(attempts);
        let total = entry.attempts;

        if let Some(ref conn) = inner.conn {
            conn.execute(
                "UPDATE pending_changes SET attempts = ?1 WHERE change_id = ?2",
                params![total, change_id.to_string()],
            )?;
        }
        Ok(())
    }

    /// Queued change for a record, if any
    pub fn get(&self, record_id: &RecordId) -> Option<PendingChange> {
        self.lock()
            .entries
            .iter()
            .find(|e| &e.record_id == record_id)
            .cloned()
    }

    pub fn contains(&self, record_id: &RecordId) -> bool {
        self.lock().entries.iter().any(|e| &e.record_id == record_id)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn is_durable(&self) -> bool {
        self.lock().conn.is_some()
    }

    /// Position of the remote stream incorporated by the last complete sync
    pub fn watermark(&self) -> Watermark {
        self.lock().watermark
    }

    /// When the last complete sync finished
    pub fn last_sync_at(&self) -> Option<DateTime<Utc>> {
        self.lock().last_sync_at
    }

    /// Record a completed sync; the watermark never moves backwards
    pub fn advance_watermark(
        &self,
        watermark: Watermark,
        at: DateTime<Utc>,
    ) -> Result<Watermark, QueueError> {
        let mut inner = self.lock();
        let next = inner.watermark.max(watermark);

        if let Some(ref mut conn) = inner.conn {
            let tx = conn.transaction()?;
            write_meta(&tx, WATERMARK_KEY, &next.to_string())?;
            write_meta(&tx, LAST_SYNC_KEY, &at.to_rfc3339())?;
            tx.commit()?;
        }

        inner.watermark = next;
        inner.last_sync_at = Some(at);
        Ok(next)
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn remove_entry(entries: &mut Vec<PendingChange>, record_id: &RecordId) -> Option<PendingChange> {
    let pos = entries.iter().position(|e| &e.record_id == record_id)?;
    Some(entries.remove(pos))
}

fn load_entries(conn: &Connection) -> Result<Vec<PendingChange>, QueueError> {
    let mut stmt = conn.prepare(
        "SELECT record_id, change_id, record_kind, payload, enqueued_at, attempts
         FROM pending_changes ORDER BY position ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, u32>(5)?,
        ))
    })?;

    let mut entries = Vec::new();
    for row in rows {
        let (record_id, change_id, kind, payload, enqueued_at, attempts) = row?;

        let (Ok(record_id), Ok(change_id), Ok(enqueued_at)) = (
            RecordId::new(record_id.clone()),
            Uuid::parse_str(&change_id),
            DateTime::parse_from_rfc3339(&enqueued_at),
        ) else {
            warn!(record_id, "Skipping malformed pending change row");
            continue;
        };

        entries.push(PendingChange {
            change_id,
            record_id,
            record_kind: RecordKind::new(kind),
            payload: serde_json::from_str(&payload)?,
            enqueued_at: enqueued_at.with_timezone(&Utc),
            attempts,
        });
    }
    Ok(entries)
}

fn read_meta(conn: &Connection, key: &str) -> Result<Option<String>, QueueError> {
    let mut stmt = conn.prepare("SELECT value FROM sync_meta WHERE key = ?1")?;
    let mut rows = stmt.query(params![key])?;
    match rows.next()? {
        Some(row) => Ok(Some(row.get(0)?)),
        None => Ok(None),
    }
}

fn write_meta(conn: &Connection, key: &str, value: &str) -> Result<(), QueueError> {
    conn.execute(
        "INSERT OR REPLACE INTO sync_meta (key, value) VALUES (?1, ?2)",
        params![key, value],
    )?;
    Ok(())
}
