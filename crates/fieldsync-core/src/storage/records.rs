//! SQLite record store

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::error::LocalCommitError;
use crate::models::{Mutation, RecordId, RevisionedPayload};
use crate::storage::schema::{init_schema, needs_init};
use crate::store::{next_revision, supersedes, LocalStore};

/// Local record store on a SQLite file
pub struct SqliteStore {
    path: PathBuf,
    device_id: String,
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.path)
            .field("device_id", &self.device_id)
            .finish()
    }
}

impl SqliteStore {
    /// Open or create the store at `path`
    pub fn open(path: &Path, device_id: impl Into<String>) -> Result<Self, LocalCommitError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| LocalCommitError::from_io(e, parent.to_path_buf()))?;
            }
        }

        let conn = Connection::open(path).map_err(LocalCommitError::from_sqlite)?;
        if needs_init(&conn) {
            init_schema(&conn).map_err(LocalCommitError::from_sqlite)?;
        }

        debug!(?path, "Opened local record store");
        Ok(Self {
            path: path.to_path_buf(),
            device_id: device_id.into(),
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory(device_id: impl Into<String>) -> Result<Self, LocalCommitError> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            path: PathBuf::from(":memory:"),
            device_id: device_id.into(),
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn read_record(
    conn: &Connection,
    record_id: &RecordId,
) -> Result<Option<RevisionedPayload>, LocalCommitError> {
    let json: Option<String> = conn
        .query_row(
            "SELECT payload FROM records WHERE record_id = ?1",
            params![record_id.as_str()],
            |row| row.get(0),
        )
        .optional()
        .map_err(LocalCommitError::from_sqlite)?;

    json.map(|json| decode(record_id, &json)).transpose()
}

fn write_record(conn: &Connection, payload: &RevisionedPayload) -> Result<(), LocalCommitError> {
    let json = serde_json::to_string(payload).map_err(|e| LocalCommitError::Corrupt {
        record_id: payload.record_id.clone(),
        details: e.to_string(),
    })?;
    conn.execute(
        "INSERT OR REPLACE INTO records (record_id, kind, payload, updated_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            payload.record_id.as_str(),
            payload.kind.as_str(),
            json,
            Utc::now().to_rfc3339(),
        ],
    )
    .map_err(LocalCommitError::from_sqlite)?;
    Ok(())
}

fn decode(record_id: &RecordId, json: &str) -> Result<RevisionedPayload, LocalCommitError> {
    serde_json::from_str(json).map_err(|e| LocalCommitError::Corrupt {
        record_id: record_id.clone(),
        details: e.to_string(),
    })
}

impl LocalStore for SqliteStore {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn commit_locally(&self, mutation: &Mutation) -> Result<RevisionedPayload, LocalCommitError> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(LocalCommitError::from_sqlite)?;

        let existing = read_record(&tx, &mutation.record_id)?;
        let payload = next_revision(existing, mutation, &self.device_id);
        write_record(&tx, &payload)?;

        tx.commit().map_err(LocalCommitError::from_sqlite)?;
        debug!(record_id = %payload.record_id, clock = %payload.clock, "Committed locally");
        Ok(payload)
    }

    fn load(&self, record_id: &RecordId) -> Result<Option<RevisionedPayload>, LocalCommitError> {
        read_record(&self.lock(), record_id)
    }

    fn apply_remote(&self, payload: &RevisionedPayload) -> Result<bool, LocalCommitError> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(LocalCommitError::from_sqlite)?;

        let stored = read_record(&tx, &payload.record_id)?;
        if !supersedes(stored.as_ref(), payload) {
            return Ok(false);
        }
        write_record(&tx, payload)?;

        tx.commit().map_err(LocalCommitError::from_sqlite)?;
        Ok(true)
    }

    fn list(&self) -> Result<Vec<RevisionedPayload>, LocalCommitError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT record_id, payload FROM records ORDER BY record_id ASC")
            .map_err(LocalCommitError::from_sqlite)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(LocalCommitError::from_sqlite)?;

        let mut records = Vec::new();
        for row in rows {
            let (record_id, json) = row.map_err(LocalCommitError::from_sqlite)?;
            let record_id = RecordId::new(record_id)
                .map_err(|e| LocalCommitError::Other(e.to_string()))?;
            records.push(decode(&record_id, &json)?);
        }
        Ok(records)
    }
}
