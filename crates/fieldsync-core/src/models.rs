//! Data models for FieldSync
//!
//! Defines the records the engine moves around: record identifiers,
//! mutations, vector clocks, revisioned payloads and queued changes.
//! Payload fields are JSON values so any record schema can ride through
//! the engine without the engine knowing it.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::EngineError;

/// Opaque identifier of a logical record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Create a record id; empty or whitespace-only ids are rejected
    pub fn new(id: impl Into<String>) -> Result<Self, EngineError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(EngineError::InvalidRequest(
                "record id must not be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RecordId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Kind of record (e.g. "inspection", "customer")
///
/// Conflict resolution strategies are chosen per kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordKind(String);

impl RecordKind {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Causal relationship between two versions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CausalOrder {
    /// Same history
    Equal,
    /// Self is a strict ancestor of other
    Before,
    /// Self strictly descends from other
    After,
    /// Neither is an ancestor of the other
    Concurrent,
}

/// Vector clock for causality tracking
///
/// One counter per device that ever wrote the record.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    clocks: BTreeMap<String, u64>,
}

impl VectorClock {
    /// Create a new empty vector clock
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the clock for a device
    pub fn increment(&mut self, device_id: &str) {
        let counter = self.clocks.entry(device_id.to_string()).or_insert(0);
        *counter += 1;
    }

    /// Get the clock value for a device
    pub fn get(&self, device_id: &str) -> u64 {
        self.clocks.get(device_id).copied().unwrap_or(0)
    }

    /// Merge with another vector clock (take maximum)
    pub fn merge(&mut self, other: &VectorClock) {
        for (device, &value) in &other.clocks {
            let entry = self.clocks.entry(device.clone()).or_insert(0);
            *entry = (*entry).max(value);
        }
    }

    /// Merged copy of two clocks
    pub fn merged(&self, other: &VectorClock) -> VectorClock {
        let mut clock = self.clone();
        clock.merge(other);
        clock
    }

    pub fn is_empty(&self) -> bool {
        self.clocks.values().all(|&v| v == 0)
    }

    /// Compare two clocks
    pub fn compare(&self, other: &VectorClock) -> CausalOrder {
        let mut less = false;
        let mut greater = false;

        for device in self.clocks.keys().chain(other.clocks.keys()) {
            match self.get(device).cmp(&other.get(device)) {
                Ordering::Less => less = true,
                Ordering::Greater => greater = true,
                Ordering::Equal => {}
            }
        }

        match (less, greater) {
            (false, false) => CausalOrder::Equal,
            (true, false) => CausalOrder::Before,
            (false, true) => CausalOrder::After,
            (true, true) => CausalOrder::Concurrent,
        }
    }

    /// Check if this clock happened before another
    pub fn happened_before(&self, other: &VectorClock) -> bool {
        self.compare(other) == CausalOrder::Before
    }

    /// Check if this clock equals or descends from another
    pub fn descends(&self, other: &VectorClock) -> bool {
        matches!(self.compare(other), CausalOrder::Equal | CausalOrder::After)
    }

    /// Check if two clocks are concurrent (neither happened before the other)
    pub fn concurrent_with(&self, other: &VectorClock) -> bool {
        self.compare(other) == CausalOrder::Concurrent
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .clocks
            .iter()
            .map(|(device, counter)| format!("{}:{}", short_device(device), counter))
            .collect();
        write!(f, "[{}]", parts.join(", "))
    }
}

fn short_device(device: &str) -> &str {
    device.get(..8).unwrap_or(device)
}

/// A single field value with the record clock at which it was last written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldVersion {
    pub value: Value,
    pub clock: VectorClock,
}

/// A record value with enough metadata to order it against another version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionedPayload {
    pub record_id: RecordId,
    pub kind: RecordKind,
    /// Record-level clock
    pub clock: VectorClock,
    pub fields: BTreeMap<String, FieldVersion>,
    /// Wall-clock time of the last write (used by last-writer-wins)
    pub modified_at: DateTime<Utc>,
    /// Device that produced this version
    pub origin: String,
}

impl RevisionedPayload {
    /// Create an empty payload that no device has written yet
    pub fn new(record_id: RecordId, kind: RecordKind, origin: impl Into<String>) -> Self {
        Self {
            record_id,
            kind,
            clock: VectorClock::new(),
            fields: BTreeMap::new(),
            modified_at: Utc::now(),
            origin: origin.into(),
        }
    }

    /// Apply a mutation as a new local revision written by `device_id`
    pub fn apply(&mut self, mutation: &Mutation, device_id: &str) {
        self.clock.increment(device_id);
        for (name, value) in &mutation.changes {
            self.fields.insert(
                name.clone(),
                FieldVersion {
                    value: value.clone(),
                    clock: self.clock.clone(),
                },
            );
        }
        self.kind = mutation.kind.clone();
        self.modified_at = Utc::now();
        self.origin = device_id.to_string();
    }

    /// Get a field value
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.fields.get(name).map(|f| &f.value)
    }

    /// Plain field values without per-field clocks
    pub fn values(&self) -> BTreeMap<String, Value> {
        self.fields
            .iter()
            .map(|(name, field)| (name.clone(), field.value.clone()))
            .collect()
    }

    /// Causal order of this version relative to another
    pub fn causal_order(&self, other: &RevisionedPayload) -> CausalOrder {
        self.clock.compare(&other.clock)
    }
}

/// An intended change to one record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub record_id: RecordId,
    pub kind: RecordKind,
    /// Field name to new value; `null` clears a field
    pub changes: BTreeMap<String, Value>,
}

impl Mutation {
    pub fn new(record_id: RecordId, kind: RecordKind) -> Self {
        Self {
            record_id,
            kind,
            changes: BTreeMap::new(),
        }
    }

    /// Builder-style field assignment
    pub fn set(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.changes.insert(name.into(), value.into());
        self
    }

    /// A well-formed mutation changes at least one named field
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.changes.is_empty() {
            return Err(EngineError::InvalidRequest(format!(
                "mutation for '{}' has no field changes",
                self.record_id
            )));
        }
        if self.changes.keys().any(|name| name.trim().is_empty()) {
            return Err(EngineError::InvalidRequest(format!(
                "mutation for '{}' has an empty field name",
                self.record_id
            )));
        }
        Ok(())
    }
}

/// A committed local write not yet confirmed by the remote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingChange {
    /// Identity of this queue entry (distinct per enqueue)
    pub change_id: Uuid,
    pub record_id: RecordId,
    pub record_kind: RecordKind,
    pub payload: RevisionedPayload,
    pub enqueued_at: DateTime<Utc>,
    /// Propagation attempts made so far
    pub attempts: u32,
}

impl PendingChange {
    pub fn new(payload: RevisionedPayload, attempts: u32) -> Self {
        Self {
            change_id: Uuid::new_v4(),
            record_id: payload.record_id.clone(),
            record_kind: payload.kind.clone(),
            payload,
            enqueued_at: Utc::now(),
            attempts,
        }
    }
}

/// Position in the remote change stream; zero means nothing incorporated yet
pub type Watermark = u64;

/// One entry of the remote change stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteChange {
    /// Remote sequence number (strictly increasing)
    pub seq: Watermark,
    pub payload: RevisionedPayload,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rid(id: &str) -> RecordId {
        RecordId::new(id).unwrap()
    }

    #[test]
    fn test_record_id_rejects_empty() {
        assert!(RecordId::new("").is_err());
        assert!(RecordId::new("   ").is_err());
        assert_eq!(rid("form-1").as_str(), "form-1");
    }

    #[test]
    fn test_vector_clock_ordering() {
        let mut a = VectorClock::new();
        a.increment("device-a");

        let mut b = a.clone();
        b.increment("device-b");

        assert_eq!(a.compare(&b), CausalOrder::Before);
        assert_eq!(b.compare(&a), CausalOrder::After);
        assert!(a.happened_before(&b));
        assert!(b.descends(&a));
        assert!(a.descends(&a));

        let mut c = a.clone();
        c.increment("device-a");
        assert!(b.concurrent_with(&c));
        assert_eq!(b.merged(&c).compare(&b), CausalOrder::After);
        assert_eq!(b.merged(&c).compare(&c), CausalOrder::After);
    }

    #[test]
    fn test_missing_entries_count_as_zero() {
        let mut a = VectorClock::new();
        a.increment("x");
        let b = VectorClock::new();
        assert_eq!(b.compare(&a), CausalOrder::Before);
        assert!(b.is_empty());
    }

    #[test]
    fn test_apply_stamps_field_clocks() {
        let mut payload = RevisionedPayload::new(rid("r1"), RecordKind::new("form"), "dev");
        let m1 = Mutation::new(rid("r1"), RecordKind::new("form")).set("name", "Ada");
        payload.apply(&m1, "dev");

        let m2 = Mutation::new(rid("r1"), RecordKind::new("form")).set("age", 36);
        payload.apply(&m2, "dev");

        assert_eq!(payload.clock.get("dev"), 2);
        assert_eq!(payload.fields["name"].clock.get("dev"), 1);
        assert_eq!(payload.fields["age"].clock.get("dev"), 2);
        assert_eq!(payload.value("age"), Some(&json!(36)));
    }

    #[test]
    fn test_mutation_validation() {
        let empty = Mutation::new(rid("r1"), RecordKind::new("form"));
        assert!(empty.validate().is_err());

        let blank_field = Mutation::new(rid("r1"), RecordKind::new("form")).set(" ", 1);
        assert!(blank_field.validate().is_err());

        let ok = Mutation::new(rid("r1"), RecordKind::new("form")).set("a", 1);
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_payload_serialization() {
        let mut payload = RevisionedPayload::new(rid("r1"), RecordKind::new("form"), "dev");
        payload.apply(
            &Mutation::new(rid("r1"), RecordKind::new("form")).set("notes", "ok"),
            "dev",
        );

        let json = serde_json::to_string(&payload).unwrap();
        let parsed: RevisionedPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, payload);
    }
}
