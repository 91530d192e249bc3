//! Conflict detection and resolution
//!
//! Two versions of a record are first ordered by their vector clocks. If one
//! descends from the other the descendant wins and nothing else happens.
//! Only truly concurrent versions reach a [`MergeStrategy`], chosen per
//! record kind:
//!
//! - [`FieldMerge`] (default): combines edits to different fields; a field
//!   changed on both sides to different values needs a user decision
//! - [`LastWriterWins`]: the version with the later `modified_at` wins, ties
//!   broken by the larger origin device id
//!
//! ## Field clocks
//!
//! Every field carries the record clock at which it was last written. When
//! both sides hold different values for a field, the side whose field clock
//! descends from the other's wrote last with knowledge of the other write
//! and wins; concurrent field clocks are a real conflict.
//!
//! Resolution is deterministic: the same pair of versions always produces
//! the same result, on every device and in either argument order.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::models::{
    CausalOrder, FieldVersion, RecordId, RecordKind, RevisionedPayload, VectorClock,
};

/// How a concurrent conflict was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    AutoResolved,
    ManualRequired,
}

/// One field changed on both sides to different values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConflict {
    pub field: String,
    pub local: Value,
    pub remote: Value,
}

/// Audit record of a concurrent edit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub record_id: RecordId,
    pub local_revision: VectorClock,
    pub remote_revision: VectorClock,
    pub resolution: ConflictResolution,
    /// Present when the conflict was resolved automatically
    pub resolved_payload: Option<RevisionedPayload>,
    /// Fields both sides changed to different values
    pub candidates: Vec<FieldConflict>,
}

impl ConflictRecord {
    /// Record of an automatically merged conflict
    pub fn auto_resolved(
        local: &RevisionedPayload,
        remote: &RevisionedPayload,
        resolved: RevisionedPayload,
    ) -> Self {
        Self {
            record_id: local.record_id.clone(),
            local_revision: local.clock.clone(),
            remote_revision: remote.clock.clone(),
            resolution: ConflictResolution::AutoResolved,
            resolved_payload: Some(resolved),
            candidates: Vec::new(),
        }
    }

    /// Record of a conflict that needs a user decision
    pub fn manual(
        local: &RevisionedPayload,
        remote: &RevisionedPayload,
        candidates: Vec<FieldConflict>,
    ) -> Self {
        Self {
            record_id: local.record_id.clone(),
            local_revision: local.clock.clone(),
            remote_revision: remote.clock.clone(),
            resolution: ConflictResolution::ManualRequired,
            resolved_payload: None,
            candidates,
        }
    }

    pub fn is_manual(&self) -> bool {
        self.resolution == ConflictResolution::ManualRequired
    }
}

/// Outcome of resolving a local version against a remote one
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Both sides hold the same version
    Identical,
    /// Local descends from remote; nothing to apply locally
    KeepLocal,
    /// Remote descends from local; apply it
    TakeRemote,
    /// Concurrent versions merged into a payload that descends from both
    Merged {
        payload: RevisionedPayload,
        record: ConflictRecord,
    },
    /// Concurrent versions that need a user decision
    ManualRequired(ConflictRecord),
}

/// Result of a merge strategy
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    Merged(RevisionedPayload),
    Conflicts(Vec<FieldConflict>),
}

/// Strategy for merging two concurrent versions of a record
pub trait MergeStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn merge(&self, local: &RevisionedPayload, remote: &RevisionedPayload) -> MergeOutcome;
}

/// Pick the later writer; ties go to the larger origin id
fn later_writer<'a>(
    a: &'a RevisionedPayload,
    b: &'a RevisionedPayload,
) -> &'a RevisionedPayload {
    match a.modified_at.cmp(&b.modified_at) {
        std::cmp::Ordering::Greater => a,
        std::cmp::Ordering::Less => b,
        std::cmp::Ordering::Equal => {
            if a.origin >= b.origin {
                a
            } else {
                b
            }
        }
    }
}

/// Field-level three-way merge using per-field clocks
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldMerge;

impl FieldMerge {
    pub(crate) fn merge_field(
        name: &str,
        local: Option<&FieldVersion>,
        remote: Option<&FieldVersion>,
    ) -> Result<Option<FieldVersion>, FieldConflict> {
        match (local, remote) {
            (None, None) => Ok(None),
            (Some(only), None) | (None, Some(only)) => Ok(Some(only.clone())),
            (Some(l), Some(r)) if l.value == r.value => Ok(Some(FieldVersion {
                value: l.value.clone(),
                clock: l.clock.merged(&r.clock),
            })),
            (Some(l), Some(r)) => match l.clock.compare(&r.clock) {
                CausalOrder::After => Ok(Some(l.clone())),
                CausalOrder::Before => Ok(Some(r.clone())),
                CausalOrder::Equal | CausalOrder::Concurrent => Err(FieldConflict {
                    field: name.to_string(),
                    local: l.value.clone(),
                    remote: r.value.clone(),
                }),
            },
        }
    }
}

impl MergeStrategy for FieldMerge {
    fn name(&self) -> &'static str {
        "field_merge"
    }

    fn merge(&self, local: &RevisionedPayload, remote: &RevisionedPayload) -> MergeOutcome {
        let names: BTreeSet<&String> = local.fields.keys().chain(remote.fields.keys()).collect();

        let mut fields = std::collections::BTreeMap::new();
        let mut conflicts = Vec::new();
        for name in names {
            match Self::merge_field(name, local.fields.get(name), remote.fields.get(name)) {
                Ok(Some(field)) => {
                    fields.insert(name.clone(), field);
                }
                Ok(None) => {}
                Err(conflict) => conflicts.push(conflict),
            }
        }

        if !conflicts.is_empty() {
            return MergeOutcome::Conflicts(conflicts);
        }

        let writer = later_writer(local, remote);
        MergeOutcome::Merged(RevisionedPayload {
            record_id: local.record_id.clone(),
            kind: writer.kind.clone(),
            clock: local.clock.merged(&remote.clock),
            fields,
            modified_at: writer.modified_at,
            origin: writer.origin.clone(),
        })
    }
}

/// Whole-record last-writer-wins
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriterWins;

impl MergeStrategy for LastWriterWins {
    fn name(&self) -> &'static str {
        "last_writer_wins"
    }

    fn merge(&self, local: &RevisionedPayload, remote: &RevisionedPayload) -> MergeOutcome {
        let winner = later_writer(local, remote);
        let mut merged = winner.clone();
        merged.clock = local.clock.merged(&remote.clock);
        MergeOutcome::Merged(merged)
    }
}

/// Resolves local against remote versions with per-kind strategies
#[derive(Clone)]
pub struct ConflictResolver {
    default_strategy: Arc<dyn MergeStrategy>,
    strategies: HashMap<RecordKind, Arc<dyn MergeStrategy>>,
}

impl fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kinds: HashMap<&str, &str> = self
            .strategies
            .iter()
            .map(|(kind, s)| (kind.as_str(), s.name()))
            .collect();
        f.debug_struct("ConflictResolver")
            .field("default_strategy", &self.default_strategy.name())
            .field("strategies", &kinds)
            .finish()
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ConflictResolver {
    /// Resolver that field-merges every kind
    pub fn new() -> Self {
        Self {
            default_strategy: Arc::new(FieldMerge),
            strategies: HashMap::new(),
        }
    }

    /// Replace the strategy used for kinds without their own
    pub fn with_default_strategy(mut self, strategy: Arc<dyn MergeStrategy>) -> Self {
        self.default_strategy = strategy;
        self
    }

    /// Use `strategy` for records of `kind`
    pub fn with_strategy(mut self, kind: RecordKind, strategy: Arc<dyn MergeStrategy>) -> Self {
        self.strategies.insert(kind, strategy);
        self
    }

    pub fn strategy_for(&self, kind: &RecordKind) -> &dyn MergeStrategy {
        self.strategies
            .get(kind)
            .unwrap_or(&self.default_strategy)
            .as_ref()
    }

    /// Resolve a local version against a remote version of the same record
    pub fn resolve(&self, local: &RevisionedPayload, remote: &RevisionedPayload) -> Resolution {
        match local.causal_order(remote) {
            CausalOrder::Equal => Resolution::Identical,
            CausalOrder::After => Resolution::KeepLocal,
            CausalOrder::Before => Resolution::TakeRemote,
            CausalOrder::Concurrent => {
                let strategy = self.strategy_for(&local.kind);
                debug!(
                    record_id = %local.record_id,
                    local = %local.clock,
                    remote = %remote.clock,
                    strategy = strategy.name(),
                    "Concurrent versions"
                );
                match strategy.merge(local, remote) {
                    MergeOutcome::Merged(payload) => Resolution::Merged {
                        record: ConflictRecord::auto_resolved(local, remote, payload.clone()),
                        payload,
                    },
                    MergeOutcome::Conflicts(candidates) => {
                        Resolution::ManualRequired(ConflictRecord::manual(local, remote, candidates))
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Mutation;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn base() -> RevisionedPayload {
        let id = RecordId::new("r1").unwrap();
        let mut p = RevisionedPayload::new(id.clone(), RecordKind::new("form"), "dev-a");
        p.apply(
            &Mutation::new(id, RecordKind::new("form"))
                .set("name", "Ada")
                .set("status", "open"),
            "dev-a",
        );
        p
    }

    fn edit(p: &RevisionedPayload, device: &str, field: &str, value: Value) -> RevisionedPayload {
        let mut next = p.clone();
        next.apply(
            &Mutation::new(p.record_id.clone(), p.kind.clone()).set(field, value),
            device,
        );
        next
    }

    #[test]
    fn test_causal_order_wins_without_strategy() {
        let resolver = ConflictResolver::new();
        let a = base();
        let b = edit(&a, "dev-b", "status", json!("closed"));

        assert_eq!(resolver.resolve(&a, &a), Resolution::Identical);
        assert_eq!(resolver.resolve(&b, &a), Resolution::KeepLocal);
        assert_eq!(resolver.resolve(&a, &b), Resolution::TakeRemote);
    }

    #[test]
    fn test_disjoint_fields_merge() {
        let resolver = ConflictResolver::new();
        let a = base();
        let local = edit(&a, "dev-a", "name", json!("Grace"));
        let remote = edit(&a, "dev-b", "status", json!("closed"));

        let Resolution::Merged { payload, record } = resolver.resolve(&local, &remote) else {
            panic!("expected merge");
        };
        assert_eq!(payload.value("name"), Some(&json!("Grace")));
        assert_eq!(payload.value("status"), Some(&json!("closed")));
        assert_eq!(payload.causal_order(&local), CausalOrder::After);
        assert_eq!(payload.causal_order(&remote), CausalOrder::After);
        assert_eq!(record.resolution, ConflictResolution::AutoResolved);
        assert!(record.candidates.is_empty());
    }

    #[test]
    fn test_merge_is_symmetric() {
        let resolver = ConflictResolver::new();
        let a = base();
        let local = edit(&a, "dev-a", "name", json!("Grace"));
        let remote = edit(&a, "dev-b", "status", json!("closed"));

        let Resolution::Merged { payload: ab, .. } = resolver.resolve(&local, &remote) else {
            panic!("expected merge");
        };
        let Resolution::Merged { payload: ba, .. } = resolver.resolve(&remote, &local) else {
            panic!("expected merge");
        };
        assert_eq!(ab.values(), ba.values());
        assert_eq!(ab.clock, ba.clock);
        assert_eq!(ab.origin, ba.origin);
        assert_eq!(resolver.resolve(&local, &remote), resolver.resolve(&local, &remote));
    }

    #[test]
    fn test_overlapping_fields_need_manual_resolution() {
        let resolver = ConflictResolver::new();
        let a = base();
        let local = edit(&a, "dev-a", "status", json!("approved"));
        let remote = edit(&a, "dev-b", "status", json!("rejected"));

        let Resolution::ManualRequired(record) = resolver.resolve(&local, &remote) else {
            panic!("expected manual resolution");
        };
        assert!(record.is_manual());
        assert!(record.resolved_payload.is_none());
        assert_eq!(
            record.candidates,
            vec![FieldConflict {
                field: "status".into(),
                local: json!("approved"),
                remote: json!("rejected"),
            }]
        );
    }

    #[test]
    fn test_same_value_on_both_sides_is_not_a_conflict() {
        let resolver = ConflictResolver::new();
        let a = base();
        let local = edit(&a, "dev-a", "status", json!("closed"));
        let remote = edit(&a, "dev-b", "status", json!("closed"));

        assert!(matches!(
            resolver.resolve(&local, &remote),
            Resolution::Merged { .. }
        ));
    }

    #[test]
    fn test_field_written_after_seeing_other_side_wins() {
        let resolver = ConflictResolver::new();
        let a = base();
        // dev-b changes status; dev-a sees it and changes status again
        let b1 = edit(&a, "dev-b", "status", json!("review"));
        let local = edit(&b1, "dev-a", "status", json!("done"));
        // meanwhile dev-b edits another field
        let remote = edit(&b1, "dev-b", "name", json!("Grace"));

        let Resolution::Merged { payload, .. } = resolver.resolve(&local, &remote) else {
            panic!("expected merge");
        };
        assert_eq!(payload.value("status"), Some(&json!("done")));
        assert_eq!(payload.value("name"), Some(&json!("Grace")));
    }

    #[test]
    fn test_last_writer_wins_strategy() {
        let resolver = ConflictResolver::new()
            .with_strategy(RecordKind::new("form"), Arc::new(LastWriterWins));
        let a = base();
        let mut local = edit(&a, "dev-a", "status", json!("approved"));
        let mut remote = edit(&a, "dev-b", "status", json!("rejected"));
        local.modified_at = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        remote.modified_at = Utc.with_ymd_and_hms(2024, 5, 1, 11, 0, 0).unwrap();

        let Resolution::Merged { payload, .. } = resolver.resolve(&local, &remote) else {
            panic!("expected merge");
        };
        assert_eq!(payload.value("status"), Some(&json!("rejected")));
        assert!(payload.clock.descends(&local.clock));
    }

    #[test]
    fn test_last_writer_wins_tie_breaks_on_origin() {
        let a = base();
        let mut local = edit(&a, "dev-a", "status", json!("approved"));
        let mut remote = edit(&a, "dev-b", "status", json!("rejected"));
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        local.modified_at = at;
        remote.modified_at = at;

        let MergeOutcome::Merged(p) = LastWriterWins.merge(&local, &remote) else {
            panic!("expected merge");
        };
        assert_eq!(p.origin, "dev-b");
        let MergeOutcome::Merged(q) = LastWriterWins.merge(&remote, &local) else {
            panic!("expected merge");
        };
        assert_eq!(p, q);
    }

    #[test]
    fn test_strategy_lookup() {
        let resolver = ConflictResolver::new()
            .with_strategy(RecordKind::new("log"), Arc::new(LastWriterWins));
        assert_eq!(resolver.strategy_for(&RecordKind::new("log")).name(), "last_writer_wins");
        assert_eq!(resolver.strategy_for(&RecordKind::new("form")).name(), "field_merge");
    }

    #[test]
    fn test_conflict_record_serializes() {
        let a = base();
        let local = edit(&a, "dev-a", "status", json!("x"));
        let remote = edit(&a, "dev-b", "status", json!("y"));
        let record = ConflictRecord::manual(&local, &remote, Vec::new());
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["resolution"], "manual_required");
        assert_eq!(json["record_id"], "r1");
    }
}
