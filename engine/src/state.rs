//! Wire envelopes and merge bookkeeping shared by every CRDT.
//!
//! A [`CrdtState`] is what crosses the transport boundary for full-state
//! exchange; a [`CrdtDelta`] is the incremental form. Both serialize to plain
//! JSON objects with camelCase keys.

use crate::{
    clock::{VectorClock, VectorClockState},
    error::{Error, Result},
    EntityId, ReplicaId, Timestamp,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;

/// Version of the state envelope format for forward compatibility.
pub const STATE_VERSION: u32 = 1;

/// Discriminant for the CRDT carried in an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CrdtType {
    #[serde(rename = "GCounter")]
    GCounter,
    #[serde(rename = "LWWRegister")]
    LwwRegister,
    #[serde(rename = "ORSet")]
    OrSet,
    #[serde(rename = "PatternCRDT")]
    Pattern,
}

impl CrdtType {
    /// Wire name of this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            CrdtType::GCounter => "GCounter",
            CrdtType::LwwRegister => "LWWRegister",
            CrdtType::OrSet => "ORSet",
            CrdtType::Pattern => "PatternCRDT",
        }
    }

    /// Fail with [`Error::InvalidType`] unless `actual` is this type.
    pub fn require(self, actual: CrdtType) -> Result<()> {
        if self == actual {
            Ok(())
        } else {
            Err(Error::InvalidType {
                expected: self,
                actual,
            })
        }
    }
}

impl fmt::Display for CrdtType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bookkeeping carried alongside every state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateMetadata {
    /// When the entity was first created (milliseconds since epoch)
    pub created_at: Timestamp,
    /// When the entity was last mutated or merged
    pub updated_at: Timestamp,
    /// Number of merges this instance has absorbed
    pub merge_count: u64,
    /// Replica that performed the most recent local mutation
    pub last_modified_by: ReplicaId,
}

impl StateMetadata {
    /// Metadata for an entity created now by `replica_id`.
    pub fn new(now: Timestamp, replica_id: impl Into<ReplicaId>) -> Self {
        Self {
            created_at: now,
            updated_at: now,
            merge_count: 0,
            last_modified_by: replica_id.into(),
        }
    }

    /// Record a local mutation.
    pub fn touch(&mut self, now: Timestamp, replica_id: &str) {
        self.updated_at = self.updated_at.max(now);
        if self.last_modified_by != replica_id {
            self.last_modified_by = replica_id.to_string();
        }
    }

    /// Record a merge with a remote's metadata.
    pub fn absorb(&mut self, remote: &StateMetadata) {
        self.created_at = match (self.created_at, remote.created_at) {
            (0, theirs) => theirs,
            (ours, 0) => ours,
            (ours, theirs) => ours.min(theirs),
        };
        if remote.updated_at > self.updated_at {
            self.updated_at = remote.updated_at;
            self.last_modified_by = remote.last_modified_by.clone();
        }
        self.merge_count += 1;
    }
}

/// Serializable envelope around a CRDT's value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrdtState<V> {
    /// CRDT type discriminant
    #[serde(rename = "type")]
    pub crdt_type: CrdtType,
    /// Stable entity ID
    pub id: EntityId,
    /// Causal position of the entity
    pub vector_clock: VectorClockState,
    /// Replica that produced this state
    pub origin: ReplicaId,
    /// Type-specific payload
    pub value: V,
    /// Free-form bookkeeping
    pub metadata: StateMetadata,
    /// Envelope format version
    pub state_version: u32,
}

/// A state whose payload has not been interpreted yet.
pub type AnyState = CrdtState<serde_json::Value>;

impl<V> CrdtState<V> {
    /// Fail with [`Error::InvalidType`] unless this state carries `expected`.
    pub fn ensure_type(&self, expected: CrdtType) -> Result<()> {
        expected.require(self.crdt_type)
    }

    /// Fail with [`Error::InvalidState`] unless this state targets `id`.
    pub fn ensure_id(&self, id: &str) -> Result<()> {
        if self.id == id {
            Ok(())
        } else {
            Err(Error::InvalidState(format!(
                "entity ID mismatch: expected '{}', got '{}'",
                id, self.id
            )))
        }
    }

    /// Rebuild the state's clock as owned by `replica_id`.
    pub fn clock_for(&self, replica_id: &str) -> VectorClock {
        VectorClock::from_state(replica_id, self.vector_clock.clone())
    }

    fn ensure_version(&self) -> Result<()> {
        if self.state_version > STATE_VERSION {
            return Err(Error::Deserialization(format!(
                "unsupported state version: {} (max supported: {})",
                self.state_version, STATE_VERSION
            )));
        }
        Ok(())
    }
}

impl<V: Serialize> CrdtState<V> {
    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidState(e.to_string()))
    }

    /// Erase the payload type for storage or routing.
    pub fn into_any(self) -> Result<AnyState> {
        let value = serde_json::to_value(&self.value)
            .map_err(|e| Error::InvalidState(e.to_string()))?;
        Ok(CrdtState {
            crdt_type: self.crdt_type,
            id: self.id,
            vector_clock: self.vector_clock,
            origin: self.origin,
            value,
            metadata: self.metadata,
            state_version: self.state_version,
        })
    }
}

impl<V: DeserializeOwned> CrdtState<V> {
    /// Parse and validate a state from JSON.
    ///
    /// The vector clock is validated before the payload so that negative
    /// timestamps surface as [`Error::Clock`].
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: serde_json::Value = serde_json::from_str(json)?;
        Self::from_value(raw)
    }

    /// Parse and validate a state from an untyped JSON value.
    pub fn from_value(raw: serde_json::Value) -> Result<Self> {
        let clock = raw
            .get("vectorClock")
            .ok_or_else(|| Error::Deserialization("missing field `vectorClock`".into()))?;
        VectorClockState::from_value(clock)?;

        let state: Self = serde_json::from_value(raw)?;
        state.ensure_version()?;
        Ok(state)
    }
}

impl AnyState {
    /// Interpret the payload as `V`.
    pub fn into_typed<V: DeserializeOwned>(self) -> Result<CrdtState<V>> {
        self.ensure_version()?;
        let value = serde_json::from_value(self.value)?;
        Ok(CrdtState {
            crdt_type: self.crdt_type,
            id: self.id,
            vector_clock: self.vector_clock,
            origin: self.origin,
            value,
            metadata: self.metadata,
            state_version: self.state_version,
        })
    }
}

/// How a conflict was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictResolution {
    /// Local value was kept
    LocalWins,
    /// Remote value replaced the local one
    RemoteWins,
    /// Concurrent add and remove; the element stays present
    AddWins,
}

/// A field or element where both sides held diverging values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictInfo {
    /// Entity-qualified field name (e.g. `p1-content` or `p1-tags`)
    pub field: String,
    /// Local value before the merge
    pub local_value: serde_json::Value,
    /// Remote value
    pub remote_value: serde_json::Value,
    /// Wall time of the local write, when the CRDT tracks one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_timestamp: Option<Timestamp>,
    /// Wall time of the remote write, when the CRDT tracks one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_timestamp: Option<Timestamp>,
    /// Outcome
    pub resolution: ConflictResolution,
}

/// Statistics gathered during a merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeStats {
    /// Wall duration of the merge in microseconds
    pub duration_micros: u64,
    /// Number of entries (counters, tokens, registers) examined
    pub entries_merged: usize,
    /// Number of divergences resolved without caller involvement
    pub auto_resolved: usize,
    /// Number of tombstones taken from the remote or garbage collected
    pub tombstones_processed: usize,
    /// Approximate change in retained bytes
    pub memory_delta: i64,
}

impl MergeStats {
    /// Fold another merge's statistics into this one.
    pub fn absorb(&mut self, other: &MergeStats) {
        self.entries_merged += other.entries_merged;
        self.auto_resolved += other.auto_resolved;
        self.tombstones_processed += other.tombstones_processed;
        self.memory_delta += other.memory_delta;
    }
}

/// Outcome of merging a remote state into a local instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeResult<V> {
    /// Whether the merge completed
    pub success: bool,
    /// The local state after the merge
    pub state: CrdtState<V>,
    /// Whether the locally visible value changed
    pub local_changed: bool,
    /// Divergences found, in field order
    pub conflicts: Vec<ConflictInfo>,
    /// Merge statistics
    pub stats: MergeStats,
}

impl<V: Serialize> MergeResult<V> {
    /// Erase the payload type.
    pub fn into_any(self) -> Result<MergeResult<serde_json::Value>> {
        Ok(MergeResult {
            success: self.success,
            state: self.state.into_any()?,
            local_changed: self.local_changed,
            conflicts: self.conflicts,
            stats: self.stats,
        })
    }
}

/// A single operation inside a delta.
///
/// Only full-value `Set` exists; per-field operations are not modelled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum DeltaOperation<V> {
    Set { value: V, replica: ReplicaId },
}

/// Incremental update for one entity since a causal position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrdtDelta<V> {
    /// Target entity
    pub crdt_id: EntityId,
    /// CRDT type discriminant
    #[serde(rename = "type")]
    pub crdt_type: CrdtType,
    /// Replica that generated the delta
    pub origin: ReplicaId,
    /// Clock of the entity at generation time
    pub vector_clock: VectorClockState,
    /// Operations to apply, in order
    pub operations: Vec<DeltaOperation<V>>,
    /// Per-entity monotonically increasing sequence number
    pub sequence_number: u64,
    /// Generation wall time
    pub generated_at: Timestamp,
}

/// A delta whose payload has not been interpreted yet.
pub type AnyDelta = CrdtDelta<serde_json::Value>;

impl<V: Clone> CrdtDelta<V> {
    /// Expand each operation into a full state envelope for merging.
    pub fn states(&self) -> Vec<CrdtState<V>> {
        self.operations
            .iter()
            .map(|op| match op {
                DeltaOperation::Set { value, replica } => CrdtState {
                    crdt_type: self.crdt_type,
                    id: self.crdt_id.clone(),
                    vector_clock: self.vector_clock.clone(),
                    origin: self.origin.clone(),
                    value: value.clone(),
                    metadata: StateMetadata::new(self.generated_at, replica.clone()),
                    state_version: STATE_VERSION,
                },
            })
            .collect()
    }
}

impl<V: Serialize> CrdtDelta<V> {
    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidState(e.to_string()))
    }

    /// Erase the payload type.
    pub fn into_any(self) -> Result<AnyDelta> {
        let operations = self
            .operations
            .into_iter()
            .map(|op| match op {
                DeltaOperation::Set { value, replica } => Ok(DeltaOperation::Set {
                    value: serde_json::to_value(value)
                        .map_err(|e| Error::InvalidState(e.to_string()))?,
                    replica,
                }),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(CrdtDelta {
            crdt_id: self.crdt_id,
            crdt_type: self.crdt_type,
            origin: self.origin,
            vector_clock: self.vector_clock,
            operations,
            sequence_number: self.sequence_number,
            generated_at: self.generated_at,
        })
    }
}

impl<V: DeserializeOwned> CrdtDelta<V> {
    /// Parse and validate a delta from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: serde_json::Value = serde_json::from_str(json)?;
        let clock = raw
            .get("vectorClock")
            .ok_or_else(|| Error::Deserialization("missing field `vectorClock`".into()))?;
        VectorClockState::from_value(clock)?;
        Ok(serde_json::from_value(raw)?)
    }
}

impl AnyDelta {
    /// Interpret the payload as `V`.
    pub fn into_typed<V: DeserializeOwned>(self) -> Result<CrdtDelta<V>> {
        let operations = self
            .operations
            .into_iter()
            .map(|op| match op {
                DeltaOperation::Set { value, replica } => Ok(DeltaOperation::Set {
                    value: serde_json::from_value(value)?,
                    replica,
                }),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(CrdtDelta {
            crdt_id: self.crdt_id,
            crdt_type: self.crdt_type,
            origin: self.origin,
            vector_clock: self.vector_clock,
            operations,
            sequence_number: self.sequence_number,
            generated_at: self.generated_at,
        })
    }
}

/// Behavior shared by every state-based CRDT in this crate.
///
/// `merge` must be commutative, associative and idempotent on the visible
/// value, so that any delivery order and any number of duplicate deliveries
/// converge.
pub trait Replicated {
    /// Serializable payload carried in [`CrdtState::value`].
    type Value: Clone + Serialize + DeserializeOwned;

    /// Discriminant written into envelopes.
    const CRDT_TYPE: CrdtType;

    /// Stable entity ID.
    fn id(&self) -> &str;

    /// Replica that owns this instance.
    fn replica_id(&self) -> &str;

    /// Causal position of this instance.
    fn clock(&self) -> &VectorClock;

    /// Monotonically increasing counter of local mutations.
    fn sequence_number(&self) -> u64;

    /// Serialize the full state.
    fn state(&self) -> CrdtState<Self::Value>;

    /// Merge a remote state into this instance.
    fn merge(&mut self, remote: &CrdtState<Self::Value>) -> Result<MergeResult<Self::Value>>;

    /// Package the current value as a delta, or `None` if this instance has
    /// not causally advanced past `since`.
    fn generate_delta(&self, since: &VectorClock, now: Timestamp) -> Option<CrdtDelta<Self::Value>> {
        let clock = self.clock();
        if !(clock.happened_after(since) || clock.is_concurrent(since)) {
            return None;
        }

        let state = self.state();
        tracing::debug!(
            entity_id = %self.id(),
            crdt_type = %Self::CRDT_TYPE,
            sequence = self.sequence_number(),
            "Generated delta"
        );

        Some(CrdtDelta {
            crdt_id: state.id,
            crdt_type: Self::CRDT_TYPE,
            origin: self.replica_id().to_string(),
            vector_clock: state.vector_clock,
            operations: vec![DeltaOperation::Set {
                value: state.value,
                replica: self.replica_id().to_string(),
            }],
            sequence_number: self.sequence_number(),
            generated_at: now,
        })
    }

    /// Apply a delta through the regular merge path.
    fn apply_delta(&mut self, delta: &CrdtDelta<Self::Value>) -> Result<MergeResult<Self::Value>> {
        Self::CRDT_TYPE.require(delta.crdt_type)?;
        if delta.crdt_id != self.id() {
            return Err(Error::InvalidState(format!(
                "entity ID mismatch: expected '{}', got '{}'",
                self.id(),
                delta.crdt_id
            )));
        }

        let mut combined: Option<MergeResult<Self::Value>> = None;
        for state in delta.states() {
            let result = self.merge(&state)?;
            combined = Some(match combined {
                None => result,
                Some(mut acc) => {
                    acc.local_changed |= result.local_changed;
                    acc.conflicts.extend(result.conflicts);
                    acc.stats.absorb(&result.stats);
                    acc.stats.duration_micros += result.stats.duration_micros;
                    acc.state = result.state;
                    acc
                }
            });
        }

        tracing::debug!(
            entity_id = %self.id(),
            origin = %delta.origin,
            sequence = delta.sequence_number,
            "Applied delta"
        );

        Ok(combined.unwrap_or_else(|| MergeResult {
            success: true,
            state: self.state(),
            local_changed: false,
            conflicts: Vec::new(),
            stats: MergeStats::default(),
        }))
    }
}
