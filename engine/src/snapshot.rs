//! Snapshot types for persisting and restoring store state.
//!
//! A snapshot is the set of full state envelopes a store holds, keyed by
//! entity ID. Restoring merges each envelope back in, so importing a snapshot
//! into a store that already has newer state never loses anything.

use crate::{
    clock::VectorClockState,
    error::Result,
    state::{AnyState, CrdtType, STATE_VERSION},
    EntityId, Error, ReplicaId, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A point-in-time snapshot of a store.
///
/// Uses BTreeMap instead of HashMap for deterministic serialization order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// Replica that took the snapshot
    pub replica_id: ReplicaId,
    /// Entry-wise maximum of all entity clocks
    pub clock: VectorClockState,
    /// Full state of every entity, by entity ID
    pub entities: BTreeMap<EntityId, AnyState>,
    /// Wall time the snapshot was taken
    pub taken_at: Timestamp,
}

impl StoreSnapshot {
    /// Create a new empty snapshot.
    pub fn new(replica_id: impl Into<ReplicaId>, taken_at: Timestamp) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            replica_id: replica_id.into(),
            clock: VectorClockState::default(),
            entities: BTreeMap::new(),
            taken_at,
        }
    }

    /// Add an entity state to the snapshot.
    pub fn add_state(&mut self, state: AnyState) {
        self.entities.insert(state.id.clone(), state);
    }

    /// Get an entity state from the snapshot.
    pub fn get_state(&self, id: &str) -> Option<&AnyState> {
        self.entities.get(id)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Count entities of one CRDT type.
    pub fn count_by_type(&self, crdt_type: CrdtType) -> usize {
        self.entities
            .values()
            .filter(|s| s.crdt_type == crdt_type)
            .count()
    }

    /// Check that every entry is keyed by its own ID and is readable.
    pub fn validate(&self) -> Result<()> {
        for (key, state) in &self.entities {
            if *key != state.id {
                return Err(Error::InvalidSnapshot(format!(
                    "entity keyed '{}' carries state for '{}'",
                    key, state.id
                )));
            }
            if state.state_version > STATE_VERSION {
                return Err(Error::InvalidSnapshot(format!(
                    "entity '{}' has unsupported state version {}",
                    key, state.state_version
                )));
            }
        }
        Ok(())
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Serialize to pretty JSON with deterministic ordering.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        snapshot.validate()?;
        Ok(snapshot)
    }
}

/// Metadata about a snapshot (without the full data).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub format_version: u32,
    pub replica_id: ReplicaId,
    /// Number of replicas in the snapshot clock
    pub clock_entries: usize,
    pub entity_count: usize,
    pub pattern_count: usize,
    pub taken_at: Timestamp,
}

impl From<&StoreSnapshot> for SnapshotMetadata {
    fn from(snapshot: &StoreSnapshot) -> Self {
        Self {
            format_version: snapshot.format_version,
            replica_id: snapshot.replica_id.clone(),
            clock_entries: snapshot.clock.entries.len(),
            entity_count: snapshot.entity_count(),
            pattern_count: snapshot.count_by_type(CrdtType::Pattern),
            taken_at: snapshot.taken_at,
        }
    }
}
