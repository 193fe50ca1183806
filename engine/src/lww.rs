//! Last-Writer-Wins Register (LWW-Register) CRDT.
//!
//! Every write records its wall timestamp and the writing replica. On merge
//! the write with the greater `(timestamp, replica_id)` pair wins; identical
//! pairs are the same write and merge as a no-op. An unset register loses to
//! any write.
//!
//! A local `set` is stamped `max(now, previous + 1)`, so it always wins
//! locally even when a remote write carried a timestamp from a skewed clock.

use crate::{
    clock::VectorClock,
    error::Result,
    state::{
        ConflictInfo, ConflictResolution, CrdtState, CrdtType, MergeResult, MergeStats,
        Replicated, StateMetadata, STATE_VERSION,
    },
    EntityId, ReplicaId, Timestamp,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::Instant;

/// Wire payload of an LWW-Register: the winning write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LwwValue<V> {
    /// Current value, `None` if never written
    pub value: Option<V>,
    /// Wall time of the write
    pub timestamp: Timestamp,
    /// Replica that performed the write
    pub replica_id: ReplicaId,
}

impl<V> Default for LwwValue<V> {
    fn default() -> Self {
        Self {
            value: None,
            timestamp: 0,
            replica_id: ReplicaId::new(),
        }
    }
}

impl<V> LwwValue<V> {
    /// Total order used for conflict resolution.
    fn cmp_write(&self, other: &Self) -> Ordering {
        (self.value.is_some(), self.timestamp, &self.replica_id).cmp(&(
            other.value.is_some(),
            other.timestamp,
            &other.replica_id,
        ))
    }
}

/// A last-writer-wins register owned by one replica.
#[derive(Debug, Clone)]
pub struct LwwRegister<V> {
    id: EntityId,
    replica_id: ReplicaId,
    current: LwwValue<V>,
    clock: VectorClock,
    metadata: StateMetadata,
}

impl<V> LwwRegister<V>
where
    V: Clone + PartialEq + Serialize + DeserializeOwned,
{
    /// Create an unset register.
    pub fn new(id: impl Into<EntityId>, replica_id: impl Into<ReplicaId>, now: Timestamp) -> Self {
        let replica_id = replica_id.into();
        Self {
            id: id.into(),
            clock: VectorClock::new(replica_id.clone()),
            metadata: StateMetadata::new(now, replica_id.clone()),
            current: LwwValue::default(),
            replica_id,
        }
    }

    /// Create a register holding an initial value written now.
    pub fn with_value(
        id: impl Into<EntityId>,
        replica_id: impl Into<ReplicaId>,
        value: V,
        now: Timestamp,
    ) -> Self {
        let mut register = Self::new(id, replica_id, now);
        register.set(value, now);
        register
    }

    /// Rebuild a register owned by `replica_id` from a serialized state.
    pub fn from_state(state: CrdtState<LwwValue<V>>, replica_id: impl Into<ReplicaId>) -> Result<Self> {
        state.ensure_type(CrdtType::LwwRegister)?;
        let replica_id = replica_id.into();
        Ok(Self {
            clock: state.clock_for(&replica_id),
            id: state.id,
            current: state.value,
            metadata: state.metadata,
            replica_id,
        })
    }

    /// Write a value. Always wins locally; returns the write's timestamp.
    pub fn set(&mut self, value: V, now: Timestamp) -> Timestamp {
        let stamp = if self.current.value.is_some() {
            now.max(self.current.timestamp.saturating_add(1))
        } else {
            now
        };
        self.current = LwwValue {
            value: Some(value),
            timestamp: stamp,
            replica_id: self.replica_id.clone(),
        };
        self.clock.increment(now);
        self.metadata.touch(now, &self.replica_id);
        stamp
    }

    /// The winning value, `None` if never written.
    pub fn value(&self) -> Option<&V> {
        self.current.value.as_ref()
    }

    /// Wall time of the winning write.
    pub fn timestamp(&self) -> Timestamp {
        self.current.timestamp
    }

    /// Replica that performed the winning write.
    pub fn writer(&self) -> &str {
        &self.current.replica_id
    }

    /// State bookkeeping.
    pub fn metadata(&self) -> &StateMetadata {
        &self.metadata
    }
}

impl<V> Replicated for LwwRegister<V>
where
    V: Clone + PartialEq + Serialize + DeserializeOwned,
{
    type Value = LwwValue<V>;
    const CRDT_TYPE: CrdtType = CrdtType::LwwRegister;

    fn id(&self) -> &str {
        &self.id
    }

    fn replica_id(&self) -> &str {
        &self.replica_id
    }

    fn clock(&self) -> &VectorClock {
        &self.clock
    }

    fn sequence_number(&self) -> u64 {
        self.clock.get(&self.replica_id)
    }

    fn state(&self) -> CrdtState<LwwValue<V>> {
        CrdtState {
            crdt_type: CrdtType::LwwRegister,
            id: self.id.clone(),
            vector_clock: self.clock.state(),
            origin: self.replica_id.clone(),
            value: self.current.clone(),
            metadata: self.metadata.clone(),
            state_version: STATE_VERSION,
        }
    }

    fn merge(&mut self, remote: &CrdtState<LwwValue<V>>) -> Result<MergeResult<LwwValue<V>>> {
        let started = Instant::now();
        remote.ensure_type(CrdtType::LwwRegister)?;
        remote.ensure_id(&self.id)?;

        let theirs = &remote.value;
        let ordering = theirs.cmp_write(&self.current);
        let mut stats = MergeStats {
            entries_merged: 1,
            ..MergeStats::default()
        };
        let mut conflicts = Vec::new();

        let diverged = match (&self.current.value, &theirs.value) {
            (Some(ours), Some(other)) => ours != other,
            _ => false,
        };
        if diverged && ordering != Ordering::Equal {
            stats.auto_resolved += 1;
            conflicts.push(ConflictInfo {
                field: self.id.clone(),
                local_value: serde_json::to_value(&self.current.value)?,
                remote_value: serde_json::to_value(&theirs.value)?,
                local_timestamp: Some(self.current.timestamp),
                remote_timestamp: Some(theirs.timestamp),
                resolution: if ordering == Ordering::Greater {
                    ConflictResolution::RemoteWins
                } else {
                    ConflictResolution::LocalWins
                },
            });
        }

        let mut local_changed = false;
        if ordering == Ordering::Greater {
            local_changed = self.current.value != theirs.value;
            self.current = theirs.clone();
        }

        self.clock.merge_state(&remote.vector_clock);
        self.metadata.absorb(&remote.metadata);
        stats.duration_micros = started.elapsed().as_micros() as u64;

        Ok(MergeResult {
            success: true,
            state: self.state(),
            local_changed,
            conflicts,
            stats,
        })
    }
}
