//! Grow-only counter (G-Counter) CRDT.
//!
//! Each replica only ever raises its own entry. The value is the sum of all
//! known per-replica contributions; merge takes the per-replica maximum, so a
//! contribution is never counted twice no matter how often states are merged.
//!
//! ```
//! use patternsync_engine::{GCounter, Replicated};
//!
//! let mut a = GCounter::new("usage", "r1", 1000);
//! let mut b = GCounter::new("usage", "r2", 1000);
//! a.increment(3, 1001);
//! b.increment(2, 1002);
//!
//! a.merge(&b.state()).unwrap();
//! a.merge(&b.state()).unwrap();
//! assert_eq!(a.value(), 5);
//! ```

use crate::{
    clock::VectorClock,
    error::Result,
    state::{CrdtState, CrdtType, MergeResult, MergeStats, Replicated, StateMetadata, STATE_VERSION},
    EntityId, ReplicaId, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;

/// Wire payload of a G-Counter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GCounterValue {
    /// Replica ID to that replica's total contribution
    pub counts: BTreeMap<ReplicaId, u64>,
}

/// A grow-only counter owned by one replica.
#[derive(Debug, Clone)]
pub struct GCounter {
    id: EntityId,
    replica_id: ReplicaId,
    counts: BTreeMap<ReplicaId, u64>,
    clock: VectorClock,
    metadata: StateMetadata,
}

impl GCounter {
    /// Create an empty counter.
    pub fn new(id: impl Into<EntityId>, replica_id: impl Into<ReplicaId>, now: Timestamp) -> Self {
        let replica_id = replica_id.into();
        Self {
            id: id.into(),
            clock: VectorClock::new(replica_id.clone()),
            metadata: StateMetadata::new(now, replica_id.clone()),
            counts: BTreeMap::new(),
            replica_id,
        }
    }

    /// Rebuild a counter owned by `replica_id` from a serialized state.
    pub fn from_state(state: CrdtState<GCounterValue>, replica_id: impl Into<ReplicaId>) -> Result<Self> {
        state.ensure_type(CrdtType::GCounter)?;
        let replica_id = replica_id.into();
        Ok(Self {
            clock: state.clock_for(&replica_id),
            id: state.id,
            counts: state.value.counts,
            metadata: state.metadata,
            replica_id,
        })
    }

    /// Add `amount` to this replica's contribution and return the new total.
    pub fn increment(&mut self, amount: u64, now: Timestamp) -> u64 {
        let entry = self.counts.entry(self.replica_id.clone()).or_insert(0);
        *entry = entry.saturating_add(amount);
        self.clock.increment(now);
        self.metadata.touch(now, &self.replica_id);
        self.value()
    }

    /// Sum of all known contributions.
    pub fn value(&self) -> u64 {
        self.counts.values().fold(0u64, |acc, n| acc.saturating_add(*n))
    }

    /// Contribution of a single replica, 0 if unknown.
    pub fn replica_value(&self, replica_id: &str) -> u64 {
        self.counts.get(replica_id).copied().unwrap_or(0)
    }

    /// State bookkeeping.
    pub fn metadata(&self) -> &StateMetadata {
        &self.metadata
    }
}

impl Replicated for GCounter {
    type Value = GCounterValue;
    const CRDT_TYPE: CrdtType = CrdtType::GCounter;

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

    fn state(&self) -> CrdtState<GCounterValue> {
        CrdtState {
            crdt_type: CrdtType::GCounter,
            id: self.id.clone(),
            vector_clock: self.clock.state(),
            origin: self.replica_id.clone(),
            value: GCounterValue {
                counts: self.counts.clone(),
            },
            metadata: self.metadata.clone(),
            state_version: STATE_VERSION,
        }
    }

    /// Per-replica maximum. Never reports conflicts: diverging entries are
    /// counted as auto-resolved.
    fn merge(&mut self, remote: &CrdtState<GCounterValue>) -> Result<MergeResult<GCounterValue>> {
        let started = Instant::now();
        remote.ensure_type(CrdtType::GCounter)?;
        remote.ensure_id(&self.id)?;

        let before = self.value();
        let entries_before = self.counts.len();
        let mut stats = MergeStats::default();

        for (replica, &theirs) in &remote.value.counts {
            stats.entries_merged += 1;
            let ours = self.counts.entry(replica.clone()).or_insert(0);
            if *ours != theirs {
                stats.auto_resolved += 1;
            }
            *ours = (*ours).max(theirs);
        }

        self.clock.merge_state(&remote.vector_clock);
        self.metadata.absorb(&remote.metadata);

        let entry_size = std::mem::size_of::<(ReplicaId, u64)>() as i64;
        stats.memory_delta = (self.counts.len() as i64 - entries_before as i64) * entry_size;
        stats.duration_micros = started.elapsed().as_micros() as u64;

        Ok(MergeResult {
            success: true,
            state: self.state(),
            local_changed: self.value() != before,
            conflicts: Vec::new(),
            stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn increment_adds_to_own_entry() {
        let mut counter = GCounter::new("c", "r1", 0);
        assert_eq!(counter.increment(3, 1), 3);
        assert_eq!(counter.increment(0, 2), 3);
        assert_eq!(counter.increment(4, 3), 7);
        assert_eq!(counter.replica_value("r1"), 7);
        assert_eq!(counter.replica_value("r2"), 0);
        assert_eq!(counter.sequence_number(), 3);
    }

    #[test]
    fn merge_sums_independent_contributions() {
        let mut a = GCounter::new("c", "r1", 0);
        let mut b = GCounter::new("c", "r2", 0);
        a.increment(3, 1);
        b.increment(2, 1);

        let result = a.merge(&b.state()).unwrap();
        assert!(result.local_changed);
        assert_eq!(a.value(), 5);

        b.merge(&a.state()).unwrap();
        assert_eq!(b.value(), 5);
    }

    #[test]
    fn repeated_merge_does_not_double_count() {
        let mut a = GCounter::new("c", "r1", 0);
        let mut b = GCounter::new("c", "r2", 0);
        b.increment(2, 1);

        a.merge(&b.state()).unwrap();
        let again = a.merge(&b.state()).unwrap();
        assert!(!again.local_changed);
        assert_eq!(a.value(), 2);
    }

    #[test]
    fn merge_rejects_other_types_and_ids() {
        let mut a = GCounter::new("c", "r1", 0);

        let mut wrong_type = a.state();
        wrong_type.crdt_type = CrdtType::OrSet;
        assert!(matches!(a.merge(&wrong_type), Err(Error::InvalidType { .. })));

        let other = GCounter::new("d", "r2", 0);
        assert!(matches!(a.merge(&other.state()), Err(Error::InvalidState(_))));
    }

    #[test]
    fn state_roundtrip() {
        let mut a = GCounter::new("c", "r1", 0);
        a.increment(9, 5);
        let restored = GCounter::from_state(a.state(), "r1").unwrap();
        assert_eq!(restored.value(), 9);
        assert_eq!(restored.clock(), a.clock());
    }

    #[test]
    fn negative_counts_are_rejected_on_the_wire() {
        let json = r#"{"type":"GCounter","id":"c","vectorClock":{"entries":{},"lastModified":0},
            "origin":"r1","value":{"counts":{"r1":-2}},"metadata":{"createdAt":0,"updatedAt":0,
            "mergeCount":0,"lastModifiedBy":"r1"},"stateVersion":1}"#;
        let err = CrdtState::<GCounterValue>::from_json(json).unwrap_err();
        assert!(matches!(err, Error::Deserialization(_)));
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Step {
            Increment(usize, u64),
            Merge(usize, usize),
        }

        fn arb_step() -> impl Strategy<Value = Step> {
            prop_oneof![
                (0usize..3, 0u64..50).prop_map(|(r, n)| Step::Increment(r, n)),
                (0usize..3, 0usize..3).prop_map(|(a, b)| Step::Merge(a, b)),
            ]
        }

        proptest! {
            #[test]
            fn prop_value_never_decreases(steps in proptest::collection::vec(arb_step(), 0..40)) {
                let mut replicas: Vec<GCounter> = (0..3)
                    .map(|i| GCounter::new("c", format!("r{i}"), 0))
                    .collect();
                let mut last: Vec<u64> = vec![0; 3];

                for (t, step) in steps.into_iter().enumerate() {
                    match step {
                        Step::Increment(r, n) => {
                            replicas[r].increment(n, t as u64);
                        }
                        Step::Merge(a, b) => {
                            let remote = replicas[b].state();
                            replicas[a].merge(&remote).unwrap();
                        }
                    }
                    for (i, replica) in replicas.iter().enumerate() {
                        prop_assert!(replica.value() >= last[i]);
                        last[i] = replica.value();
                    }
                }
            }

            #[test]
            fn prop_merge_commutes_associates_and_is_idempotent(
                x in 0u64..100, y in 0u64..100, z in 0u64..100,
            ) {
                let mut a = GCounter::new("c", "r1", 0);
                let mut b = GCounter::new("c", "r2", 0);
                let mut c = GCounter::new("c", "r3", 0);
                a.increment(x, 1);
                b.increment(y, 1);
                c.increment(z, 1);

                let mut ab = a.clone();
                ab.merge(&b.state()).unwrap();
                let mut ba = b.clone();
                ba.merge(&a.state()).unwrap();
                prop_assert_eq!(ab.value(), ba.value());

                let mut ab_c = ab.clone();
                ab_c.merge(&c.state()).unwrap();
                let mut bc = b.clone();
                bc.merge(&c.state()).unwrap();
                let mut a_bc = a.clone();
                a_bc.merge(&bc.state()).unwrap();
                prop_assert_eq!(ab_c.value(), a_bc.value());

                let mut aa = a.clone();
                let result = aa.merge(&a.state()).unwrap();
                prop_assert!(!result.local_changed);
                prop_assert_eq!(aa.value(), a.value());
            }
        }
    }
}
