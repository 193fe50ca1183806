//! Observed-Remove Set (OR-Set) CRDT with add-wins semantics.
//!
//! Every add is tagged with a fresh [`Token`] drawn from the set's vector
//! clock. A remove tombstones the tokens this replica has observed for the
//! element, not the element itself, so a concurrent add (carrying a token the
//! remover never saw) survives the merge.
//!
//! Tombstones remember the token of the removal that produced them. Once every
//! replica known to the set has observed that removal, the tombstone and the
//! add it covers can be dropped by [`OrSet::collect_garbage`] without changing
//! what any replica sees.
//!
//! ```
//! use patternsync_engine::{OrSet, Replicated};
//!
//! let mut r1: OrSet<String> = OrSet::new("tags", "r1", 0);
//! let mut r2: OrSet<String> = OrSet::new("tags", "r2", 0);
//!
//! r1.add("x".to_string(), 1);
//! r2.merge(&r1.state()).unwrap();
//!
//! // r1 re-adds while r2 removes what it has seen.
//! r1.add("x".to_string(), 2);
//! r2.remove(&"x".to_string(), 2);
//!
//! r1.merge(&r2.state()).unwrap();
//! r2.merge(&r1.state()).unwrap();
//! assert!(r1.contains(&"x".to_string()));
//! assert!(r2.contains(&"x".to_string()));
//! ```

use crate::{
    clock::VectorClock,
    error::Result,
    state::{
        ConflictInfo, ConflictResolution, CrdtState, CrdtType, MergeResult, MergeStats,
        Replicated, StateMetadata, STATE_VERSION,
    },
    EntityId, LogicalTime, ReplicaId, Timestamp,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

/// Unique identity of one add (or remove) operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    /// Replica that performed the operation
    pub replica_id: ReplicaId,
    /// That replica's set clock at the time
    pub counter: LogicalTime,
}

/// An element together with every add token seen for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrSetEntry<T> {
    pub element: T,
    pub tokens: BTreeSet<Token>,
}

/// A tombstoned add token and the removal that covered it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tombstone {
    pub token: Token,
    pub removed_by: Token,
}

/// Wire payload of an OR-Set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrSetValue<T> {
    /// Add tokens per element, in element order
    pub elements: Vec<OrSetEntry<T>>,
    /// Tombstoned tokens, in token order
    pub tombstones: Vec<Tombstone>,
    /// Last set clock heard from each peer (directly or transitively)
    #[serde(default)]
    pub peer_clocks: BTreeMap<ReplicaId, BTreeMap<ReplicaId, LogicalTime>>,
}

/// An add-wins observed-remove set owned by one replica.
#[derive(Debug, Clone)]
pub struct OrSet<T> {
    id: EntityId,
    replica_id: ReplicaId,
    adds: BTreeMap<T, BTreeSet<Token>>,
    tombstones: BTreeMap<Token, Token>,
    peer_clocks: BTreeMap<ReplicaId, BTreeMap<ReplicaId, LogicalTime>>,
    clock: VectorClock,
    metadata: StateMetadata,
}

impl<T> OrSet<T>
where
    T: Ord + Clone + Serialize + DeserializeOwned,
{
    /// Create an empty set.
    pub fn new(id: impl Into<EntityId>, replica_id: impl Into<ReplicaId>, now: Timestamp) -> Self {
        let replica_id = replica_id.into();
        Self {
            id: id.into(),
            clock: VectorClock::new(replica_id.clone()),
            metadata: StateMetadata::new(now, replica_id.clone()),
            adds: BTreeMap::new(),
            tombstones: BTreeMap::new(),
            peer_clocks: BTreeMap::new(),
            replica_id,
        }
    }

    /// Rebuild a set owned by `replica_id` from a serialized state.
    pub fn from_state(state: CrdtState<OrSetValue<T>>, replica_id: impl Into<ReplicaId>) -> Result<Self> {
        state.ensure_type(CrdtType::OrSet)?;
        let replica_id = replica_id.into();
        let clock = state.clock_for(&replica_id);

        let mut adds: BTreeMap<T, BTreeSet<Token>> = BTreeMap::new();
        for entry in state.value.elements {
            adds.entry(entry.element).or_default().extend(entry.tokens);
        }
        let tombstones = state
            .value
            .tombstones
            .into_iter()
            .map(|t| (t.token, t.removed_by))
            .collect();

        Ok(Self {
            id: state.id,
            adds,
            tombstones,
            peer_clocks: state.value.peer_clocks,
            clock,
            metadata: state.metadata,
            replica_id,
        })
    }

    /// Add an element under a fresh token, even if it is already present.
    pub fn add(&mut self, element: T, now: Timestamp) -> Token {
        let token = Token {
            replica_id: self.replica_id.clone(),
            counter: self.clock.increment(now),
        };
        self.adds.entry(element).or_default().insert(token.clone());
        self.metadata.touch(now, &self.replica_id);
        token
    }

    /// Tombstone every live token observed for `element`.
    ///
    /// Returns false (and does nothing) if the element is not present.
    pub fn remove(&mut self, element: &T, now: Timestamp) -> bool {
        let live: Vec<Token> = match self.adds.get(element) {
            Some(tokens) => tokens
                .iter()
                .filter(|t| !self.tombstones.contains_key(*t))
                .cloned()
                .collect(),
            None => return false,
        };
        if live.is_empty() {
            return false;
        }

        let removal = Token {
            replica_id: self.replica_id.clone(),
            counter: self.clock.increment(now),
        };
        for token in live {
            self.tombstones.insert(token, removal.clone());
        }
        self.metadata.touch(now, &self.replica_id);
        true
    }

    /// Check if an element has at least one live token.
    pub fn contains(&self, element: &T) -> bool {
        self.adds
            .get(element)
            .is_some_and(|tokens| self.has_live(tokens))
    }

    /// Visible elements in ascending order.
    pub fn values(&self) -> Vec<T> {
        self.adds
            .iter()
            .filter(|(_, tokens)| self.has_live(tokens))
            .map(|(element, _)| element.clone())
            .collect()
    }

    /// Number of visible elements.
    pub fn len(&self) -> usize {
        self.adds
            .values()
            .filter(|tokens| self.has_live(tokens))
            .count()
    }

    /// Check if no element is visible.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of retained tombstones.
    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    /// State bookkeeping.
    pub fn metadata(&self) -> &StateMetadata {
        &self.metadata
    }

    /// A token this set's clock already covers but no longer holds was
    /// tombstoned and collected here. It must not come back from an older
    /// state.
    fn was_collected(&self, token: &Token, held: &BTreeSet<Token>) -> bool {
        token.counter <= self.clock.get(&token.replica_id)
            && !held.contains(token)
            && !self.tombstones.contains_key(token)
    }

    fn has_live(&self, tokens: &BTreeSet<Token>) -> bool {
        tokens.iter().any(|t| !self.tombstones.contains_key(t))
    }

    /// A removal is stable once every replica known to this set's clock has
    /// observed it.
    fn is_stable(&self, removal: &Token) -> bool {
        self.clock.entries().all(|(replica, _)| {
            let seen = if *replica == self.replica_id {
                self.clock.get(&removal.replica_id)
            } else {
                self.peer_clocks
                    .get(replica)
                    .and_then(|c| c.get(&removal.replica_id))
                    .copied()
                    .unwrap_or(0)
            };
            seen >= removal.counter
        })
    }

    /// Drop tombstones (and the adds they cover) whose removal every known
    /// replica has observed. Returns the number of tombstones dropped.
    pub fn collect_garbage(&mut self) -> usize {
        let stable: BTreeSet<Token> = self
            .tombstones
            .iter()
            .filter(|(_, removal)| self.is_stable(removal))
            .map(|(token, _)| token.clone())
            .collect();
        if stable.is_empty() {
            return 0;
        }

        for tokens in self.adds.values_mut() {
            tokens.retain(|t| !stable.contains(t));
        }
        self.adds.retain(|_, tokens| !tokens.is_empty());
        self.tombstones.retain(|token, _| !stable.contains(token));

        tracing::trace!(
            entity_id = %self.id,
            collected = stable.len(),
            remaining = self.tombstones.len(),
            "Collected OR-Set tombstones"
        );

        stable.len()
    }

    fn remote_visible(value: &OrSetValue<T>) -> BTreeSet<&T> {
        let dead: BTreeSet<&Token> = value.tombstones.iter().map(|t| &t.token).collect();
        value
            .elements
            .iter()
            .filter(|e| e.tokens.iter().any(|t| !dead.contains(t)))
            .map(|e| &e.element)
            .collect()
    }
}

impl<T> Replicated for OrSet<T>
where
    T: Ord + Clone + Serialize + DeserializeOwned,
{
    type Value = OrSetValue<T>;
    const CRDT_TYPE: CrdtType = CrdtType::OrSet;

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

    fn state(&self) -> CrdtState<OrSetValue<T>> {
        CrdtState {
            crdt_type: CrdtType::OrSet,
            id: self.id.clone(),
            vector_clock: self.clock.state(),
            origin: self.replica_id.clone(),
            value: OrSetValue {
                elements: self
                    .adds
                    .iter()
                    .map(|(element, tokens)| OrSetEntry {
                        element: element.clone(),
                        tokens: tokens.clone(),
                    })
                    .collect(),
                tombstones: self
                    .tombstones
                    .iter()
                    .map(|(token, removed_by)| Tombstone {
                        token: token.clone(),
                        removed_by: removed_by.clone(),
                    })
                    .collect(),
                peer_clocks: self.peer_clocks.clone(),
            },
            metadata: self.metadata.clone(),
            state_version: STATE_VERSION,
        }
    }

    /// Union of add tokens and tombstones. An element is visible afterwards
    /// iff it still has a token no tombstone covers.
    fn merge(&mut self, remote: &CrdtState<OrSetValue<T>>) -> Result<MergeResult<OrSetValue<T>>> {
        let started = Instant::now();
        remote.ensure_type(CrdtType::OrSet)?;
        remote.ensure_id(&self.id)?;

        let before = self.values();
        let locally_known: BTreeSet<T> = self.adds.keys().cloned().collect();
        let remote_visible = Self::remote_visible(&remote.value);
        let remote_known: BTreeSet<&T> =
            remote.value.elements.iter().map(|e| &e.element).collect();
        let mut stats = MergeStats::default();
        let mut new_entries = 0i64;

        let held: BTreeSet<Token> = self.adds.values().flatten().cloned().collect();

        for entry in &remote.value.elements {
            let fresh: Vec<&Token> = entry
                .tokens
                .iter()
                .filter(|t| !held.contains(*t) && !self.was_collected(t, &held))
                .collect();
            stats.entries_merged += entry.tokens.len();
            if fresh.is_empty() {
                continue;
            }
            let tokens = self.adds.entry(entry.element.clone()).or_default();
            for token in fresh {
                tokens.insert(token.clone());
                new_entries += 1;
            }
        }

        for tombstone in &remote.value.tombstones {
            if self.was_collected(&tombstone.token, &held) {
                continue;
            }
            match self.tombstones.get_mut(&tombstone.token) {
                Some(removed_by) => {
                    if tombstone.removed_by < *removed_by {
                        *removed_by = tombstone.removed_by.clone();
                    }
                }
                None => {
                    self.tombstones
                        .insert(tombstone.token.clone(), tombstone.removed_by.clone());
                    stats.tombstones_processed += 1;
                    new_entries += 1;
                }
            }
        }

        for (peer, clock) in &remote.value.peer_clocks {
            if *peer != self.replica_id {
                merge_peer_clock(&mut self.peer_clocks, peer, clock);
            }
        }
        if remote.origin != self.replica_id {
            merge_peer_clock(&mut self.peer_clocks, &remote.origin, &remote.vector_clock.entries);
        }

        self.clock.merge_state(&remote.vector_clock);
        self.metadata.absorb(&remote.metadata);

        // Add-wins divergences: one side had removed what the other still saw.
        let mut conflicts = Vec::new();
        let before_set: BTreeSet<&T> = before.iter().collect();
        for element in self.adds.keys() {
            if !self.contains(element) {
                continue;
            }
            let local_present = before_set.contains(element);
            let remote_present = remote_visible.contains(element);
            let local_removed = !local_present && locally_known.contains(element);
            let remote_removed = !remote_present && remote_known.contains(element);
            if (local_removed && remote_present) || (remote_removed && local_present) {
                stats.auto_resolved += 1;
                let element_json = serde_json::to_value(element)?;
                conflicts.push(ConflictInfo {
                    field: self.id.clone(),
                    local_value: if local_present {
                        element_json.clone()
                    } else {
                        serde_json::Value::Null
                    },
                    remote_value: if remote_present {
                        element_json
                    } else {
                        serde_json::Value::Null
                    },
                    local_timestamp: None,
                    remote_timestamp: None,
                    resolution: ConflictResolution::AddWins,
                });
            }
        }

        let after = self.values();
        stats.memory_delta = new_entries * std::mem::size_of::<Token>() as i64;
        stats.duration_micros = started.elapsed().as_micros() as u64;

        Ok(MergeResult {
            success: true,
            state: self.state(),
            local_changed: before != after,
            conflicts,
            stats,
        })
    }
}

fn merge_peer_clock(
    peer_clocks: &mut BTreeMap<ReplicaId, BTreeMap<ReplicaId, LogicalTime>>,
    peer: &str,
    clock: &BTreeMap<ReplicaId, LogicalTime>,
) {
    let known = peer_clocks.entry(peer.to_string()).or_default();
    for (replica, &counter) in clock {
        let entry = known.entry(replica.clone()).or_insert(0);
        *entry = (*entry).max(counter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn set(replica: &str) -> OrSet<String> {
        OrSet::new("p1-tags", replica, 0)
    }

    fn s(v: &str) -> String {
        v.to_string()
    }

    #[test]
    fn add_and_remove() {
        let mut tags = set("r1");
        tags.add(s("a"), 1);
        tags.add(s("b"), 2);
        assert_eq!(tags.values(), vec![s("a"), s("b")]);

        assert!(tags.remove(&s("a"), 3));
        assert!(!tags.contains(&s("a")));
        assert_eq!(tags.len(), 1);
        assert_eq!(tags.tombstone_count(), 1);
    }

    #[test]
    fn removing_absent_element_is_noop() {
        let mut tags = set("r1");
        assert!(!tags.remove(&s("missing"), 1));
        assert_eq!(tags.sequence_number(), 0);
    }

    #[test]
    fn re_adding_creates_fresh_token() {
        let mut tags = set("r1");
        let first = tags.add(s("a"), 1);
        let second = tags.add(s("a"), 2);
        assert_ne!(first, second);
        assert!(tags.remove(&s("a"), 3));
        assert!(tags.values().is_empty());
    }

    #[test]
    fn concurrent_add_wins_over_remove() {
        let mut r1 = set("r1");
        let mut r2 = set("r2");

        r1.add(s("x"), 1);
        r1.remove(&s("x"), 2);
        r2.add(s("x"), 3);

        let result = r1.merge(&r2.state()).unwrap();
        assert!(result.local_changed);
        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(result.conflicts[0].resolution, ConflictResolution::AddWins);

        r2.merge(&r1.state()).unwrap();
        assert!(r1.contains(&s("x")));
        assert!(r2.contains(&s("x")));
    }

    #[test]
    fn observed_remove_propagates() {
        let mut r1 = set("r1");
        let mut r2 = set("r2");
        r1.add(s("x"), 1);
        r2.merge(&r1.state()).unwrap();
        assert!(r2.remove(&s("x"), 2));

        let result = r1.merge(&r2.state()).unwrap();
        assert!(result.local_changed);
        assert_eq!(result.stats.tombstones_processed, 1);
        assert!(!r1.contains(&s("x")));
    }

    #[test]
    fn merge_rejects_wrong_type() {
        let mut r1 = set("r1");
        let mut state = set("r2").state();
        state.crdt_type = CrdtType::LwwRegister;
        assert!(matches!(r1.merge(&state), Err(Error::InvalidType { .. })));
    }

    #[test]
    fn gc_waits_for_every_known_replica() {
        let mut r1 = set("r1");
        let mut r2 = set("r2");

        r1.add(s("x"), 1);
        r2.merge(&r1.state()).unwrap();
        r1.merge(&r2.state()).unwrap();
        r1.remove(&s("x"), 2);

        // r2 has not seen the removal yet.
        assert_eq!(r1.collect_garbage(), 0);
        assert_eq!(r1.tombstone_count(), 1);

        r2.merge(&r1.state()).unwrap();
        r1.merge(&r2.state()).unwrap();

        assert_eq!(r1.collect_garbage(), 1);
        assert_eq!(r1.tombstone_count(), 0);
        assert!(!r1.contains(&s("x")));

        // A late copy of r2's pre-GC state brings nothing back to life.
        r1.merge(&r2.state()).unwrap();
        assert!(!r1.contains(&s("x")));
    }

    #[test]
    fn state_from_before_removal_cannot_resurrect_after_gc() {
        let mut r1 = set("r1");
        let mut r2 = set("r2");

        r1.add(s("x"), 1);
        r2.merge(&r1.state()).unwrap();
        let stale = r2.state();

        r1.remove(&s("x"), 2);
        r2.merge(&r1.state()).unwrap();
        r1.merge(&r2.state()).unwrap();
        assert_eq!(r1.collect_garbage(), 1);

        let result = r1.merge(&stale).unwrap();
        assert!(!result.local_changed);
        assert!(!r1.contains(&s("x")));
        assert!(r1.state().value.elements.is_empty());
        assert_eq!(r1.tombstone_count(), 0);

        // Duplicate delivery of the stale state and a re-sync stay stable.
        r1.merge(&stale).unwrap();
        r2.merge(&r1.state()).unwrap();
        r1.merge(&r2.state()).unwrap();
        assert!(!r1.contains(&s("x")));
        assert!(!r2.contains(&s("x")));
    }

    #[test]
    fn add_after_gc_is_still_visible() {
        let mut r1 = set("r1");
        let mut r2 = set("r2");
        r1.add(s("x"), 1);
        r1.remove(&s("x"), 2);
        assert_eq!(r1.collect_garbage(), 1);

        r2.merge(&r1.state()).unwrap();
        r2.add(s("x"), 3);
        r1.merge(&r2.state()).unwrap();
        assert!(r1.contains(&s("x")));
    }

    #[test]
    fn gc_on_single_replica_collects_immediately() {
        let mut r1 = set("r1");
        r1.add(s("a"), 1);
        r1.remove(&s("a"), 2);
        assert_eq!(r1.collect_garbage(), 1);
        assert!(r1.state().value.elements.is_empty());
    }

    #[test]
    fn state_roundtrip() {
        let mut r1 = set("r1");
        r1.add(s("a"), 1);
        r1.add(s("b"), 2);
        r1.remove(&s("a"), 3);

        let json = r1.state().to_json().unwrap();
        let restored =
            OrSet::<String>::from_state(CrdtState::from_json(&json).unwrap(), "r1").unwrap();
        assert_eq!(restored.values(), r1.values());
        assert_eq!(restored.tombstone_count(), 1);
        assert_eq!(restored.clock(), r1.clock());
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Add(u8),
            Remove(u8),
        }

        fn arb_set(replica: &'static str) -> impl Strategy<Value = OrSet<u8>> {
            proptest::collection::vec(
                prop_oneof![(0u8..4).prop_map(Op::Add), (0u8..4).prop_map(Op::Remove)],
                0..10,
            )
            .prop_map(move |ops| {
                let mut set = OrSet::new("s", replica, 0);
                for (t, op) in ops.into_iter().enumerate() {
                    match op {
                        Op::Add(e) => {
                            set.add(e, t as u64);
                        }
                        Op::Remove(e) => {
                            set.remove(&e, t as u64);
                        }
                    }
                }
                set
            })
        }

        proptest! {
            #[test]
            fn prop_merge_converges(
                a in arb_set("r1"),
                b in arb_set("r2"),
                c in arb_set("r3"),
            ) {
                let mut ab = a.clone();
                ab.merge(&b.state()).unwrap();
                let mut ba = b.clone();
                ba.merge(&a.state()).unwrap();
                prop_assert_eq!(ab.values(), ba.values());

                let mut ab_c = ab.clone();
                ab_c.merge(&c.state()).unwrap();
                let mut bc = b.clone();
                bc.merge(&c.state()).unwrap();
                let mut a_bc = a.clone();
                a_bc.merge(&bc.state()).unwrap();
                prop_assert_eq!(ab_c.values(), a_bc.values());

                let mut aa = a.clone();
                prop_assert!(!aa.merge(&a.state()).unwrap().local_changed);
                prop_assert_eq!(aa.values(), a.values());
            }

            #[test]
            fn prop_gc_preserves_visible_values(a in arb_set("r1"), b in arb_set("r2")) {
                let mut x = a.clone();
                let mut y = b.clone();
                x.merge(&y.state()).unwrap();
                y.merge(&x.state()).unwrap();
                x.merge(&y.state()).unwrap();

                let visible = x.values();
                x.collect_garbage();
                prop_assert_eq!(x.values(), visible.clone());

                // Merging the other side's un-collected state changes nothing.
                x.merge(&y.state()).unwrap();
                prop_assert_eq!(x.values(), visible.clone());

                // Neither do the original pre-sync states, delivered late.
                x.collect_garbage();
                x.merge(&a.state()).unwrap();
                x.merge(&b.state()).unwrap();
                prop_assert_eq!(x.values(), visible);
            }
        }
    }
}
