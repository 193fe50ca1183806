//! Vector clock for causal ordering of CRDT updates.
//!
//! Each replica owns exactly one entry and is the only one allowed to
//! increment it. Entries of other replicas are only ever raised by merging.
//! Unknown replicas are implicitly at time 0.

use crate::{
    error::{Error, Result},
    LogicalTime, ReplicaId, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Upper bound on tracked entries before compaction kicks in.
pub const MAX_CLOCK_ENTRIES: usize = 256;

/// Causal relationship between two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClockOrdering {
    /// Identical causal position
    Equal,
    /// `self` happened before `other`
    Before,
    /// `self` happened after `other`
    After,
    /// Neither dominates the other
    Concurrent,
}

/// Serialized form of a vector clock.
///
/// Uses BTreeMap for deterministic serialization order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorClockState {
    /// Replica ID to logical timestamp
    pub entries: BTreeMap<ReplicaId, LogicalTime>,
    /// Wall time of the last local mutation (milliseconds since epoch)
    pub last_modified: Timestamp,
}

impl VectorClockState {
    /// Parse and validate a serialized clock from an untyped JSON value.
    ///
    /// Negative timestamps are reported as [`Error::Clock`]; every other
    /// malformation is an [`Error::Deserialization`].
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| Error::Deserialization("vector clock must be an object".into()))?;

        let raw_entries = object
            .get("entries")
            .and_then(|e| e.as_object())
            .ok_or_else(|| Error::Deserialization("vector clock entries must be an object".into()))?;

        let mut entries = BTreeMap::new();
        for (replica, raw) in raw_entries {
            entries.insert(replica.clone(), parse_timestamp(replica, raw)?);
        }

        let last_modified = match object.get("lastModified") {
            None | Some(serde_json::Value::Null) => 0,
            Some(raw) => parse_timestamp("lastModified", raw)?,
        };

        Ok(Self {
            entries,
            last_modified,
        })
    }
}

fn parse_timestamp(name: &str, raw: &serde_json::Value) -> Result<u64> {
    if let Some(n) = raw.as_u64() {
        return Ok(n);
    }
    match raw.as_i64() {
        Some(n) => Err(Error::Clock(format!(
            "negative timestamp for replica '{name}': {n}"
        ))),
        None if raw.as_f64().is_some_and(|f| f < 0.0) => Err(Error::Clock(format!(
            "negative timestamp for replica '{name}': {raw}"
        ))),
        None => Err(Error::Deserialization(format!(
            "timestamp for replica '{name}' is not a non-negative integer: {raw}"
        ))),
    }
}

/// A vector clock owned by one replica.
///
/// Equality is causal equality: two clocks are equal when [`VectorClock::compare`]
/// returns [`ClockOrdering::Equal`], regardless of explicit zero entries.
#[derive(Debug, Clone)]
pub struct VectorClock {
    replica_id: ReplicaId,
    entries: BTreeMap<ReplicaId, LogicalTime>,
    last_modified: Timestamp,
}

impl VectorClock {
    /// Create a clock for a replica, with its own entry at 0.
    pub fn new(replica_id: impl Into<ReplicaId>) -> Self {
        let replica_id = replica_id.into();
        let mut entries = BTreeMap::new();
        entries.insert(replica_id.clone(), 0);
        Self {
            replica_id,
            entries,
            last_modified: 0,
        }
    }

    /// Rebuild a clock for `replica_id` from its serialized form.
    ///
    /// The owning replica's entry is created at 0 if absent.
    pub fn from_state(replica_id: impl Into<ReplicaId>, state: VectorClockState) -> Self {
        let replica_id = replica_id.into();
        let mut entries = state.entries;
        entries.entry(replica_id.clone()).or_insert(0);
        Self {
            replica_id,
            entries,
            last_modified: state.last_modified,
        }
    }

    /// Serialize this clock.
    pub fn state(&self) -> VectorClockState {
        VectorClockState {
            entries: self.entries.clone(),
            last_modified: self.last_modified,
        }
    }

    /// Check whether an untyped JSON value is a well-formed serialized clock.
    pub fn is_valid(value: &serde_json::Value) -> bool {
        VectorClockState::from_value(value).is_ok()
    }

    /// The replica that owns this clock.
    pub fn replica_id(&self) -> &ReplicaId {
        &self.replica_id
    }

    /// Wall time of the last local mutation.
    pub fn last_modified(&self) -> Timestamp {
        self.last_modified
    }

    /// Raise the owning replica's counter by one and return the new value.
    pub fn increment(&mut self, now: Timestamp) -> LogicalTime {
        let entry = self.entries.entry(self.replica_id.clone()).or_insert(0);
        *entry = entry.saturating_add(1);
        self.last_modified = self.last_modified.max(now);
        *entry
    }

    /// Counter for a replica, 0 if unknown.
    pub fn get(&self, replica_id: &str) -> LogicalTime {
        self.entries.get(replica_id).copied().unwrap_or(0)
    }

    /// Iterate over `(replica, counter)` pairs in replica order.
    pub fn entries(&self) -> impl Iterator<Item = (&ReplicaId, LogicalTime)> {
        self.entries.iter().map(|(r, t)| (r, *t))
    }

    /// Number of tracked replicas.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if no replica is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Derive the causal relationship to another clock.
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        compare_entries(&self.entries, &other.entries)
    }

    /// True if `self` strictly happened before `other`.
    pub fn happened_before(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::Before
    }

    /// True if `self` strictly happened after `other`.
    pub fn happened_after(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::After
    }

    /// True if neither clock dominates the other.
    pub fn is_concurrent(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::Concurrent
    }

    /// True if `self` has seen everything `other` has seen.
    pub fn descends_from(&self, other: &VectorClock) -> bool {
        matches!(
            self.compare(other),
            ClockOrdering::After | ClockOrdering::Equal
        )
    }

    /// Entry-wise maximum with another clock, then compact.
    pub fn merge(&mut self, other: &VectorClock) {
        self.merge_entries(&other.entries);
        self.last_modified = self.last_modified.max(other.last_modified);
        self.compact();
    }

    /// Merge a serialized clock.
    pub fn merge_state(&mut self, other: &VectorClockState) {
        self.merge_entries(&other.entries);
        self.last_modified = self.last_modified.max(other.last_modified);
        self.compact();
    }

    fn merge_entries(&mut self, other: &BTreeMap<ReplicaId, LogicalTime>) {
        for (replica, &counter) in other {
            let entry = self.entries.entry(replica.clone()).or_insert(0);
            *entry = (*entry).max(counter);
        }
    }

    /// Merge an incoming message's clock, then tick the local entry.
    ///
    /// Used when a local operation causally depends on a received message.
    pub fn receive(&mut self, message_clock: &VectorClock, now: Timestamp) -> LogicalTime {
        self.merge(message_clock);
        self.increment(now)
    }

    /// Evict zero-valued entries of other replicas while over
    /// [`MAX_CLOCK_ENTRIES`]. Returns the number of evicted entries.
    ///
    /// A replica with a non-zero counter is never evicted.
    pub fn compact(&mut self) -> usize {
        if self.entries.len() <= MAX_CLOCK_ENTRIES {
            return 0;
        }

        let excess = self.entries.len() - MAX_CLOCK_ENTRIES;
        let victims: Vec<ReplicaId> = self
            .entries
            .iter()
            .filter(|(replica, &counter)| counter == 0 && **replica != self.replica_id)
            .map(|(replica, _)| replica.clone())
            .take(excess)
            .collect();

        for replica in &victims {
            self.entries.remove(replica);
        }

        if !victims.is_empty() {
            tracing::trace!(
                replica = %self.replica_id,
                evicted = victims.len(),
                remaining = self.entries.len(),
                "Compacted vector clock"
            );
        }

        victims.len()
    }
}

impl PartialEq for VectorClock {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == ClockOrdering::Equal
    }
}

impl Eq for VectorClock {}

/// Compare two entry maps under standard vector clock partial order.
pub(crate) fn compare_entries(
    left: &BTreeMap<ReplicaId, LogicalTime>,
    right: &BTreeMap<ReplicaId, LogicalTime>,
) -> ClockOrdering {
    let mut less = false;
    let mut greater = false;

    let keys = left.keys().chain(right.keys().filter(|k| !left.contains_key(*k)));
    for replica in keys {
        let l = left.get(replica).copied().unwrap_or(0);
        let r = right.get(replica).copied().unwrap_or(0);
        if l < r {
            less = true;
        } else if l > r {
            greater = true;
        }
        if less && greater {
            return ClockOrdering::Concurrent;
        }
    }

    match (less, greater) {
        (false, false) => ClockOrdering::Equal,
        (true, false) => ClockOrdering::Before,
        (false, true) => ClockOrdering::After,
        (true, true) => ClockOrdering::Concurrent,
    }
}
