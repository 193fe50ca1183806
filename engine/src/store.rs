//! Store - the per-replica container of CRDT entities.
//!
//! The store owns every entity of one replica, keyed by entity ID. It routes
//! incoming states and deltas to the right entity, creating unknown entities
//! on first contact, and produces deltas for the transport to ship.
//!
//! All operations are synchronous. A multi-threaded host wraps the store in
//! a mutex, see [`CrdtStore::new_shared`].

use crate::{
    clock::{VectorClock, VectorClockState},
    config::StoreConfig,
    error::Result,
    gcounter::{GCounter, GCounterValue},
    lww::{LwwRegister, LwwValue},
    orset::{OrSet, OrSetValue},
    pattern::{PatternCrdt, PatternInit, PatternValue},
    snapshot::{SnapshotMetadata, StoreSnapshot},
    state::{AnyDelta, AnyState, ConflictInfo, CrdtDelta, CrdtType, MergeResult, MergeStats, Replicated},
    storage::StateStorage,
    time::{system_clock, SharedWallClock},
    EntityId, Error, ReplicaId, Timestamp,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// One top-level CRDT entity.
///
/// A closed set: dispatch on the wire `type` tag happens once, in
/// [`Crdt::from_state`], and is exhaustive everywhere else.
#[derive(Debug)]
pub enum Crdt {
    GCounter(GCounter),
    LwwRegister(LwwRegister<Value>),
    OrSet(OrSet<String>),
    Pattern(PatternCrdt),
}

impl Crdt {
    /// Rebuild an entity owned by `replica_id` from an untyped state.
    pub fn from_state(
        state: AnyState,
        replica_id: &str,
        wall: SharedWallClock,
        max_history_size: usize,
    ) -> Result<Self> {
        Ok(match state.crdt_type {
            CrdtType::GCounter => Crdt::GCounter(GCounter::from_state(
                state.into_typed::<GCounterValue>()?,
                replica_id,
            )?),
            CrdtType::LwwRegister => Crdt::LwwRegister(LwwRegister::from_state(
                state.into_typed::<LwwValue<Value>>()?,
                replica_id,
            )?),
            CrdtType::OrSet => Crdt::OrSet(OrSet::from_state(
                state.into_typed::<OrSetValue<String>>()?,
                replica_id,
            )?),
            CrdtType::Pattern => Crdt::Pattern(
                PatternCrdt::from_state(state.into_typed::<PatternValue>()?, replica_id, wall)?
                    .with_max_history(max_history_size),
            ),
        })
    }

    /// Wire type tag of this entity.
    pub fn crdt_type(&self) -> CrdtType {
        match self {
            Crdt::GCounter(_) => CrdtType::GCounter,
            Crdt::LwwRegister(_) => CrdtType::LwwRegister,
            Crdt::OrSet(_) => CrdtType::OrSet,
            Crdt::Pattern(_) => CrdtType::Pattern,
        }
    }

    /// Entity ID.
    pub fn id(&self) -> &str {
        match self {
            Crdt::GCounter(c) => c.id(),
            Crdt::LwwRegister(r) => r.id(),
            Crdt::OrSet(s) => s.id(),
            Crdt::Pattern(p) => p.id(),
        }
    }

    /// The entity's vector clock.
    pub fn clock(&self) -> &VectorClock {
        match self {
            Crdt::GCounter(c) => c.clock(),
            Crdt::LwwRegister(r) => r.clock(),
            Crdt::OrSet(s) => s.clock(),
            Crdt::Pattern(p) => p.clock(),
        }
    }

    /// This replica's sequence number for the entity.
    pub fn sequence_number(&self) -> u64 {
        match self {
            Crdt::GCounter(c) => c.sequence_number(),
            Crdt::LwwRegister(r) => r.sequence_number(),
            Crdt::OrSet(s) => s.sequence_number(),
            Crdt::Pattern(p) => p.sequence_number(),
        }
    }

    /// Full state with the payload type erased.
    pub fn state(&self) -> Result<AnyState> {
        match self {
            Crdt::GCounter(c) => c.state().into_any(),
            Crdt::LwwRegister(r) => r.state().into_any(),
            Crdt::OrSet(s) => s.state().into_any(),
            Crdt::Pattern(p) => p.state().into_any(),
        }
    }

    /// Merge an untyped remote state.
    ///
    /// The type tag is checked before the payload is interpreted, so a
    /// mismatched payload surfaces as [`Error::InvalidType`].
    pub fn merge(&mut self, remote: AnyState) -> Result<MergeResult<Value>> {
        remote.ensure_type(self.crdt_type())?;
        match self {
            Crdt::GCounter(c) => c.merge(&remote.into_typed::<GCounterValue>()?)?.into_any(),
            Crdt::LwwRegister(r) => r.merge(&remote.into_typed::<LwwValue<Value>>()?)?.into_any(),
            Crdt::OrSet(s) => s.merge(&remote.into_typed::<OrSetValue<String>>()?)?.into_any(),
            Crdt::Pattern(p) => p.merge(&remote.into_typed::<PatternValue>()?)?.into_any(),
        }
    }

    /// Delta against `since`, or `None` if nothing new.
    pub fn generate_delta(&self, since: &VectorClock, now: Timestamp) -> Result<Option<AnyDelta>> {
        let delta = match self {
            Crdt::GCounter(c) => c.generate_delta(since, now).map(CrdtDelta::into_any),
            Crdt::LwwRegister(r) => r.generate_delta(since, now).map(CrdtDelta::into_any),
            Crdt::OrSet(s) => s.generate_delta(since, now).map(CrdtDelta::into_any),
            Crdt::Pattern(p) => p.generate_delta(since, now).map(CrdtDelta::into_any),
        };
        delta.transpose()
    }

    /// Apply an untyped delta through the merge path.
    pub fn apply_delta(&mut self, delta: AnyDelta) -> Result<MergeResult<Value>> {
        self.crdt_type().require(delta.crdt_type)?;
        match self {
            Crdt::GCounter(c) => c
                .apply_delta(&delta.into_typed::<GCounterValue>()?)?
                .into_any(),
            Crdt::LwwRegister(r) => r
                .apply_delta(&delta.into_typed::<LwwValue<Value>>()?)?
                .into_any(),
            Crdt::OrSet(s) => s
                .apply_delta(&delta.into_typed::<OrSetValue<String>>()?)?
                .into_any(),
            Crdt::Pattern(p) => p
                .apply_delta(&delta.into_typed::<PatternValue>()?)?
                .into_any(),
        }
    }

    /// Prune stable tombstones. Only sets and patterns hold any.
    pub fn collect_garbage(&mut self) -> usize {
        match self {
            Crdt::OrSet(s) => s.collect_garbage(),
            Crdt::Pattern(p) => p.collect_garbage(),
            Crdt::GCounter(_) | Crdt::LwwRegister(_) => 0,
        }
    }

    fn mismatch(&self, expected: CrdtType) -> Error {
        Error::InvalidType {
            expected,
            actual: self.crdt_type(),
        }
    }
}

/// Outcome of a bulk [`CrdtStore::apply_states`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    /// States merged or created successfully
    pub applied: usize,
    /// Entities seen for the first time
    pub created: usize,
    /// Entities whose visible value changed
    pub changed: usize,
    /// Conflicts resolved across all merges
    pub conflicts: Vec<ConflictInfo>,
    /// States that failed, with the reason
    pub failed: Vec<(EntityId, Error)>,
}

impl SyncReport {
    /// Check if every state in the batch applied.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// A store shared between threads.
pub type SharedStore = Arc<Mutex<CrdtStore>>;

/// All CRDT entities owned by one replica.
#[derive(Debug)]
pub struct CrdtStore {
    config: StoreConfig,
    wall: SharedWallClock,
    entities: BTreeMap<EntityId, Crdt>,
}

impl CrdtStore {
    /// Create an empty store reading the system wall clock.
    pub fn new(config: StoreConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    /// Create an empty store reading time from `wall`.
    pub fn with_clock(config: StoreConfig, wall: SharedWallClock) -> Self {
        Self {
            config,
            wall,
            entities: BTreeMap::new(),
        }
    }

    /// Create a store behind a mutex for multi-threaded hosts.
    pub fn new_shared(config: StoreConfig) -> SharedStore {
        Arc::new(Mutex::new(Self::new(config)))
    }

    /// Replica that owns this store.
    pub fn replica_id(&self) -> &ReplicaId {
        &self.config.replica_id
    }

    /// Store configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Current wall time as seen by this store.
    pub fn now(&self) -> Timestamp {
        self.wall.now_millis()
    }

    /// Number of entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Check if the store holds no entities.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Check if an entity exists.
    pub fn contains(&self, id: &str) -> bool {
        self.entities.contains_key(id)
    }

    /// Entity IDs in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = &EntityId> {
        self.entities.keys()
    }

    // ------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------

    /// Create a pattern owned by this replica.
    pub fn create_pattern(
        &mut self,
        id: impl Into<EntityId>,
        init: PatternInit,
    ) -> Result<&mut PatternCrdt> {
        let id = id.into();
        self.ensure_absent(&id)?;
        let pattern = PatternCrdt::with_clock(
            id.clone(),
            self.config.replica_id.clone(),
            init,
            self.wall.clone(),
        )
        .with_max_history(self.config.max_history_size);
        self.insert(Crdt::Pattern(pattern));
        self.pattern_mut(&id)
    }

    /// Create a grow-only counter owned by this replica.
    pub fn create_counter(&mut self, id: impl Into<EntityId>) -> Result<&mut GCounter> {
        let id = id.into();
        self.ensure_absent(&id)?;
        let counter = GCounter::new(id.clone(), self.config.replica_id.clone(), self.now());
        self.insert(Crdt::GCounter(counter));
        self.counter_mut(&id)
    }

    /// Create an empty JSON register owned by this replica.
    pub fn create_register(&mut self, id: impl Into<EntityId>) -> Result<&mut LwwRegister<Value>> {
        let id = id.into();
        self.ensure_absent(&id)?;
        let register = LwwRegister::new(id.clone(), self.config.replica_id.clone(), self.now());
        self.insert(Crdt::LwwRegister(register));
        self.register_mut(&id)
    }

    /// Create an empty string set owned by this replica.
    pub fn create_set(&mut self, id: impl Into<EntityId>) -> Result<&mut OrSet<String>> {
        let id = id.into();
        self.ensure_absent(&id)?;
        let set = OrSet::new(id.clone(), self.config.replica_id.clone(), self.now());
        self.insert(Crdt::OrSet(set));
        self.set_mut(&id)
    }

    fn ensure_absent(&self, id: &str) -> Result<()> {
        if self.entities.contains_key(id) {
            return Err(Error::EntityAlreadyExists(id.to_string()));
        }
        Ok(())
    }

    fn insert(&mut self, crdt: Crdt) {
        tracing::debug!(
            entity_id = %crdt.id(),
            crdt_type = %crdt.crdt_type(),
            replica = %self.config.replica_id,
            "Created entity"
        );
        self.entities.insert(crdt.id().to_string(), crdt);
    }

    // ------------------------------------------------------------------
    // Access
    // ------------------------------------------------------------------

    /// Get an entity by ID.
    pub fn get(&self, id: &str) -> Option<&Crdt> {
        self.entities.get(id)
    }

    /// Get a mutable entity by ID.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut Crdt> {
        self.entities.get_mut(id)
    }

    fn entity(&self, id: &str) -> Result<&Crdt> {
        self.entities
            .get(id)
            .ok_or_else(|| Error::EntityNotFound(id.to_string()))
    }

    fn entity_mut(&mut self, id: &str) -> Result<&mut Crdt> {
        self.entities
            .get_mut(id)
            .ok_or_else(|| Error::EntityNotFound(id.to_string()))
    }

    /// Get a pattern, failing if it is missing or of another type.
    pub fn pattern(&self, id: &str) -> Result<&PatternCrdt> {
        match self.entity(id)? {
            Crdt::Pattern(p) => Ok(p),
            other => Err(other.mismatch(CrdtType::Pattern)),
        }
    }

    /// Get a mutable pattern.
    pub fn pattern_mut(&mut self, id: &str) -> Result<&mut PatternCrdt> {
        match self.entity_mut(id)? {
            Crdt::Pattern(p) => Ok(p),
            other => Err(other.mismatch(CrdtType::Pattern)),
        }
    }

    /// Get a counter, failing if it is missing or of another type.
    pub fn counter(&self, id: &str) -> Result<&GCounter> {
        match self.entity(id)? {
            Crdt::GCounter(c) => Ok(c),
            other => Err(other.mismatch(CrdtType::GCounter)),
        }
    }

    /// Get a mutable counter.
    pub fn counter_mut(&mut self, id: &str) -> Result<&mut GCounter> {
        match self.entity_mut(id)? {
            Crdt::GCounter(c) => Ok(c),
            other => Err(other.mismatch(CrdtType::GCounter)),
        }
    }

    /// Get a register, failing if it is missing or of another type.
    pub fn register(&self, id: &str) -> Result<&LwwRegister<Value>> {
        match self.entity(id)? {
            Crdt::LwwRegister(r) => Ok(r),
            other => Err(other.mismatch(CrdtType::LwwRegister)),
        }
    }

    /// Get a mutable register.
    pub fn register_mut(&mut self, id: &str) -> Result<&mut LwwRegister<Value>> {
        match self.entity_mut(id)? {
            Crdt::LwwRegister(r) => Ok(r),
            other => Err(other.mismatch(CrdtType::LwwRegister)),
        }
    }

    /// Get a set, failing if it is missing or of another type.
    pub fn set(&self, id: &str) -> Result<&OrSet<String>> {
        match self.entity(id)? {
            Crdt::OrSet(s) => Ok(s),
            other => Err(other.mismatch(CrdtType::OrSet)),
        }
    }

    /// Get a mutable set.
    pub fn set_mut(&mut self, id: &str) -> Result<&mut OrSet<String>> {
        match self.entity_mut(id)? {
            Crdt::OrSet(s) => Ok(s),
            other => Err(other.mismatch(CrdtType::OrSet)),
        }
    }

    /// Drop an entity locally. A later state from a peer recreates it.
    pub fn delete(&mut self, id: &str) -> Result<Crdt> {
        let removed = self
            .entities
            .remove(id)
            .ok_or_else(|| Error::EntityNotFound(id.to_string()))?;
        tracing::debug!(entity_id = %id, "Deleted entity");
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Sync
    // ------------------------------------------------------------------

    /// Merge a remote state, creating the entity if it is unknown.
    pub fn apply_state(&mut self, state: AnyState) -> Result<MergeResult<Value>> {
        self.apply_state_tracked(state).map(|(result, _)| result)
    }

    fn apply_state_tracked(&mut self, state: AnyState) -> Result<(MergeResult<Value>, bool)> {
        let gc_on_merge = self.config.gc_on_merge;

        if let Some(existing) = self.entities.get_mut(&state.id) {
            let result = existing.merge(state)?;
            if gc_on_merge {
                existing.collect_garbage();
            }
            return Ok((result, false));
        }

        let mut crdt = Crdt::from_state(
            state,
            &self.config.replica_id,
            self.wall.clone(),
            self.config.max_history_size,
        )?;
        if gc_on_merge {
            crdt.collect_garbage();
        }
        let result = MergeResult {
            success: true,
            state: crdt.state()?,
            local_changed: true,
            conflicts: Vec::new(),
            stats: MergeStats {
                entries_merged: 1,
                ..MergeStats::default()
            },
        };
        self.insert(crdt);
        Ok((result, true))
    }

    /// Apply a batch of states, continuing past failures.
    pub fn apply_states(&mut self, states: impl IntoIterator<Item = AnyState>) -> SyncReport {
        let mut report = SyncReport::default();
        for state in states {
            let id = state.id.clone();
            match self.apply_state_tracked(state) {
                Ok((result, created)) => {
                    report.applied += 1;
                    report.created += usize::from(created);
                    report.changed += usize::from(result.local_changed);
                    report.conflicts.extend(result.conflicts);
                }
                Err(err) => {
                    tracing::debug!(entity_id = %id, error = %err, "Failed to apply state");
                    report.failed.push((id, err));
                }
            }
        }

        tracing::debug!(
            replica = %self.config.replica_id,
            applied = report.applied,
            created = report.created,
            changed = report.changed,
            failed = report.failed.len(),
            "Applied state batch"
        );
        report
    }

    /// Apply a remote delta, creating the entity if it is unknown.
    pub fn apply_delta(&mut self, delta: AnyDelta) -> Result<MergeResult<Value>> {
        let gc_on_merge = self.config.gc_on_merge;

        if let Some(existing) = self.entities.get_mut(&delta.crdt_id) {
            let result = existing.apply_delta(delta)?;
            if gc_on_merge {
                existing.collect_garbage();
            }
            return Ok(result);
        }

        let mut applied = None;
        for state in delta.states() {
            applied = Some(self.apply_state(state)?);
        }
        applied.ok_or_else(|| {
            Error::InvalidState(format!(
                "delta for '{}' carries no operations",
                delta.crdt_id
            ))
        })
    }

    /// Deltas for every entity whose clock is not covered by `since`.
    ///
    /// Entity clocks advance independently, so one clock is only exact for
    /// a single entity. Passing a clock merged across entities (such as
    /// [`current_clock`](Self::current_clock)) hides later updates to any
    /// entity that was behind it. To sync a whole store with a peer, use the
    /// peer's [`clocks`](Self::clocks) with
    /// [`generate_deltas_from`](Self::generate_deltas_from).
    pub fn generate_deltas(&self, since: &VectorClock) -> Result<Vec<AnyDelta>> {
        let now = self.now();
        let mut deltas = Vec::new();
        for crdt in self.entities.values() {
            if let Some(delta) = crdt.generate_delta(since, now)? {
                deltas.push(delta);
            }
        }
        tracing::debug!(
            replica = %self.config.replica_id,
            deltas = deltas.len(),
            entities = self.entities.len(),
            "Generated deltas"
        );
        Ok(deltas)
    }

    /// Deltas against a per-entity cursor, as returned by the receiving
    /// peer's [`clocks`](Self::clocks).
    ///
    /// Entities missing from `cursors` are always included.
    pub fn generate_deltas_from(
        &self,
        cursors: &BTreeMap<EntityId, VectorClockState>,
    ) -> Result<Vec<AnyDelta>> {
        let now = self.now();
        let mut deltas = Vec::new();
        for (id, crdt) in &self.entities {
            let since = match cursors.get(id) {
                Some(state) => VectorClock::from_state(self.config.replica_id.clone(), state.clone()),
                None => VectorClock::new(self.config.replica_id.clone()),
            };
            if let Some(delta) = crdt.generate_delta(&since, now)? {
                deltas.push(delta);
            }
        }
        Ok(deltas)
    }

    /// Full states of all entities.
    pub fn states(&self) -> Result<Vec<AnyState>> {
        self.entities.values().map(Crdt::state).collect()
    }

    /// Per-entity clocks: what this replica has seen of each entity.
    ///
    /// Hand these to a peer's
    /// [`generate_deltas_from`](Self::generate_deltas_from) to receive
    /// exactly the entities that moved past them.
    pub fn clocks(&self) -> BTreeMap<EntityId, VectorClockState> {
        self.entities
            .iter()
            .map(|(id, crdt)| (id.clone(), crdt.clock().state()))
            .collect()
    }

    /// Entry-wise maximum of all entity clocks.
    ///
    /// A summary of how far each replica's writes have been seen anywhere in
    /// the store. Not a delta cursor; see [`generate_deltas`](Self::generate_deltas).
    pub fn current_clock(&self) -> VectorClock {
        let mut clock = VectorClock::new(self.config.replica_id.clone());
        for crdt in self.entities.values() {
            clock.merge(crdt.clock());
        }
        clock
    }

    /// Prune stable tombstones across all entities.
    pub fn collect_garbage(&mut self) -> usize {
        let pruned: usize = self.entities.values_mut().map(Crdt::collect_garbage).sum();
        tracing::trace!(replica = %self.config.replica_id, pruned, "Collected garbage");
        pruned
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Export every entity as a snapshot.
    pub fn export_snapshot(&self) -> Result<StoreSnapshot> {
        let mut snapshot = StoreSnapshot::new(self.config.replica_id.clone(), self.now());
        snapshot.clock = self.current_clock().state();
        for crdt in self.entities.values() {
            snapshot.add_state(crdt.state()?);
        }
        tracing::info!(
            replica = %self.config.replica_id,
            entities = snapshot.entity_count(),
            "Exported snapshot"
        );
        Ok(snapshot)
    }

    /// Merge a snapshot into this store. Returns the number of entities applied.
    ///
    /// Entities already present are merged rather than replaced, so a stale
    /// snapshot cannot roll back newer state.
    pub fn import_snapshot(&mut self, snapshot: StoreSnapshot) -> Result<usize> {
        snapshot.validate()?;
        let from = snapshot.replica_id.clone();
        let mut applied = 0;
        for (_, state) in snapshot.entities {
            self.apply_state(state)?;
            applied += 1;
        }
        tracing::info!(
            replica = %self.config.replica_id,
            from = %from,
            entities = applied,
            "Imported snapshot"
        );
        Ok(applied)
    }

    /// Summary of what an export would contain.
    pub fn snapshot_metadata(&self) -> SnapshotMetadata {
        SnapshotMetadata {
            format_version: crate::snapshot::SNAPSHOT_FORMAT_VERSION,
            replica_id: self.config.replica_id.clone(),
            clock_entries: self.current_clock().len(),
            entity_count: self.entities.len(),
            pattern_count: self
                .entities
                .values()
                .filter(|c| c.crdt_type() == CrdtType::Pattern)
                .count(),
            taken_at: self.now(),
        }
    }

    /// Write every entity's state to `storage`, one blob per entity ID.
    pub fn save_to(&self, storage: &mut dyn StateStorage) -> Result<usize> {
        for (id, crdt) in &self.entities {
            storage.put(id, crdt.state()?.to_json()?)?;
        }
        tracing::info!(
            replica = %self.config.replica_id,
            entities = self.entities.len(),
            "Saved store"
        );
        Ok(self.entities.len())
    }

    /// Merge every entity held in `storage` into this store.
    pub fn load_from(&mut self, storage: &dyn StateStorage) -> Result<usize> {
        let mut loaded = 0;
        for key in storage.keys()? {
            let blob = storage
                .get(&key)?
                .ok_or_else(|| Error::Storage(format!("key '{key}' vanished during load")))?;
            let state = AnyState::from_json(&blob)?;
            if state.id != key {
                return Err(Error::Storage(format!(
                    "blob under '{}' holds entity '{}'",
                    key, state.id
                )));
            }
            self.apply_state(state)?;
            loaded += 1;
        }
        tracing::info!(replica = %self.config.replica_id, entities = loaded, "Loaded store");
        Ok(loaded)
    }
}
