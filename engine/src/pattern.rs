//! Composite CRDT for one shared pattern.
//!
//! Every field is its own CRDT and is resolved independently on merge:
//!
//! | Field            | CRDT                      | Sub-entity ID              |
//! |------------------|---------------------------|----------------------------|
//! | `id`             | immutable                 |                            |
//! | `content`        | LWW-Register              | `{id}-content`             |
//! | `type`           | LWW-Register              | `{id}-type`                |
//! | `category`       | LWW-Register              | `{id}-category`            |
//! | `domain`         | LWW-Register              | `{id}-domain`              |
//! | `quality`        | LWW-Register (one unit)   | `{id}-quality`             |
//! | `sharingConfig`  | LWW-Register (one unit)   | `{id}-sharingConfig`       |
//! | `metadata[key]`  | LWW-Register per key      | `{id}-metadata-{key}`      |
//! | `tags`           | OR-Set (add wins)         | `{id}-tags`                |
//! | `usageCount`     | G-Counter                 | `{id}-usageCount`          |
//! | `lastModified`   | derived from entity clock |                            |
//!
//! Merging is not atomic across fields. If one field's remote payload is
//! malformed, fields merged before it stay merged, fields after it and the
//! entity clock are left untouched, and the failure is recorded in the
//! modification history. Merge is idempotent, so retrying the same state, or
//! a fresh full state from the peer, is always safe.

use crate::{
    clock::VectorClock,
    error::{Error, Result},
    gcounter::{GCounter, GCounterValue},
    lww::{LwwRegister, LwwValue},
    orset::{OrSet, OrSetValue},
    state::{
        ConflictInfo, CrdtDelta, CrdtState, CrdtType, MergeResult, MergeStats, Replicated,
        StateMetadata, STATE_VERSION,
    },
    time::{system_clock, SharedWallClock},
    EntityId, ReplicaId, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::time::Instant;

/// Default bound of the modification history ring buffer.
pub const DEFAULT_MAX_HISTORY: usize = 100;

/// Coarse quality tier of a pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLevel {
    #[default]
    Low,
    Medium,
    High,
    Verified,
}

/// Quality metrics, replicated as one LWW unit.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityMetrics {
    pub level: QualityLevel,
    pub success_rate: f64,
    pub unique_users: u64,
    pub avg_confidence: f64,
    pub feedback_score: f64,
}

/// Who a pattern may be shared with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SharingPolicy {
    #[default]
    Private,
    Team,
    Public,
}

/// How much identifying detail travels with a shared pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivacyLevel {
    #[default]
    Strict,
    Balanced,
    Open,
}

/// Sharing policy, replicated as one LWW unit.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharingConfig {
    pub policy: SharingPolicy,
    pub privacy: PrivacyLevel,
    pub redistributable: bool,
}

/// Initial field values for a new pattern.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatternInit {
    pub content: String,
    pub pattern_type: String,
    pub category: String,
    pub domain: String,
    pub tags: Vec<String>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub quality: QualityMetrics,
    pub sharing_config: SharingConfig,
}

impl PatternInit {
    /// Start from the pattern content; everything else defaults.
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    /// Set the initial pattern type.
    pub fn with_type(mut self, pattern_type: impl Into<String>) -> Self {
        self.pattern_type = pattern_type.into();
        self
    }

    /// Set the initial category.
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    /// Set the initial domain.
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    /// Add an initial tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Add an initial metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Set the initial quality metrics.
    pub fn with_quality(mut self, quality: QualityMetrics) -> Self {
        self.quality = quality;
        self
    }

    /// Set the initial sharing configuration.
    pub fn with_sharing_config(mut self, sharing_config: SharingConfig) -> Self {
        self.sharing_config = sharing_config;
        self
    }
}

/// The logical view of a pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternData {
    pub id: EntityId,
    pub content: String,
    #[serde(rename = "type")]
    pub pattern_type: String,
    pub category: String,
    pub domain: String,
    pub tags: Vec<String>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub quality: QualityMetrics,
    pub usage_count: u64,
    pub sharing_config: SharingConfig,
    pub last_modified: Timestamp,
}

/// Wire payload of a pattern: one envelope per field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternValue {
    pub content: CrdtState<LwwValue<String>>,
    #[serde(rename = "type")]
    pub pattern_type: CrdtState<LwwValue<String>>,
    pub category: CrdtState<LwwValue<String>>,
    pub domain: CrdtState<LwwValue<String>>,
    pub quality: CrdtState<LwwValue<QualityMetrics>>,
    pub sharing_config: CrdtState<LwwValue<SharingConfig>>,
    pub tags: CrdtState<OrSetValue<String>>,
    pub usage_count: CrdtState<GCounterValue>,
    pub metadata: BTreeMap<String, CrdtState<LwwValue<serde_json::Value>>>,
}

/// What a history entry recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ModificationKind {
    SetContent,
    SetType,
    SetCategory,
    SetDomain,
    AddTag,
    RemoveTag,
    SetMetadata,
    RemoveMetadata,
    IncrementUsage,
    SetQuality,
    SetSharingConfig,
    Merge,
    MergeFailed,
}

/// One audit record in the modification history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModificationEntry {
    /// Entity sequence number when the entry was written
    pub sequence: u64,
    pub timestamp: Timestamp,
    pub replica_id: ReplicaId,
    pub kind: ModificationKind,
    /// Operation argument, merge origin, or error message
    pub detail: serde_json::Value,
}

/// Accumulates per-field merge outcomes.
#[derive(Default)]
struct FieldMerge {
    local_changed: bool,
    conflicts: Vec<ConflictInfo>,
    stats: MergeStats,
}

impl FieldMerge {
    fn absorb<V>(&mut self, result: MergeResult<V>) {
        self.local_changed |= result.local_changed;
        self.conflicts.extend(result.conflicts);
        self.stats.absorb(&result.stats);
    }
}

/// A shared pattern entity owned by one replica.
#[derive(Debug)]
pub struct PatternCrdt {
    id: EntityId,
    replica_id: ReplicaId,
    content: LwwRegister<String>,
    pattern_type: LwwRegister<String>,
    category: LwwRegister<String>,
    domain: LwwRegister<String>,
    quality: LwwRegister<QualityMetrics>,
    sharing_config: LwwRegister<SharingConfig>,
    metadata: BTreeMap<String, LwwRegister<serde_json::Value>>,
    tags: OrSet<String>,
    usage_count: GCounter,
    clock: VectorClock,
    state_metadata: StateMetadata,
    sequence: u64,
    history: VecDeque<ModificationEntry>,
    max_history_size: usize,
    wall: SharedWallClock,
}

fn field_id(id: &str, field: &str) -> String {
    format!("{id}-{field}")
}

fn metadata_id(id: &str, key: &str) -> String {
    format!("{id}-metadata-{key}")
}

impl PatternCrdt {
    /// Create a pattern using the system wall clock.
    pub fn new(id: impl Into<EntityId>, replica_id: impl Into<ReplicaId>, init: PatternInit) -> Self {
        Self::with_clock(id, replica_id, init, system_clock())
    }

    /// Create a pattern reading time from `wall`.
    pub fn with_clock(
        id: impl Into<EntityId>,
        replica_id: impl Into<ReplicaId>,
        init: PatternInit,
        wall: SharedWallClock,
    ) -> Self {
        let id = id.into();
        let replica_id = replica_id.into();
        let now = wall.now_millis();
        let r = replica_id.as_str();

        let mut tags = OrSet::new(field_id(&id, "tags"), r, now);
        for tag in init.tags {
            tags.add(tag, now);
        }

        let metadata = init
            .metadata
            .into_iter()
            .map(|(key, value)| {
                let register = LwwRegister::with_value(metadata_id(&id, &key), r, value, now);
                (key, register)
            })
            .collect();

        let mut clock = VectorClock::new(r);
        let sequence = clock.increment(now);

        Self {
            content: LwwRegister::with_value(field_id(&id, "content"), r, init.content, now),
            pattern_type: LwwRegister::with_value(field_id(&id, "type"), r, init.pattern_type, now),
            category: LwwRegister::with_value(field_id(&id, "category"), r, init.category, now),
            domain: LwwRegister::with_value(field_id(&id, "domain"), r, init.domain, now),
            quality: LwwRegister::with_value(field_id(&id, "quality"), r, init.quality, now),
            sharing_config: LwwRegister::with_value(
                field_id(&id, "sharingConfig"),
                r,
                init.sharing_config,
                now,
            ),
            metadata,
            tags,
            usage_count: GCounter::new(field_id(&id, "usageCount"), r, now),
            clock,
            state_metadata: StateMetadata::new(now, r),
            sequence,
            history: VecDeque::new(),
            max_history_size: DEFAULT_MAX_HISTORY,
            wall,
            replica_id,
            id,
        }
    }

    /// Rebuild a pattern owned by `replica_id` from a serialized state.
    pub fn from_state(
        state: CrdtState<PatternValue>,
        replica_id: impl Into<ReplicaId>,
        wall: SharedWallClock,
    ) -> Result<Self> {
        state.ensure_type(CrdtType::Pattern)?;
        let replica_id = replica_id.into();
        let id = state.id.clone();
        let clock = state.clock_for(&replica_id);
        let r = replica_id.as_str();
        let value = state.value;

        fn checked<S>(sub: &CrdtState<S>, expected: String) -> Result<()> {
            sub.ensure_id(&expected)
        }

        checked(&value.content, field_id(&id, "content"))?;
        checked(&value.pattern_type, field_id(&id, "type"))?;
        checked(&value.category, field_id(&id, "category"))?;
        checked(&value.domain, field_id(&id, "domain"))?;
        checked(&value.quality, field_id(&id, "quality"))?;
        checked(&value.sharing_config, field_id(&id, "sharingConfig"))?;
        checked(&value.tags, field_id(&id, "tags"))?;
        checked(&value.usage_count, field_id(&id, "usageCount"))?;

        let mut metadata = BTreeMap::new();
        for (key, sub) in value.metadata {
            checked(&sub, metadata_id(&id, &key))?;
            metadata.insert(key, LwwRegister::from_state(sub, r)?);
        }

        Ok(Self {
            content: LwwRegister::from_state(value.content, r)?,
            pattern_type: LwwRegister::from_state(value.pattern_type, r)?,
            category: LwwRegister::from_state(value.category, r)?,
            domain: LwwRegister::from_state(value.domain, r)?,
            quality: LwwRegister::from_state(value.quality, r)?,
            sharing_config: LwwRegister::from_state(value.sharing_config, r)?,
            metadata,
            tags: OrSet::from_state(value.tags, r)?,
            usage_count: GCounter::from_state(value.usage_count, r)?,
            sequence: clock.get(r),
            clock,
            state_metadata: state.metadata,
            history: VecDeque::new(),
            max_history_size: DEFAULT_MAX_HISTORY,
            wall,
            replica_id,
            id,
        })
    }

    /// Bound the modification history, evicting the oldest entries.
    pub fn with_max_history(mut self, max_history_size: usize) -> Self {
        self.max_history_size = max_history_size;
        self.trim_history();
        self
    }

    /// Copy this pattern through its wire form.
    ///
    /// The copy is exactly what a remote peer would reconstruct, which also
    /// exercises the serialization path. History is not carried over.
    pub fn try_clone(&self) -> Result<Self> {
        let json = serde_json::to_value(self.state())
            .map_err(|e| Error::InvalidState(e.to_string()))?;
        let state = CrdtState::<PatternValue>::from_value(json)?;
        Ok(Self::from_state(state, self.replica_id.clone(), self.wall.clone())?
            .with_max_history(self.max_history_size))
    }

    // ------------------------------------------------------------------
    // Mutators
    // ------------------------------------------------------------------

    /// Overwrite the pattern content.
    pub fn set_content(&mut self, content: impl Into<String>) {
        let content = content.into();
        let now = self.record(ModificationKind::SetContent, serde_json::json!(content));
        self.content.set(content, now);
        self.advance(now);
    }

    /// Overwrite the pattern type.
    pub fn set_type(&mut self, pattern_type: impl Into<String>) {
        let pattern_type = pattern_type.into();
        let now = self.record(ModificationKind::SetType, serde_json::json!(pattern_type));
        self.pattern_type.set(pattern_type, now);
        self.advance(now);
    }

    /// Overwrite the category.
    pub fn set_category(&mut self, category: impl Into<String>) {
        let category = category.into();
        let now = self.record(ModificationKind::SetCategory, serde_json::json!(category));
        self.category.set(category, now);
        self.advance(now);
    }

    /// Overwrite the domain.
    pub fn set_domain(&mut self, domain: impl Into<String>) {
        let domain = domain.into();
        let now = self.record(ModificationKind::SetDomain, serde_json::json!(domain));
        self.domain.set(domain, now);
        self.advance(now);
    }

    /// Add a tag under a fresh token, so it survives a concurrent remove.
    pub fn add_tag(&mut self, tag: impl Into<String>) {
        let tag = tag.into();
        let now = self.record(ModificationKind::AddTag, serde_json::json!(tag));
        self.tags.add(tag, now);
        self.advance(now);
    }

    /// Remove a tag. Returns false (and records nothing) if the tag was not
    /// present.
    pub fn remove_tag(&mut self, tag: &str) -> bool {
        let tag = tag.to_string();
        if !self.tags.contains(&tag) {
            return false;
        }
        let now = self.record(ModificationKind::RemoveTag, serde_json::json!(tag));
        self.tags.remove(&tag, now);
        self.advance(now);
        true
    }

    /// Write one metadata key. Other keys are untouched.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: serde_json::Value) {
        let key = key.into();
        let now = self.record(
            ModificationKind::SetMetadata,
            serde_json::json!({ "key": key, "value": value }),
        );
        match self.metadata.get_mut(&key) {
            Some(register) => {
                register.set(value, now);
            }
            None => {
                let register = LwwRegister::with_value(
                    metadata_id(&self.id, &key),
                    self.replica_id.as_str(),
                    value,
                    now,
                );
                self.metadata.insert(key, register);
            }
        }
        self.advance(now);
    }

    /// Clear a metadata entry by writing `null` to its register.
    ///
    /// Returns false if the key was not visible.
    pub fn remove_metadata(&mut self, key: &str) -> bool {
        if self.get_metadata(key).is_none() {
            return false;
        }
        let now = self.record(ModificationKind::RemoveMetadata, serde_json::json!(key));
        if let Some(register) = self.metadata.get_mut(key) {
            register.set(serde_json::Value::Null, now);
        }
        self.advance(now);
        true
    }

    /// Add to this replica's usage contribution; returns the new total.
    pub fn increment_usage(&mut self, amount: u64) -> u64 {
        let now = self.record(ModificationKind::IncrementUsage, serde_json::json!(amount));
        let total = self.usage_count.increment(amount, now);
        self.advance(now);
        total
    }

    /// Replace the quality metrics as one unit.
    pub fn set_quality(&mut self, quality: QualityMetrics) {
        let now = self.record(ModificationKind::SetQuality, serde_json::json!(quality));
        self.quality.set(quality, now);
        self.advance(now);
    }

    /// Replace the sharing configuration as one unit.
    pub fn set_sharing_config(&mut self, sharing_config: SharingConfig) {
        let now = self.record(
            ModificationKind::SetSharingConfig,
            serde_json::json!(sharing_config),
        );
        self.sharing_config.set(sharing_config, now);
        self.advance(now);
    }

    fn record(&mut self, kind: ModificationKind, detail: serde_json::Value) -> Timestamp {
        let now = self.wall.now_millis();
        self.history.push_back(ModificationEntry {
            sequence: self.sequence,
            timestamp: now,
            replica_id: self.replica_id.clone(),
            kind,
            detail,
        });
        self.trim_history();
        now
    }

    fn trim_history(&mut self) {
        while self.history.len() > self.max_history_size {
            self.history.pop_front();
        }
    }

    fn advance(&mut self, now: Timestamp) {
        self.clock.increment(now);
        self.sequence += 1;
        self.state_metadata.touch(now, &self.replica_id);
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Current content, empty if never set.
    pub fn get_content(&self) -> &str {
        self.content.value().map(String::as_str).unwrap_or_default()
    }

    /// Current pattern type, empty if never set.
    pub fn get_type(&self) -> &str {
        self.pattern_type.value().map(String::as_str).unwrap_or_default()
    }

    /// Current category, empty if never set.
    pub fn get_category(&self) -> &str {
        self.category.value().map(String::as_str).unwrap_or_default()
    }

    /// Current domain, empty if never set.
    pub fn get_domain(&self) -> &str {
        self.domain.value().map(String::as_str).unwrap_or_default()
    }

    /// Visible tags in ascending order.
    pub fn get_tags(&self) -> Vec<String> {
        self.tags.values()
    }

    /// Check if a tag is visible.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(&tag.to_string())
    }

    /// A metadata value; cleared entries read as absent.
    pub fn get_metadata(&self, key: &str) -> Option<&serde_json::Value> {
        self.metadata
            .get(key)
            .and_then(|r| r.value())
            .filter(|v| !v.is_null())
    }

    /// All visible metadata entries.
    pub fn metadata_entries(&self) -> BTreeMap<String, serde_json::Value> {
        self.metadata
            .keys()
            .filter_map(|k| self.get_metadata(k).map(|v| (k.clone(), v.clone())))
            .collect()
    }

    /// Current quality metrics.
    pub fn get_quality(&self) -> QualityMetrics {
        self.quality.value().cloned().unwrap_or_default()
    }

    /// Current sharing configuration.
    pub fn get_sharing_config(&self) -> SharingConfig {
        self.sharing_config.value().cloned().unwrap_or_default()
    }

    /// Usage summed across all replicas.
    pub fn get_usage_count(&self) -> u64 {
        self.usage_count.value()
    }

    /// Wall time of the most recent mutation this entity has seen.
    pub fn last_modified(&self) -> Timestamp {
        self.clock.last_modified()
    }

    /// The logical view of this pattern.
    pub fn get_data(&self) -> PatternData {
        PatternData {
            id: self.id.clone(),
            content: self.get_content().to_string(),
            pattern_type: self.get_type().to_string(),
            category: self.get_category().to_string(),
            domain: self.get_domain().to_string(),
            tags: self.get_tags(),
            metadata: self.metadata_entries(),
            quality: self.get_quality(),
            usage_count: self.get_usage_count(),
            sharing_config: self.get_sharing_config(),
            last_modified: self.last_modified(),
        }
    }

    /// Modification history, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &ModificationEntry> {
        self.history.iter()
    }

    /// Entity-level bookkeeping.
    pub fn metadata(&self) -> &StateMetadata {
        &self.state_metadata
    }

    /// Number of tombstones retained by the tag set.
    pub fn tombstone_count(&self) -> usize {
        self.tags.tombstone_count()
    }

    /// Drop tag tombstones every known replica has observed.
    pub fn collect_garbage(&mut self) -> usize {
        self.tags.collect_garbage()
    }

    /// Delta since `since` stamped with this pattern's wall clock.
    pub fn delta_since(&self, since: &VectorClock) -> Option<CrdtDelta<PatternValue>> {
        Replicated::generate_delta(self, since, self.wall.now_millis())
    }

    fn merge_fields(&mut self, remote: &PatternValue) -> Result<FieldMerge> {
        let mut merged = FieldMerge::default();

        merged.absorb(self.content.merge(&remote.content)?);
        merged.absorb(self.pattern_type.merge(&remote.pattern_type)?);
        merged.absorb(self.category.merge(&remote.category)?);
        merged.absorb(self.domain.merge(&remote.domain)?);
        merged.absorb(self.quality.merge(&remote.quality)?);
        merged.absorb(self.sharing_config.merge(&remote.sharing_config)?);
        merged.absorb(self.tags.merge(&remote.tags)?);
        merged.absorb(self.usage_count.merge(&remote.usage_count)?);

        for (key, sub) in &remote.metadata {
            match self.metadata.get_mut(key) {
                Some(register) => merged.absorb(register.merge(sub)?),
                None => {
                    sub.ensure_id(&metadata_id(&self.id, key))?;
                    let register = LwwRegister::from_state(sub.clone(), self.replica_id.as_str())?;
                    merged.local_changed |= register.value().is_some_and(|v| !v.is_null());
                    merged.stats.entries_merged += 1;
                    self.metadata.insert(key.clone(), register);
                }
            }
        }

        Ok(merged)
    }
}

impl Replicated for PatternCrdt {
    type Value = PatternValue;
    const CRDT_TYPE: CrdtType = CrdtType::Pattern;

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
        self.sequence
    }

    fn state(&self) -> CrdtState<PatternValue> {
        CrdtState {
            crdt_type: CrdtType::Pattern,
            id: self.id.clone(),
            vector_clock: self.clock.state(),
            origin: self.replica_id.clone(),
            value: PatternValue {
                content: self.content.state(),
                pattern_type: self.pattern_type.state(),
                category: self.category.state(),
                domain: self.domain.state(),
                quality: self.quality.state(),
                sharing_config: self.sharing_config.state(),
                tags: self.tags.state(),
                usage_count: self.usage_count.state(),
                metadata: self
                    .metadata
                    .iter()
                    .map(|(k, r)| (k.clone(), r.state()))
                    .collect(),
            },
            metadata: self.state_metadata.clone(),
            state_version: STATE_VERSION,
        }
    }

    fn merge(&mut self, remote: &CrdtState<PatternValue>) -> Result<MergeResult<PatternValue>> {
        let started = Instant::now();
        remote.ensure_type(CrdtType::Pattern)?;
        remote.ensure_id(&self.id)?;

        let merged = match self.merge_fields(&remote.value) {
            Ok(merged) => merged,
            Err(err) => {
                tracing::warn!(
                    entity_id = %self.id,
                    origin = %remote.origin,
                    error = %err,
                    "Pattern merge partially applied"
                );
                self.record(
                    ModificationKind::MergeFailed,
                    serde_json::json!({ "origin": remote.origin, "error": err.to_string() }),
                );
                return Err(err);
            }
        };

        self.clock.merge_state(&remote.vector_clock);
        self.state_metadata.absorb(&remote.metadata);
        if merged.local_changed {
            self.record(
                ModificationKind::Merge,
                serde_json::json!({ "origin": remote.origin }),
            );
        }

        let mut stats = merged.stats;
        stats.duration_micros = started.elapsed().as_micros() as u64;

        tracing::debug!(
            entity_id = %self.id,
            origin = %remote.origin,
            local_changed = merged.local_changed,
            conflicts = merged.conflicts.len(),
            "Merged pattern state"
        );

        Ok(MergeResult {
            success: true,
            state: self.state(),
            local_changed: merged.local_changed,
            conflicts: merged.conflicts,
            stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ClockOrdering;
    use crate::state::ConflictResolution;
    use crate::time::ManualClock;
    use serde_json::json;
    use std::sync::Arc;

    fn pattern(replica: &str, wall: &ManualClock) -> PatternCrdt {
        PatternCrdt::with_clock(
            "p1",
            replica,
            PatternInit::new("initial")
                .with_type("unit-test")
                .with_category("api")
                .with_domain("payments"),
            Arc::new(wall.clone()),
        )
    }

    #[test]
    fn new_pattern_exposes_initial_fields() {
        let wall = ManualClock::new(1000);
        let p = PatternCrdt::with_clock(
            "p1",
            "r1",
            PatternInit::new("body")
                .with_type("integration")
                .with_tag("fast")
                .with_metadata("framework", json!("jest")),
            Arc::new(wall),
        );
        let data = p.get_data();
        assert_eq!(data.id, "p1");
        assert_eq!(data.content, "body");
        assert_eq!(data.pattern_type, "integration");
        assert_eq!(data.tags, vec!["fast".to_string()]);
        assert_eq!(data.metadata.get("framework"), Some(&json!("jest")));
        assert_eq!(data.usage_count, 0);
        assert_eq!(data.last_modified, 1000);
    }

    #[test]
    fn mutators_advance_clock_and_sequence() {
        let wall = ManualClock::new(1000);
        let mut p = pattern("r1", &wall);
        let seq = p.sequence_number();
        let before = p.clock().clone();

        wall.advance(5);
        p.set_content("new");
        p.add_tag("a");
        p.increment_usage(2);

        assert_eq!(p.sequence_number(), seq + 3);
        assert!(p.clock().happened_after(&before));
        assert_eq!(p.last_modified(), 1005);
        assert_eq!(p.get_content(), "new");
        assert_eq!(p.get_usage_count(), 2);
    }

    #[test]
    fn history_is_bounded() {
        let wall = ManualClock::new(0);
        let mut p = pattern("r1", &wall).with_max_history(3);
        for i in 0..5 {
            p.set_content(format!("v{i}"));
        }
        let history: Vec<_> = p.history().collect();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].detail, json!("v2"));
        assert_eq!(history[2].kind, ModificationKind::SetContent);
    }

    #[test]
    fn default_history_bound() {
        let wall = ManualClock::new(0);
        let mut p = pattern("r1", &wall);
        for i in 0..(DEFAULT_MAX_HISTORY + 20) {
            p.increment_usage(i as u64);
        }
        assert_eq!(p.history().count(), DEFAULT_MAX_HISTORY);
    }

    #[test]
    fn metadata_keys_resolve_independently() {
        let wall = ManualClock::new(1000);
        let mut r1 = pattern("r1", &wall);
        let mut r2 = pattern("r2", &wall);

        r1.set_metadata("owner", json!("alice"));
        wall.advance(10);
        r2.set_metadata("owner", json!("bob"));
        r2.set_metadata("language", json!("rust"));

        r1.merge(&r2.state()).unwrap();
        r2.merge(&r1.state()).unwrap();

        assert_eq!(r1.get_metadata("owner"), Some(&json!("bob")));
        assert_eq!(r1.get_metadata("language"), Some(&json!("rust")));
        assert_eq!(r1.metadata_entries(), r2.metadata_entries());
    }

    #[test]
    fn removed_metadata_reads_as_absent() {
        let wall = ManualClock::new(0);
        let mut p = pattern("r1", &wall);
        p.set_metadata("k", json!(1));
        assert!(p.remove_metadata("k"));
        assert!(!p.remove_metadata("k"));
        assert_eq!(p.get_metadata("k"), None);
        assert!(p.get_data().metadata.is_empty());
    }

    #[test]
    fn removing_absent_tag_leaves_no_trace() {
        let wall = ManualClock::new(0);
        let mut p = pattern("r1", &wall);
        let clock = p.clock().clone();
        let sequence = p.sequence_number();
        let recorded = p.history().count();

        assert!(!p.remove_tag("missing"));
        assert_eq!(p.clock(), &clock);
        assert_eq!(p.sequence_number(), sequence);
        assert_eq!(p.history().count(), recorded);
        assert!(p.delta_since(&clock).is_none());

        p.add_tag("t");
        assert!(p.remove_tag("t"));
        assert!(!p.remove_tag("t"));
        assert_eq!(p.sequence_number(), sequence + 2);
    }

    #[test]
    fn quality_and_sharing_are_single_units() {
        let wall = ManualClock::new(1000);
        let mut r1 = pattern("r1", &wall);
        let mut r2 = pattern("r2", &wall);

        wall.advance(1);
        r1.set_quality(QualityMetrics {
            level: QualityLevel::High,
            success_rate: 0.9,
            ..QualityMetrics::default()
        });
        wall.advance(1);
        r2.set_quality(QualityMetrics {
            unique_users: 12,
            ..QualityMetrics::default()
        });
        r2.set_sharing_config(SharingConfig {
            policy: SharingPolicy::Team,
            privacy: PrivacyLevel::Balanced,
            redistributable: true,
        });

        let result = r1.merge(&r2.state()).unwrap();
        assert!(result.local_changed);
        // Whole struct from the later writer, no field-level blending.
        assert_eq!(r1.get_quality().unique_users, 12);
        assert_eq!(r1.get_quality().level, QualityLevel::Low);
        assert_eq!(r1.get_sharing_config().policy, SharingPolicy::Team);
        let quality = result
            .conflicts
            .iter()
            .find(|c| c.field == "p1-quality")
            .unwrap();
        assert_eq!(quality.resolution, ConflictResolution::RemoteWins);
        assert_eq!(quality.local_value["level"], json!("high"));
        assert_eq!(quality.remote_value["uniqueUsers"], json!(12));

        let last = r2.history().last().unwrap();
        assert_eq!(last.kind, ModificationKind::SetSharingConfig);
        assert_eq!(last.detail["policy"], json!("team"));
    }

    #[test]
    fn merge_rejects_other_entity_and_type() {
        let wall = ManualClock::new(0);
        let mut p = pattern("r1", &wall);
        let other = PatternCrdt::with_clock("p2", "r2", PatternInit::default(), Arc::new(wall));
        assert!(matches!(p.merge(&other.state()), Err(Error::InvalidState(_))));

        let mut state = p.state();
        state.crdt_type = CrdtType::GCounter;
        assert!(matches!(p.merge(&state), Err(Error::InvalidType { .. })));
    }

    #[test]
    fn failed_merge_is_partial_and_recorded() {
        let wall = ManualClock::new(1000);
        let mut local = pattern("r1", &wall);
        let mut remote = pattern("r2", &wall);
        wall.advance(10);
        remote.set_content("remote content");
        remote.increment_usage(4);

        let mut state = remote.state();
        state.value.tags.id = "p1-bogus".to_string();

        let clock_before = local.clock().clone();
        let err = local.merge(&state).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));

        // Fields before the tags were merged, fields after were not.
        assert_eq!(local.get_content(), "remote content");
        assert_eq!(local.get_usage_count(), 0);
        assert_eq!(local.clock().compare(&clock_before), ClockOrdering::Equal);
        let last = local.history().last().unwrap();
        assert_eq!(last.kind, ModificationKind::MergeFailed);

        // Retrying with a well-formed state completes the merge.
        local.merge(&remote.state()).unwrap();
        assert_eq!(local.get_usage_count(), 4);
    }

    #[test]
    fn delta_is_none_until_advanced() {
        let wall = ManualClock::new(0);
        let mut p = pattern("r1", &wall);
        let since = p.clock().clone();
        assert!(p.delta_since(&since).is_none());

        p.add_tag("x");
        let delta = p.delta_since(&since).unwrap();
        assert_eq!(delta.crdt_id, "p1");
        assert_eq!(delta.crdt_type, CrdtType::Pattern);
        assert_eq!(delta.operations.len(), 1);
        assert_eq!(delta.sequence_number, p.sequence_number());
    }

    #[test]
    fn delta_application_matches_full_merge() {
        let wall = ManualClock::new(0);
        let mut r1 = pattern("r1", &wall);
        let mut r2 = pattern("r2", &wall);
        let since = r2.clock().clone();

        wall.advance(3);
        r2.add_tag("from-r2");
        r2.increment_usage(7);

        let delta = r2.delta_since(&since).unwrap();
        let json = delta.to_json().unwrap();
        let delta = CrdtDelta::<PatternValue>::from_json(&json).unwrap();
        let result = r1.apply_delta(&delta).unwrap();
        assert!(result.local_changed);
        assert!(r1.has_tag("from-r2"));
        assert_eq!(r1.get_usage_count(), 7);
    }

    #[test]
    fn try_clone_roundtrips_through_wire_format() {
        let wall = ManualClock::new(0);
        let mut p = pattern("r1", &wall);
        p.add_tag("a");
        p.set_metadata("k", json!({"nested": [1, 2]}));
        p.increment_usage(3);

        let mut copy = p.try_clone().unwrap();
        assert_eq!(copy.get_data(), p.get_data());
        assert_eq!(copy.history().count(), 0);

        let result = copy.merge(&p.state()).unwrap();
        assert!(!result.local_changed);
        assert_eq!(copy.clock().compare(p.clock()), ClockOrdering::Equal);
    }

    #[test]
    fn from_state_rejects_mismatched_sub_ids() {
        let wall = ManualClock::new(0);
        let p = pattern("r1", &wall);
        let mut state = p.state();
        state.value.usage_count.id = "other-usageCount".into();
        let err = PatternCrdt::from_state(state, "r1", Arc::new(wall)).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[test]
    fn gc_collects_tag_tombstones_once_stable() {
        let wall = ManualClock::new(0);
        let mut p = pattern("r1", &wall);
        p.add_tag("temp");
        p.remove_tag("temp");
        assert_eq!(p.tombstone_count(), 1);
        assert_eq!(p.collect_garbage(), 1);
        assert_eq!(p.tombstone_count(), 0);
        assert!(!p.has_tag("temp"));
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Mutation {
            Content(u8),
            AddTag(u8),
            RemoveTag(u8),
            Usage(u8),
            Meta(u8, u8),
            Tick(u8),
        }

        fn arb_mutation() -> impl Strategy<Value = Mutation> {
            prop_oneof![
                (0u8..4).prop_map(Mutation::Content),
                (0u8..4).prop_map(Mutation::AddTag),
                (0u8..4).prop_map(Mutation::RemoveTag),
                (0u8..10).prop_map(Mutation::Usage),
                (0u8..3, 0u8..4).prop_map(|(k, v)| Mutation::Meta(k, v)),
                (0u8..5).prop_map(Mutation::Tick),
            ]
        }

        fn replica(name: &str, muts: &[Mutation]) -> PatternCrdt {
            let wall = ManualClock::new(1000);
            let mut p = PatternCrdt::with_clock(
                "p1",
                name,
                PatternInit::new("seed"),
                Arc::new(wall.clone()),
            );
            for m in muts {
                match m {
                    Mutation::Content(v) => p.set_content(format!("c{v}")),
                    Mutation::AddTag(t) => p.add_tag(format!("t{t}")),
                    Mutation::RemoveTag(t) => {
                        p.remove_tag(&format!("t{t}"));
                    }
                    Mutation::Usage(n) => {
                        p.increment_usage(*n as u64);
                    }
                    Mutation::Meta(k, v) => p.set_metadata(format!("k{k}"), json!(v)),
                    Mutation::Tick(ms) => wall.advance(*ms as u64),
                }
            }
            p
        }

        fn arb_mutations() -> impl Strategy<Value = Vec<Mutation>> {
            proptest::collection::vec(arb_mutation(), 0..12)
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]

            #[test]
            fn prop_pattern_merge_converges(
                ma in arb_mutations(),
                mb in arb_mutations(),
                mc in arb_mutations(),
            ) {
                let a = replica("r1", &ma);
                let b = replica("r2", &mb);
                let c = replica("r3", &mc);

                let mut ab = a.try_clone().unwrap();
                ab.merge(&b.state()).unwrap();
                let mut ba = b.try_clone().unwrap();
                ba.merge(&a.state()).unwrap();
                prop_assert_eq!(ab.get_data(), ba.get_data());

                let mut ab_c = ab.try_clone().unwrap();
                ab_c.merge(&c.state()).unwrap();
                let mut bc = b.try_clone().unwrap();
                bc.merge(&c.state()).unwrap();
                let mut a_bc = a.try_clone().unwrap();
                a_bc.merge(&bc.state()).unwrap();
                prop_assert_eq!(ab_c.get_data(), a_bc.get_data());

                let mut aa = a.try_clone().unwrap();
                let result = aa.merge(&a.state()).unwrap();
                prop_assert!(!result.local_changed);
                prop_assert_eq!(aa.get_data(), a.get_data());
            }
        }
    }
}
