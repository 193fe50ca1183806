//! # Patternsync Engine
//!
//! A CRDT layer that lets independent peers share a pool of "patterns" and
//! converge to the same state without a central coordinator.
//!
//! Peers exchange full states or deltas in any order, any number of times.
//! Every merge is commutative, associative and idempotent, so all replicas
//! that have seen the same set of updates hold the same value.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine knows nothing about files, sockets or rooms
//! - **Deterministic**: the same inputs and wall clock give the same outputs
//! - **Single writer**: one replica owns its store; hosts add a mutex if needed
//!
//! ## Core Concepts
//!
//! ### Vector clocks
//!
//! [`VectorClock`] tracks causality per replica and classifies two histories
//! as equal, ordered or concurrent. Wall time is only a tie-breaker.
//!
//! ### Primitive CRDTs
//!
//! - [`GCounter`] - grow-only counter, merge by per-replica max
//! - [`LwwRegister`] - last-writer-wins register keyed on `(timestamp, replica)`
//! - [`OrSet`] - observed-remove set where concurrent add beats remove
//!
//! ### Patterns
//!
//! [`PatternCrdt`] composes the primitives: one register per scalar field
//! and per metadata key, an OR-Set of tags and a usage counter. Each field is
//! resolved independently on merge.
//!
//! ### Store
//!
//! [`CrdtStore`] owns every entity of one replica, routes incoming states
//! and deltas by entity ID and generates deltas for a peer.
//!
//! ## Quick Start
//!
//! ```rust
//! use patternsync_engine::{CrdtStore, PatternInit, StoreConfig};
//!
//! let mut r1 = CrdtStore::new(StoreConfig::new("r1"));
//! let mut r2 = CrdtStore::new(StoreConfig::new("r2"));
//!
//! r1.create_pattern("p1", PatternInit::new("retry on 503")).unwrap()
//!     .add_tag("http");
//!
//! // r2 reports what it has seen of each entity; r1 ships the rest.
//! let cursors = r2.clocks();
//! for delta in r1.generate_deltas_from(&cursors).unwrap() {
//!     let wire = delta.to_json().unwrap();
//!     r2.apply_delta(patternsync_engine::AnyDelta::from_json(&wire).unwrap()).unwrap();
//! }
//!
//! let pattern = r2.pattern("p1").unwrap();
//! assert_eq!(pattern.get_content(), "retry on 503");
//! assert_eq!(pattern.get_tags(), vec!["http".to_string()]);
//! ```
//!
//! ## Persistence
//!
//! Use [`CrdtStore::export_snapshot`] and [`CrdtStore::import_snapshot`] with
//! [`StoreSnapshot`], or [`CrdtStore::save_to`] / [`CrdtStore::load_from`]
//! with any [`StateStorage`]. Both are serialized with deterministic ordering.

pub mod clock;
pub mod config;
pub mod error;
pub mod gcounter;
pub mod lww;
pub mod orset;
pub mod pattern;
pub mod snapshot;
pub mod state;
pub mod storage;
pub mod store;
pub mod time;

// Re-export main types at crate root
pub use clock::{ClockOrdering, VectorClock, VectorClockState, MAX_CLOCK_ENTRIES};
pub use config::{ConfigError, StoreConfig};
pub use error::{Error, Result};
pub use gcounter::{GCounter, GCounterValue};
pub use lww::{LwwRegister, LwwValue};
pub use orset::{OrSet, OrSetValue, Token};
pub use pattern::{
    ModificationEntry, ModificationKind, PatternCrdt, PatternData, PatternInit, PatternValue,
    PrivacyLevel, QualityLevel, QualityMetrics, SharingConfig, SharingPolicy,
    DEFAULT_MAX_HISTORY,
};
pub use snapshot::{SnapshotMetadata, StoreSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use state::{
    AnyDelta, AnyState, ConflictInfo, ConflictResolution, CrdtDelta, CrdtState, CrdtType,
    DeltaOperation, MergeResult, MergeStats, Replicated, StateMetadata, STATE_VERSION,
};
pub use storage::{MemoryStorage, StateStorage};
pub use store::{Crdt, CrdtStore, SharedStore, SyncReport};
pub use time::{ManualClock, SharedWallClock, SystemClock, WallClock};

/// Type aliases for clarity
pub type ReplicaId = String;
pub type EntityId = String;
pub type Timestamp = u64;
pub type LogicalTime = u64;
