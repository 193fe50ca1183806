//! Configuration for a replica's CRDT store.

use crate::{pattern::DEFAULT_MAX_HISTORY, ReplicaId};
use std::env;

/// Store configuration, loadable from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Replica ID stamped on every entity this store creates
    pub replica_id: ReplicaId,
    /// Bound of each pattern's modification history
    pub max_history_size: usize,
    /// Run tombstone GC after every applied state or delta
    pub gc_on_merge: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            replica_id: uuid::Uuid::new_v4().to_string(),
            max_history_size: DEFAULT_MAX_HISTORY,
            gc_on_merge: false,
        }
    }
}

impl StoreConfig {
    /// Default configuration for a named replica.
    pub fn new(replica_id: impl Into<ReplicaId>) -> Self {
        Self {
            replica_id: replica_id.into(),
            ..Self::default()
        }
    }

    /// Load configuration from environment variables.
    ///
    /// - `PATTERNSYNC_REPLICA_ID` (default: random UUID v4)
    /// - `PATTERNSYNC_MAX_HISTORY` (default: 100)
    /// - `PATTERNSYNC_GC_ON_MERGE` (default: false)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let replica_id = lookup("PATTERNSYNC_REPLICA_ID")
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let max_history_size = match lookup("PATTERNSYNC_MAX_HISTORY") {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidNumber("PATTERNSYNC_MAX_HISTORY", raw))?,
            None => DEFAULT_MAX_HISTORY,
        };

        let gc_on_merge = match lookup("PATTERNSYNC_GC_ON_MERGE") {
            Some(raw) => parse_bool(&raw)
                .ok_or(ConfigError::InvalidBool("PATTERNSYNC_GC_ON_MERGE", raw))?,
            None => false,
        };

        Ok(Self {
            replica_id,
            max_history_size,
            gc_on_merge,
        })
    }

    pub fn with_max_history(mut self, max_history_size: usize) -> Self {
        self.max_history_size = max_history_size;
        self
    }

    pub fn with_gc_on_merge(mut self, gc_on_merge: bool) -> Self {
        self.gc_on_merge = gc_on_merge;
        self
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be a non-negative integer, got '{1}'")]
    InvalidNumber(&'static str, String),

    #[error("{0} must be a boolean, got '{1}'")]
    InvalidBool(&'static str, String),
}
