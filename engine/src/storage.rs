//! Persistence boundary.
//!
//! The engine does no IO itself. A host persists entities through any
//! key-value store that can hold an opaque string blob per entity ID.

use crate::error::{Error, Result};
use std::collections::BTreeMap;

/// A key-value store for serialized entity states.
pub trait StateStorage {
    /// Store `blob` under `key`, replacing any previous value.
    fn put(&mut self, key: &str, blob: String) -> Result<()>;

    /// Fetch the blob stored under `key`.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Delete `key`. Returns false if it was absent.
    fn delete(&mut self, key: &str) -> Result<bool>;

    /// All stored keys.
    fn keys(&self) -> Result<Vec<String>>;
}

/// In-memory [`StateStorage`], for tests and ephemeral replicas.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    blobs: BTreeMap<String, String>,
    read_only: bool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// A storage that rejects writes.
    pub fn read_only(self) -> Self {
        Self {
            read_only: true,
            ..self
        }
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::Storage("storage is read-only".into()));
        }
        Ok(())
    }
}

impl StateStorage for MemoryStorage {
    fn put(&mut self, key: &str, blob: String) -> Result<()> {
        self.ensure_writable()?;
        self.blobs.insert(key.to_string(), blob);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.blobs.get(key).cloned())
    }

    fn delete(&mut self, key: &str) -> Result<bool> {
        self.ensure_writable()?;
        Ok(self.blobs.remove(key).is_some())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.blobs.keys().cloned().collect())
    }
}
