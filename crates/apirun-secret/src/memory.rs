//! In-memory secret store.

use std::collections::HashMap;
use std::sync::RwLock;

use apirun_error::HostError;

use crate::{SecretKey, SecretStore};

/// Ephemeral secret store. Nothing outlives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored secrets.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Whether the store holds no secrets.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SecretStore for MemoryStore {
    fn set(&self, key: &SecretKey, value: &str) -> Result<(), HostError> {
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get(&self, key: &SecretKey) -> Result<String, HostError> {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&key.to_string())
            .cloned()
            .ok_or_else(|| key.not_found())
    }

    // Missing keys are a no-op.
    fn delete(&self, key: &SecretKey) -> Result<(), HostError> {
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&key.to_string());
        Ok(())
    }
}
