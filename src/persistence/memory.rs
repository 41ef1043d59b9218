//! In-memory stores.
//!
//! Used by tests and by `--mock-db` sessions, where nothing should touch
//! the user's keyring or state database.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{MetadataStore, SecretStore};
use crate::error::Result;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A [`SecretStore`] backed by a hash map.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    secrets: Mutex<HashMap<String, String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored secrets.
    pub fn len(&self) -> usize {
        lock(&self.secrets).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SecretStore for MemorySecretStore {
    fn store(&self, key: &str, secret: &str) -> Result<()> {
        lock(&self.secrets).insert(key.to_string(), secret.to_string());
        Ok(())
    }

    fn retrieve(&self, key: &str) -> Result<Option<String>> {
        Ok(lock(&self.secrets).get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<()> {
        lock(&self.secrets).remove(key);
        Ok(())
    }
}

/// A [`MetadataStore`] backed by an ordered map.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    entries: Mutex<BTreeMap<String, serde_json::Value>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored value serialized to text, for asserting on raw contents.
    pub fn dump(&self) -> String {
        lock(&self.entries)
            .iter()
            .map(|(key, value)| format!("{key}={value}\n"))
            .collect()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(lock(&self.entries).get(key).cloned())
    }

    async fn set(&self, key: &str, value: serde_json::Value) -> Result<()> {
        lock(&self.entries).insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        lock(&self.entries).remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(lock(&self.entries).keys().cloned().collect())
    }
}
