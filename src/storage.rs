//! Persistent key/value storage boundary.
//!
//! Only navigation history is persisted. Callers treat storage as optional:
//! a missing backend or a failed write degrades prediction, never the cache.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::lock;

/// Synchronous string storage supplied by the host.
pub trait KeyValueStorage: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;
}

/// In-process storage, used when the host has nothing better.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.values).get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        lock(&self.values).insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_storage_round_trip() {
        let storage = MemoryStorage::new();
        assert!(storage.get("missing").is_none());

        storage.set("history", "[\"/a\"]").unwrap();
        assert_eq!(storage.get("history").as_deref(), Some("[\"/a\"]"));
    }
}
