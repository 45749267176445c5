//! Process-local store.
//!
//! Used for `backend: memory` local runs and as a test double. Nothing
//! written here survives the process.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use super::{StoreClient, StoreError, TransportMode};

#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Keys currently stored, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl StoreClient for MemoryStore {
    fn transport(&self) -> TransportMode {
        // Reported as the text transport so checkpoints taken in local mode
        // look like ordinary durable writes.
        TransportMode::Text
    }

    async fn put(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        self.entries.write().insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Value, StoreError> {
        self.entries
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn append(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        let mut entries = self.entries.write();
        let slot = entries
            .entry(key.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));

        match slot {
            Value::Array(items) => {
                items.push(value.clone());
                Ok(())
            }
            _ => Err(StoreError::Rejected(format!(
                "key '{}' does not hold a list",
                key
            ))),
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
