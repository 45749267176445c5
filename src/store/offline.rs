//! Client handed out when the probe found no viable transport.

use async_trait::async_trait;
use serde_json::Value;

use super::{StoreClient, StoreError, TransportMode};

/// Fails every call so callers engage their in-memory fallback
#[derive(Debug, Default, Clone)]
pub struct OfflineStore;

impl OfflineStore {
    fn unavailable() -> StoreError {
        StoreError::Unavailable("no viable transport to the durable store".to_string())
    }
}

#[async_trait]
impl StoreClient for OfflineStore {
    fn transport(&self) -> TransportMode {
        TransportMode::Degraded
    }

    async fn put(&self, _key: &str, _value: &Value) -> Result<(), StoreError> {
        Err(Self::unavailable())
    }

    async fn get(&self, _key: &str) -> Result<Value, StoreError> {
        Err(Self::unavailable())
    }

    async fn append(&self, _key: &str, _value: &Value) -> Result<(), StoreError> {
        Err(Self::unavailable())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Err(Self::unavailable())
    }
}
