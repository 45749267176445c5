//! Durable store clients.
//!
//! The remote store is reachable over two transports: a framed binary
//! protocol over TCP and a JSON-over-HTTP API. Both sit behind the
//! [`StoreClient`] trait so the rest of the orchestrator never sees which
//! one is in use. Which transport to use is decided by the probe in
//! [`crate::core::probe`] and applied by [`StoreClientFactory`].

pub mod binary;
pub mod factory;
pub mod http;
pub mod memory;
pub mod offline;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use binary::BinaryStoreClient;
pub use factory::StoreClientFactory;
pub use http::HttpStoreClient;
pub use memory::MemoryStore;
pub use offline::OfflineStore;

/// Transport used to reach the durable store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// Length-delimited MessagePack frames over TCP
    Binary,

    /// JSON over HTTP
    Text,

    /// No viable transport; callers fall back to in-memory state
    Degraded,
}

impl TransportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Binary => "binary",
            Self::Text => "text",
            Self::Degraded => "degraded",
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Store-level failures. Never crosses the checkpoint or approval boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store rejected request: {0}")]
    Rejected(String),

    #[error("store payload could not be encoded: {0}")]
    Codec(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Uniform key/value interface over the selected transport.
///
/// Writes to a single key are atomic: a reader sees the old value or the
/// new value, never a partial write.
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Transport this client speaks
    fn transport(&self) -> TransportMode;

    /// Write `value` under `key`, replacing any previous value
    async fn put(&self, key: &str, value: &Value) -> Result<(), StoreError>;

    /// Read the value under `key`
    async fn get(&self, key: &str) -> Result<Value, StoreError>;

    /// Append `value` to the JSON array stored under `key`
    async fn append(&self, key: &str, value: &Value) -> Result<(), StoreError>;

    /// Short round trip used by the transport probe
    async fn ping(&self) -> Result<(), StoreError>;
}

pub type SharedStore = Arc<dyn StoreClient>;

/// Key layout of the durable store
pub mod keys {
    use uuid::Uuid;

    pub fn checkpoint(run_id: Uuid, stage_index: usize) -> String {
        format!("checkpoints/{}/{:06}", run_id, stage_index)
    }

    pub fn latest_checkpoint(run_id: Uuid) -> String {
        format!("checkpoints/{}/latest", run_id)
    }

    pub fn run_record(run_id: Uuid) -> String {
        format!("runs/{}", run_id)
    }

    pub const RUN_INDEX: &str = "runs/index";

    pub fn approval(run_id: Uuid) -> String {
        format!("approvals/{}", run_id)
    }
}
