//! Binary transport: length-delimited MessagePack frames over TCP.
//!
//! Each call opens a connection, sends one request frame and reads one
//! response frame. Connect and request phases carry their own timeouts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, warn};

use super::{StoreClient, StoreError, TransportMode};

/// Largest frame either side accepts
const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Request frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BinaryRequest {
    Ping,
    Get { key: String },
    Put { key: String, value: Value },
    Append { key: String, value: Value },
}

/// Response frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BinaryResponse {
    Ok { value: Option<Value> },
    NotFound,
    Error { message: String },
}

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_BYTES)
        .new_codec()
}

/// Client for the binary transport
#[derive(Debug, Clone)]
pub struct BinaryStoreClient {
    /// host:port
    endpoint: String,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl BinaryStoreClient {
    pub fn new(
        endpoint: impl Into<String>,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            connect_timeout,
            request_timeout,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn call(&self, request: &BinaryRequest) -> Result<BinaryResponse, StoreError> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(&self.endpoint))
            .await
            .map_err(|_| StoreError::Timeout(self.connect_timeout))?
            .map_err(|e| {
                StoreError::Unavailable(format!("connect to {} failed: {}", self.endpoint, e))
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(endpoint = %self.endpoint, error = %e, "could not disable Nagle on store connection");
        }

        let payload =
            rmp_serde::to_vec_named(request).map_err(|e| StoreError::Codec(e.to_string()))?;
        let mut framed = Framed::new(stream, codec());

        let frame = timeout(self.request_timeout, async {
            framed.send(Bytes::from(payload)).await?;
            framed.next().await.transpose()
        })
        .await
        .map_err(|_| StoreError::Timeout(self.request_timeout))?
        .map_err(|e| StoreError::Unavailable(format!("binary transport I/O error: {}", e)))?
        .ok_or_else(|| {
            StoreError::Unavailable("connection closed before a response arrived".to_string())
        })?;

        rmp_serde::from_slice(&frame).map_err(|e| StoreError::Codec(e.to_string()))
    }

    fn expect_ok(key: &str, response: BinaryResponse) -> Result<Option<Value>, StoreError> {
        match response {
            BinaryResponse::Ok { value } => Ok(value),
            BinaryResponse::NotFound => Err(StoreError::NotFound(key.to_string())),
            BinaryResponse::Error { message } => Err(StoreError::Rejected(message)),
        }
    }
}

#[async_trait]
impl StoreClient for BinaryStoreClient {
    fn transport(&self) -> TransportMode {
        TransportMode::Binary
    }

    async fn put(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        let request = BinaryRequest::Put {
            key: key.to_string(),
            value: value.clone(),
        };
        Self::expect_ok(key, self.call(&request).await?).map(|_| ())
    }

    async fn get(&self, key: &str) -> Result<Value, StoreError> {
        let request = BinaryRequest::Get {
            key: key.to_string(),
        };
        Self::expect_ok(key, self.call(&request).await?)?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn append(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        let request = BinaryRequest::Append {
            key: key.to_string(),
            value: value.clone(),
        };
        Self::expect_ok(key, self.call(&request).await?).map(|_| ())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Self::expect_ok("", self.call(&BinaryRequest::Ping).await?).map(|_| ())
    }
}

/// Serve the binary protocol on `listener`, backed by `backing`.
///
/// Used by `stagecoach serve-store` for local development and by the
/// transport tests. Runs until the listener fails.
pub async fn serve(listener: TcpListener, backing: Arc<dyn StoreClient>) -> std::io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let backing = Arc::clone(&backing);

        tokio::spawn(async move {
            debug!(%peer, "binary store connection accepted");
            if let Err(e) = serve_connection(stream, backing).await {
                warn!(%peer, error = %e, "binary store connection failed");
            }
        });
    }
}

async fn serve_connection(
    stream: TcpStream,
    backing: Arc<dyn StoreClient>,
) -> std::io::Result<()> {
    let mut framed = Framed::new(stream, codec());

    while let Some(frame) = framed.next().await {
        let frame = frame?;
        let response = match rmp_serde::from_slice::<BinaryRequest>(&frame) {
            Ok(request) => dispatch(backing.as_ref(), request).await,
            Err(e) => BinaryResponse::Error {
                message: format!("malformed request: {}", e),
            },
        };

        let payload = rmp_serde::to_vec_named(&response)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        framed.send(Bytes::from(payload)).await?;
    }

    Ok(())
}

async fn dispatch(backing: &dyn StoreClient, request: BinaryRequest) -> BinaryResponse {
    let result = match request {
        BinaryRequest::Ping => backing.ping().await.map(|_| None),
        BinaryRequest::Get { key } => backing.get(&key).await.map(Some),
        BinaryRequest::Put { key, value } => backing.put(&key, &value).await.map(|_| None),
        BinaryRequest::Append { key, value } => {
            backing.append(&key, &value).await.map(|_| None)
        }
    };

    match result {
        Ok(value) => BinaryResponse::Ok { value },
        Err(StoreError::NotFound(_)) => BinaryResponse::NotFound,
        Err(e) => BinaryResponse::Error {
            message: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    async fn spawn_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(serve(listener, Arc::new(MemoryStore::new())));
        addr
    }

    fn client(endpoint: String) -> BinaryStoreClient {
        BinaryStoreClient::new(endpoint, Duration::from_secs(1), Duration::from_secs(1))
    }

    #[test]
    fn test_frames_encode_as_messagepack() {
        let request = BinaryRequest::Put {
            key: "runs/a".to_string(),
            value: json!({"status": "running", "stage": 2}),
        };

        let bytes = rmp_serde::to_vec_named(&request).unwrap();
        let decoded: BinaryRequest = rmp_serde::from_slice(&bytes).unwrap();

        assert_eq!(decoded, request);
    }

    #[tokio::test]
    async fn test_put_get_append_over_tcp() {
        let client = client(spawn_server().await);

        client.ping().await.unwrap();
        client.put("runs/a", &json!({"status": "running"})).await.unwrap();
        assert_eq!(client.get("runs/a").await.unwrap()["status"], "running");

        client.append("runs/index", &json!("a")).await.unwrap();
        client.append("runs/index", &json!("b")).await.unwrap();
        assert_eq!(client.get("runs/index").await.unwrap(), json!(["a", "b"]));
    }

    #[tokio::test]
    async fn test_missing_key_is_not_found() {
        let client = client(spawn_server().await);

        let err = client.get("runs/missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_unavailable() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = client(addr).ping().await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Unavailable(_) | StoreError::Timeout(_)
        ));
    }
}
