//! Text transport: JSON over HTTP.
//!
//! Endpoints (relative to the configured base URL):
//! - `GET /v1/health`
//! - `GET /v1/kv/<key>` / `PUT /v1/kv/<key>`
//! - `POST /v1/kv/<key>/append`

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::Value;

use super::{StoreClient, StoreError, TransportMode};

/// Client for the HTTP/JSON transport
#[derive(Debug, Clone)]
pub struct HttpStoreClient {
    base_url: String,
    client: Client,
    request_timeout: Duration,
}

impl HttpStoreClient {
    /// Create a client with explicit connect and request timeouts
    pub fn new(
        base_url: impl Into<String>,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(|e| StoreError::Unavailable(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            request_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn kv_url(&self, key: &str) -> String {
        format!("{}/v1/kv/{}", self.base_url, key.trim_start_matches('/'))
    }

    async fn send(&self, key: &str, request: RequestBuilder) -> Result<reqwest::Response, StoreError> {
        let response = request.send().await.map_err(|e| self.translate(e))?;
        let status = response.status();

        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let detail = if body.is_empty() {
            status.to_string()
        } else {
            format!("{}: {}", status, body.trim())
        };

        Err(match status {
            StatusCode::NOT_FOUND => StoreError::NotFound(key.to_string()),
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
                StoreError::Unavailable(detail)
            }
            s if s.is_server_error() => StoreError::Unavailable(detail),
            _ => StoreError::Rejected(detail),
        })
    }

    fn translate(&self, error: reqwest::Error) -> StoreError {
        if error.is_timeout() {
            StoreError::Timeout(self.request_timeout)
        } else if error.is_decode() {
            StoreError::Codec(error.to_string())
        } else {
            StoreError::Unavailable(error.to_string())
        }
    }
}

#[async_trait]
impl StoreClient for HttpStoreClient {
    fn transport(&self) -> TransportMode {
        TransportMode::Text
    }

    async fn put(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        self.send(key, self.client.put(self.kv_url(key)).json(value))
            .await
            .map(|_| ())
    }

    async fn get(&self, key: &str) -> Result<Value, StoreError> {
        let response = self.send(key, self.client.get(self.kv_url(key))).await?;
        response.json::<Value>().await.map_err(|e| self.translate(e))
    }

    async fn append(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        let url = format!("{}/append", self.kv_url(key));
        self.send(key, self.client.post(url).json(value))
            .await
            .map(|_| ())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let url = format!("{}/v1/health", self.base_url);
        self.send("health", self.client.get(url)).await.map(|_| ())
    }
}
