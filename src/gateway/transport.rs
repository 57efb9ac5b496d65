//! Physical transport to the daemon
//!
//! `Transport` sends one batch and returns one value per call. The HTTP
//! implementation speaks JSON-RPC `system.multicall`; tests substitute a
//! scripted in-memory transport.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::protocol::{decode_multicall, encode_multicall, MethodCall};
use crate::error::{MirrorError, Result};

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a batch, returning one result per call in order
    async fn send(&self, batch: &[MethodCall]) -> Result<Vec<Value>>;
}

/// JSON-RPC over HTTP
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    next_id: AtomicU64,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, batch: &[MethodCall]) -> Result<Vec<Value>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = encode_multicall(id, batch);

        let response = self.client.post(&self.endpoint).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(MirrorError::Transport {
                message: format!("{} returned HTTP {}", self.endpoint, status),
            });
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| MirrorError::MalformedResponse {
                message: e.to_string(),
            })?;
        decode_multicall(payload, batch.len())
    }
}
