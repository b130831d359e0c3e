//! Content-addressed snapshot storage.
//!
//! [`PinningPublisher`] talks to a JSON pinning service; [`MemoryPublisher`]
//! keeps documents in process and is used when no pinning endpoint is
//! configured.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::types::SnapshotRef;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("pinning request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("pinning service rejected the document ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("unexpected pinning response: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait SnapshotPublisher: Send + Sync {
    /// Store `document` under a human-readable `name` and return its reference.
    async fn publish(&self, name: &str, document: &Value) -> Result<SnapshotRef, PublishError>;
}

fn snapshot_ref(content_id: String, gateway_host: Option<&str>) -> SnapshotRef {
    SnapshotRef {
        uri: format!("ipfs://{content_id}"),
        gateway_url: gateway_host.map(|host| format!("https://{content_id}.ipfs.{host}")),
        content_id,
    }
}

// ─────────────────────────────────────────────────────────
// Pinning service
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct PinResponse {
    #[serde(rename = "IpfsHash")]
    ipfs_hash: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PinningPublisher {
    client: Client,
    api_url: String,
    jwt: Option<String>,
    gateway_host: Option<String>,
}

impl PinningPublisher {
    pub fn new(
        client: Client,
        api_url: impl Into<String>,
        jwt: Option<String>,
        gateway_host: Option<String>,
    ) -> Self {
        Self {
            client,
            api_url: api_url.into(),
            jwt,
            gateway_host,
        }
    }
}

#[async_trait]
impl SnapshotPublisher for PinningPublisher {
    async fn publish(&self, name: &str, document: &Value) -> Result<SnapshotRef, PublishError> {
        let mut request = self.client.post(&self.api_url).json(&json!({
            "pinataContent": document,
            "pinataMetadata": { "name": name },
        }));
        if let Some(jwt) = &self.jwt {
            request = request.bearer_auth(jwt);
        }

        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(%status, name, "Pinning service rejected snapshot");
            return Err(PublishError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let body: PinResponse = resp.json().await?;
        let cid = body
            .ipfs_hash
            .filter(|h| !h.trim().is_empty())
            .ok_or_else(|| PublishError::Malformed("missing IpfsHash".to_string()))?;

        info!(name, cid = %cid, "Snapshot pinned");
        Ok(snapshot_ref(cid, self.gateway_host.as_deref()))
    }
}

// ─────────────────────────────────────────────────────────
// In-process store
// ─────────────────────────────────────────────────────────

/// Content ids are the hex SHA-256 of the serialized document.
#[derive(Debug, Default)]
pub struct MemoryPublisher {
    documents: Mutex<HashMap<String, Value>>,
    publishes: AtomicUsize,
    gateway_host: Option<String>,
}

impl MemoryPublisher {
    pub fn new(gateway_host: Option<String>) -> Self {
        Self {
            gateway_host,
            ..Default::default()
        }
    }

    /// Number of `publish` calls served so far.
    pub fn publish_count(&self) -> usize {
        self.publishes.load(Ordering::SeqCst)
    }

    pub fn get(&self, content_id: &str) -> Option<Value> {
        self.documents
            .lock()
            .ok()
            .and_then(|docs| docs.get(content_id).cloned())
    }
}

pub fn content_id(document: &Value) -> String {
    hex::encode(Sha256::digest(document.to_string().as_bytes()))
}

#[async_trait]
impl SnapshotPublisher for MemoryPublisher {
    async fn publish(&self, name: &str, document: &Value) -> Result<SnapshotRef, PublishError> {
        let cid = content_id(document);
        self.documents
            .lock()
            .map_err(|_| PublishError::Malformed("snapshot map poisoned".to_string()))?
            .insert(cid.clone(), document.clone());
        self.publishes.fetch_add(1, Ordering::SeqCst);
        debug!(name, cid = %cid, "Snapshot kept in memory");
        Ok(snapshot_ref(cid, self.gateway_host.as_deref()))
    }
}
