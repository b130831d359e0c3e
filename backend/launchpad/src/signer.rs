//! Wallet signing, delegated to a remote signer service.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("signer request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("signer refused ({status}): {body}")]
    Refused { status: u16, body: String },

    #[error("unexpected signer response: {0}")]
    Malformed(String),
}

/// A signed transaction ready for broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedTransaction {
    pub raw: String,
    pub hash: String,
}

#[async_trait]
pub trait WalletSigner: Send + Sync {
    /// Address every signature is produced for.
    fn address(&self) -> &str;

    /// Signature over an arbitrary message, hex encoded.
    async fn sign_message(&self, message: &[u8]) -> Result<String, SignerError>;

    async fn sign_transaction(&self, payload: &Value) -> Result<SignedTransaction, SignerError>;
}

#[derive(Debug, Deserialize)]
struct SignResponse {
    signature: Option<String>,
    raw: Option<String>,
    hash: Option<String>,
}

/// POSTs sign requests to `<url>/sign`.
#[derive(Debug, Clone)]
pub struct RemoteSigner {
    client: Client,
    url: String,
    address: String,
}

impl RemoteSigner {
    pub fn new(client: Client, url: &str, address: &str) -> Self {
        Self {
            client,
            url: format!("{}/sign", url.trim_end_matches('/')),
            address: address.trim().to_lowercase(),
        }
    }

    async fn request(&self, body: Value) -> Result<SignResponse, SignerError> {
        let resp = self.client.post(&self.url).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SignerError::Refused {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl WalletSigner for RemoteSigner {
    fn address(&self) -> &str {
        &self.address
    }

    async fn sign_message(&self, message: &[u8]) -> Result<String, SignerError> {
        let resp = self
            .request(json!({
                "address": self.address,
                "kind": "message",
                "payload": format!("0x{}", hex::encode(message)),
            }))
            .await?;
        resp.signature
            .ok_or_else(|| SignerError::Malformed("missing signature".to_string()))
    }

    async fn sign_transaction(&self, payload: &Value) -> Result<SignedTransaction, SignerError> {
        let resp = self
            .request(json!({
                "address": self.address,
                "kind": "transaction",
                "payload": payload,
            }))
            .await?;
        match (resp.raw, resp.hash) {
            (Some(raw), Some(hash)) => {
                debug!(hash = %hash, "Transaction signed");
                Ok(SignedTransaction { raw, hash })
            }
            _ => Err(SignerError::Malformed(
                "missing raw transaction or hash".to_string(),
            )),
        }
    }
}
