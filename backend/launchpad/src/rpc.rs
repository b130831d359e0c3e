//! JSON-RPC client for the ledger deployment gateway.
//!
//! ## Resilience
//!
//! * Reads (`creationFee`, receipts, `projectById`, token metadata) back off
//!   exponentially on transport errors, rate limiting and soft RPC errors, up
//!   to [`MAX_BACKOFF_SECS`] between attempts and [`MAX_READ_ATTEMPTS`] in total.
//! * `createProject` is sent exactly once. A failed broadcast is reported to
//!   the caller, who decides whether to resubmit.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::ledger::{LedgerError, LedgerFactory, TokenMetadataReader, TxReceipt};
use crate::params::DeploymentParams;
use crate::signer::WalletSigner;

const MAX_BACKOFF_SECS: u64 = 60;
const INITIAL_BACKOFF_SECS: u64 = 2;
const MAX_READ_ATTEMPTS: u32 = 5;

const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

// ─────────────────────────────────────────────────────────
// JSON-RPC response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

impl RpcError {
    /// Invalid request / unknown method / invalid params never succeed on retry.
    fn is_hard(&self) -> bool {
        matches!(self.code, -32600 | -32601 | -32602)
    }
}

fn request_body(method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": method,
        "params": params,
    })
}

/// Amounts arrive as decimal strings or, when small, JSON numbers.
fn parse_u128(value: &Value) -> Option<u128> {
    match value {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_u64().map(u128::from),
        _ => None,
    }
}

// ─────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct RpcLedger {
    client: Client,
    rpc_url: String,
    factory_address: String,
    signer: Arc<dyn WalletSigner>,
}

impl RpcLedger {
    pub fn new(
        client: Client,
        rpc_url: impl Into<String>,
        factory_address: impl Into<String>,
        signer: Arc<dyn WalletSigner>,
    ) -> Self {
        Self {
            client,
            rpc_url: rpc_url.into(),
            factory_address: factory_address.into(),
            signer,
        }
    }

    async fn call_once(&self, method: &str, params: Value) -> Result<Value, LedgerError> {
        let resp = self
            .client
            .post(&self.rpc_url)
            .json(&request_body(method, params))
            .send()
            .await?;
        let body: RpcResponse = resp.error_for_status()?.json().await?;
        match body.error {
            Some(err) => Err(LedgerError::Rpc {
                code: err.code,
                message: err.message,
            }),
            None => Ok(body.result),
        }
    }

    async fn call_with_backoff(&self, method: &str, params: Value) -> Result<Value, LedgerError> {
        let mut backoff = INITIAL_BACKOFF_SECS;
        let mut attempt = 1;

        loop {
            let response = self
                .client
                .post(&self.rpc_url)
                .json(&request_body(method, params.clone()))
                .send()
                .await;

            let retry_reason = match response {
                Err(e) => format!("request failed: {e}"),
                Ok(resp) if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS => {
                    "rate-limited".to_string()
                }
                Ok(resp) => {
                    let body: RpcResponse = resp.error_for_status()?.json().await?;
                    match body.error {
                        None => {
                            debug!(method, attempt, "RPC read succeeded");
                            return Ok(body.result);
                        }
                        Some(err) if err.is_hard() || attempt >= MAX_READ_ATTEMPTS => {
                            return Err(LedgerError::Rpc {
                                code: err.code,
                                message: err.message,
                            });
                        }
                        Some(err) => format!("soft error {}: {}", err.code, err.message),
                    }
                }
            };

            if attempt >= MAX_READ_ATTEMPTS {
                return Err(LedgerError::Malformed(format!(
                    "{method} gave up after {attempt} attempts: {retry_reason}"
                )));
            }
            warn!(method, attempt, "RPC {retry_reason} (will retry in {backoff}s)");
            tokio::time::sleep(Duration::from_secs(backoff)).await;
            backoff = (backoff * 2).min(MAX_BACKOFF_SECS);
            attempt += 1;
        }
    }

    /// Unsigned transaction handed to the signer.
    fn create_project_payload(&self, params: &DeploymentParams, fee: u128) -> Value {
        json!({
            "to": self.factory_address,
            "from": self.signer.address(),
            "value": fee.to_string(),
            "function": "createProject",
            "args": params,
        })
    }
}

#[async_trait]
impl LedgerFactory for RpcLedger {
    async fn creation_fee(&self) -> Result<u128, LedgerError> {
        let result = self
            .call_with_backoff("factory_creationFee", json!([self.factory_address]))
            .await?;
        parse_u128(&result)
            .ok_or_else(|| LedgerError::Malformed(format!("creation fee {result}")))
    }

    async fn submit_create_project(
        &self,
        params: &DeploymentParams,
        fee: u128,
    ) -> Result<String, LedgerError> {
        let payload = self.create_project_payload(params, fee);
        let signed = self.signer.sign_transaction(&payload).await?;

        let result = self
            .call_once("factory_createProject", json!([{ "signedTx": signed.raw }]))
            .await
            .map_err(|e| match e {
                LedgerError::Rpc { message, .. } => LedgerError::Rejected(message),
                other => other,
            })?;

        let tx_hash = result.as_str().map(str::to_string).unwrap_or(signed.hash);
        info!(tx_hash = %tx_hash, project_uri = %params.project_uri, "createProject broadcast");
        Ok(tx_hash)
    }

    async fn transaction_receipt(&self, tx_hash: &str) -> Result<Option<TxReceipt>, LedgerError> {
        let result = self
            .call_with_backoff("factory_getTransactionReceipt", json!([tx_hash]))
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        let mut receipt: TxReceipt = serde_json::from_value(result)
            .map_err(|e| LedgerError::Malformed(format!("receipt: {e}")))?;
        if receipt.tx_hash.is_empty() {
            receipt.tx_hash = tx_hash.to_string();
        }
        Ok(Some(receipt))
    }

    async fn project_by_id(&self, project_id: u64) -> Result<Option<String>, LedgerError> {
        let result = self
            .call_with_backoff(
                "factory_projectById",
                json!([self.factory_address, project_id.to_string()]),
            )
            .await?;
        Ok(result
            .as_str()
            .map(str::to_lowercase)
            .filter(|a| a != ZERO_ADDRESS))
    }
}

#[async_trait]
impl TokenMetadataReader for RpcLedger {
    async fn symbol(&self, token: &str) -> Result<String, LedgerError> {
        let result = self.call_with_backoff("token_symbol", json!([token])).await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| LedgerError::Malformed(format!("symbol {result}")))
    }

    async fn decimals(&self, token: &str) -> Result<u8, LedgerError> {
        let result = self.call_with_backoff("token_decimals", json!([token])).await?;
        parse_u128(&result)
            .and_then(|d| u8::try_from(d).ok())
            .ok_or_else(|| LedgerError::Malformed(format!("decimals {result}")))
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
