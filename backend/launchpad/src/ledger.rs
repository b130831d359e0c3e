//! Ledger collaborators: the project factory and token metadata.
//!
//! The orchestrator only sees these traits; [`crate::rpc::RpcLedger`] is the
//! production implementation.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::params::DeploymentParams;
use crate::signer::SignerError;

/// Name of the factory log announcing a new project contract.
pub const PROJECT_CREATED_EVENT: &str = "ProjectCreated";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("ledger RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("submission rejected: {0}")]
    Rejected(String),

    #[error("transaction {0} reverted")]
    Reverted(String),

    #[error("unexpected ledger response: {0}")]
    Malformed(String),

    /// The named call did not answer within its deadline.
    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error(transparent)]
    Signer(#[from] SignerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    Success,
    Reverted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptLog {
    /// Emitting contract
    pub address: String,
    pub event: String,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxReceipt {
    pub tx_hash: String,
    pub status: ReceiptStatus,
    #[serde(default)]
    pub logs: Vec<ReceiptLog>,
}

/// Facts extracted from the factory's creation event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedProject {
    pub project_id: u64,
    pub contract_address: String,
}

#[async_trait]
pub trait LedgerFactory: Send + Sync {
    /// Fee in native base units required by `createProject`.
    async fn creation_fee(&self) -> Result<u128, LedgerError>;

    /// Sign and broadcast `createProject`. Returns the transaction hash as soon
    /// as the transaction is accepted for inclusion; never retried.
    async fn submit_create_project(
        &self,
        params: &DeploymentParams,
        fee: u128,
    ) -> Result<String, LedgerError>;

    /// `None` while the transaction is still pending.
    async fn transaction_receipt(&self, tx_hash: &str) -> Result<Option<TxReceipt>, LedgerError>;

    async fn project_by_id(&self, project_id: u64) -> Result<Option<String>, LedgerError>;

    /// Poll until the transaction is final. Callers bound the wait.
    async fn wait_for_receipt(
        &self,
        tx_hash: &str,
        poll_interval: Duration,
    ) -> Result<TxReceipt, LedgerError> {
        loop {
            if let Some(receipt) = self.transaction_receipt(tx_hash).await? {
                return Ok(receipt);
            }
            debug!(tx_hash, "Receipt pending");
            tokio::time::sleep(poll_interval).await;
        }
    }
}

#[async_trait]
pub trait TokenMetadataReader: Send + Sync {
    async fn symbol(&self, token: &str) -> Result<String, LedgerError>;
    async fn decimals(&self, token: &str) -> Result<u8, LedgerError>;
}

/// Locate the creation event emitted by `factory` in a successful receipt.
pub fn find_project_created(receipt: &TxReceipt, factory: &str) -> Option<CreatedProject> {
    receipt
        .logs
        .iter()
        .filter(|log| log.address.eq_ignore_ascii_case(factory))
        .filter(|log| log.event == PROJECT_CREATED_EVENT)
        .find_map(|log| decode_created(&log.data))
}

fn decode_created(data: &Value) -> Option<CreatedProject> {
    let project_id = match data.get("projectId")? {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.parse().ok()?,
        _ => return None,
    };
    let contract_address = data
        .get("project")
        .or_else(|| data.get("address"))
        .and_then(Value::as_str)?
        .to_lowercase();
    Some(CreatedProject {
        project_id,
        contract_address,
    })
}
