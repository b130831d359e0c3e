//! Sample records and in-process fakes for the collaborator traits.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};

use crate::config::{FundingDefaults, Timeouts};
use crate::db::memory_pool;
use crate::ledger::{
    LedgerError, LedgerFactory, ReceiptLog, ReceiptStatus, TokenMetadataReader, TxReceipt,
    PROJECT_CREATED_EVENT,
};
use crate::orchestrator::{FundingOpener, OpenerSettings};
use crate::params::{self, DeploymentParams};
use crate::publisher::MemoryPublisher;
use crate::saga::SagaStore;
use crate::signer::{SignedTransaction, SignerError, WalletSigner};
use crate::store::RecordStore;
use crate::types::{
    Commitment, CorePatch, DeliverableType, FailureConsequence, FundingPatch, OnchainAttachment,
    ProjectCategory, ProjectContent, ProjectCore, ProjectPatch, ProjectRecord, ProjectState,
    ReleaseModel, SnapshotRef, VerificationMethod,
};

pub const CREATOR: &str = "0xabcdef0000000000000000000000000000000001";
pub const OTHER_CREATOR: &str = "0x2222222222222222222222222222222222222222";
pub const SIGNER: &str = "0x5150000000000000000000000000000000000001";
pub const TOKEN: &str = "0x7070000000000000000000000000000000000006";
pub const FACTORY: &str = "0xfac0000000000000000000000000000000000001";

const DEFINITION: &str = "A command-line tool that verifies signed release artifacts.";

pub fn sample_commitment() -> Commitment {
    Commitment {
        deliverable_type: DeliverableType::PublicRelease,
        deadline: "2026-05-01".to_string(),
        verification_method: VerificationMethod::PublicLink,
        verification_details: "Tagged release with signed binaries".to_string(),
        failure_consequence: FailureConsequence::FullRefund,
        refund_percent: None,
        vote_duration_days: None,
        details: "v1 release".to_string(),
    }
}

/// Edits that make a fresh draft ready (commitments excluded).
pub fn ready_patch() -> ProjectPatch {
    ProjectPatch {
        core: Some(CorePatch {
            title: Some(Some("X".to_string())),
            category: Some(Some(ProjectCategory::Software)),
            definition: Some(Some(DEFINITION.to_string())),
            ..Default::default()
        }),
        funding: Some(FundingPatch {
            target: Some(Some("1000".to_string())),
            minimum_allocation: Some(Some("10".to_string())),
            deadline: Some(Some("2026-06-01".to_string())),
            release_model: Some(Some(ReleaseModel::AllOrNothing)),
            ..Default::default()
        }),
        external_links: None,
    }
}

pub fn ready_content() -> ProjectContent {
    let mut content = ProjectContent {
        core: ProjectCore::default(),
        commitments: vec![sample_commitment()],
        ..Default::default()
    };
    ready_patch().apply_to(&mut content);
    content
}

pub fn ready_record() -> ProjectRecord {
    let created = Utc
        .with_ymd_and_hms(2026, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_else(Utc::now);
    ProjectRecord {
        id: "p-ready".to_string(),
        creator_address: CREATOR.to_string(),
        state: ProjectState::Draft(ready_content()),
        created_at: created,
        updated_at: created,
        published_at: None,
        closed_at: None,
        version: 3,
    }
}

pub fn sample_attachment() -> OnchainAttachment {
    OnchainAttachment {
        contract_address: contract_for(1),
        chain_id: 137,
        onchain_project_id: 1,
        opened_tx_hash: "0xtx1".to_string(),
        accepted_token: TOKEN.to_string(),
        token_decimals: 6,
        snapshot: SnapshotRef {
            content_id: "bafy-sample".to_string(),
            uri: "ipfs://bafy-sample".to_string(),
            gateway_url: None,
        },
    }
}

pub fn test_defaults() -> FundingDefaults {
    FundingDefaults {
        token_address: Some(TOKEN.to_string()),
        ..Default::default()
    }
}

pub fn sample_params() -> DeploymentParams {
    let mut p = params::resolve(&ready_content().funding, CREATOR, &test_defaults(), None)
        .map(|r| r.params)
        .unwrap_or_else(|e| panic!("ready content must resolve: {e}"));
    p.project_uri = "ipfs://bafy-sample".to_string();
    p
}

/// Address of the contract the fake factory deploys as project `n`.
pub fn contract_for(n: u64) -> String {
    format!("0xc0de{n:036x}")
}

/// Create a draft and make it ready through the store.
pub async fn seed_ready_draft(store: &RecordStore) -> ProjectRecord {
    let record = store.create(CREATOR).await.unwrap();
    store.update(&record.id, CREATOR, &ready_patch(), None).await.unwrap();
    store
        .update_commitments(&record.id, CREATOR, vec![sample_commitment()], None)
        .await
        .unwrap()
}

// ─────────────────────────────────────────────────────────
// Fakes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct FakeSigner;

#[async_trait]
impl WalletSigner for FakeSigner {
    fn address(&self) -> &str {
        SIGNER
    }

    async fn sign_message(&self, message: &[u8]) -> Result<String, SignerError> {
        Ok(format!("0xsig{}", hex::encode(message)))
    }

    async fn sign_transaction(&self, payload: &Value) -> Result<SignedTransaction, SignerError> {
        Ok(SignedTransaction {
            raw: payload.to_string(),
            hash: "0xsigned".to_string(),
        })
    }
}

/// Factory and token reader backed by memory. Switches change the behaviour of
/// later calls.
#[derive(Debug)]
pub struct FakeLedger {
    pub fee: u128,
    pub token_decimals: u8,
    /// Receipts stay pending.
    pub pending: AtomicBool,
    pub revert: AtomicBool,
    pub omit_event: AtomicBool,
    /// Number of upcoming submissions to reject.
    pub fail_submits: AtomicUsize,
    pub decimals_reads: AtomicUsize,
    /// Delay before `creation_fee` answers.
    pub fee_delay: Option<Duration>,
    /// Delay after a submission is accepted, before its hash is returned.
    pub submit_delay: Option<Duration>,
    pub(crate) submissions: Mutex<Vec<DeploymentParams>>,
}

impl Default for FakeLedger {
    fn default() -> Self {
        Self {
            fee: 5,
            token_decimals: 6,
            pending: AtomicBool::new(false),
            revert: AtomicBool::new(false),
            omit_event: AtomicBool::new(false),
            fail_submits: AtomicUsize::new(0),
            decimals_reads: AtomicUsize::new(0),
            fee_delay: None,
            submit_delay: None,
            submissions: Mutex::new(Vec::new()),
        }
    }
}

impl FakeLedger {
    pub fn submissions(&self) -> Vec<DeploymentParams> {
        self.submissions.lock().unwrap().clone()
    }

    pub fn submit_count(&self) -> usize {
        self.submissions.lock().unwrap().len()
    }

    fn receipt_for(&self, n: u64, tx_hash: &str) -> TxReceipt {
        let mut logs = vec![ReceiptLog {
            address: TOKEN.to_string(),
            event: "Approval".to_string(),
            data: json!({}),
        }];
        if !self.omit_event.load(Ordering::SeqCst) {
            logs.push(ReceiptLog {
                address: FACTORY.to_string(),
                event: PROJECT_CREATED_EVENT.to_string(),
                data: json!({ "projectId": n.to_string(), "project": contract_for(n) }),
            });
        }
        TxReceipt {
            tx_hash: tx_hash.to_string(),
            status: if self.revert.load(Ordering::SeqCst) {
                ReceiptStatus::Reverted
            } else {
                ReceiptStatus::Success
            },
            logs,
        }
    }
}

#[async_trait]
impl LedgerFactory for FakeLedger {
    async fn creation_fee(&self) -> Result<u128, LedgerError> {
        if let Some(delay) = self.fee_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.fee)
    }

    async fn submit_create_project(
        &self,
        params: &DeploymentParams,
        _fee: u128,
    ) -> Result<String, LedgerError> {
        let failing = self
            .fail_submits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(LedgerError::Rejected("nonce too low".to_string()));
        }
        let tx_hash = {
            let mut subs = self.submissions.lock().unwrap();
            subs.push(params.clone());
            format!("0xtx{}", subs.len())
        };
        if let Some(delay) = self.submit_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(tx_hash)
    }

    async fn transaction_receipt(&self, tx_hash: &str) -> Result<Option<TxReceipt>, LedgerError> {
        if self.pending.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let n = tx_hash.strip_prefix("0xtx").and_then(|n| n.parse::<u64>().ok());
        Ok(n.map(|n| self.receipt_for(n, tx_hash)))
    }

    async fn project_by_id(&self, project_id: u64) -> Result<Option<String>, LedgerError> {
        let known = project_id >= 1 && project_id as usize <= self.submit_count();
        Ok(known.then(|| contract_for(project_id)))
    }
}

#[async_trait]
impl TokenMetadataReader for FakeLedger {
    async fn symbol(&self, _token: &str) -> Result<String, LedgerError> {
        Ok("TKN".to_string())
    }

    async fn decimals(&self, _token: &str) -> Result<u8, LedgerError> {
        self.decimals_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.token_decimals)
    }
}

// ─────────────────────────────────────────────────────────
// Wiring
// ─────────────────────────────────────────────────────────

pub struct Harness {
    pub store: RecordStore,
    pub sagas: SagaStore,
    pub publisher: Arc<MemoryPublisher>,
    pub ledger: Arc<FakeLedger>,
    pub opener: FundingOpener,
}

pub fn test_timeouts() -> Timeouts {
    Timeouts {
        publish: Duration::from_secs(2),
        finality: Duration::from_millis(300),
        receipt_poll: Duration::from_millis(5),
    }
}

pub async fn harness() -> Harness {
    harness_with(FakeLedger::default()).await
}

pub async fn harness_with(ledger: FakeLedger) -> Harness {
    let pool = memory_pool().await;
    let store = RecordStore::new(pool.clone());
    let sagas = SagaStore::new(pool);
    let publisher = Arc::new(MemoryPublisher::new(None));
    let ledger = Arc::new(ledger);
    let opener = FundingOpener::new(
        store.clone(),
        sagas.clone(),
        publisher.clone(),
        ledger.clone(),
        ledger.clone(),
        OpenerSettings {
            chain_id: 137,
            factory_address: FACTORY.to_string(),
            defaults: test_defaults(),
            timeouts: test_timeouts(),
        },
    );
    Harness {
        store,
        sagas,
        publisher,
        ledger,
        opener,
    }
}
