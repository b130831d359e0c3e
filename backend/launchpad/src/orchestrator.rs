//! # Opening funding
//!
//! Moves a ready draft to `ACTIVE`:
//!
//! 1. flush pending edits with the caller's expected version,
//! 2. re-validate the stored record,
//! 3. resolve deployment parameters,
//! 4. publish the snapshot (at most once per record),
//! 5. broadcast `createProject` and await finality,
//! 6. commit the attachment and status.
//!
//! Progress is persisted in the [`SagaStore`] so a later attempt resumes
//! instead of repeating external effects. Steps 5 and 6 run on a spawned
//! task, from the creation-fee read through the commit: once the broadcast
//! starts, dropping the request must not abandon it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::config::{FundingDefaults, Timeouts};
use crate::db;
use crate::errors::LaunchpadError;
use crate::ledger::{
    find_project_created, CreatedProject, LedgerError, LedgerFactory, ReceiptStatus,
    TokenMetadataReader,
};
use crate::manifest::{build_manifest, snapshot_name, ManifestError};
use crate::params::{self, DeploymentParams, ParamError};
use crate::publisher::{PublishError, SnapshotPublisher};
use crate::readiness::{self, Violation};
use crate::saga::{OpeningSaga, OpeningStage, SagaStore};
use crate::store::{RecordStore, StatusExtras, StoreError};
use crate::types::{
    Commitment, OnchainAttachment, ProjectPatch, ProjectRecord, ProjectStatus, SnapshotRef,
};

/// Error taxonomy surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorClass {
    /// Malformed or inconsistent input; fix the draft.
    Input,
    NotFound,
    Forbidden,
    /// Stale version or concurrent attempt; reload and retry.
    Conflict,
    /// Readiness violations; fix the listed fields.
    Readiness,
    /// Storage, ledger or token service failure; retry later.
    External,
    /// Needs an operator.
    Fatal,
}

#[derive(Debug, Error)]
pub enum OpenFundingError {
    #[error("project not found")]
    NotFound,

    #[error("project is {0}; only drafts can open funding")]
    Forbidden(ProjectStatus),

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("version conflict (current version {})", .0.version)]
    Conflict(Box<ProjectRecord>),

    #[error("another funding-opening attempt for this project is in progress")]
    InProgress,

    #[error("project is not ready to open funding")]
    NotReady(Vec<Violation>),

    #[error(transparent)]
    Params(#[from] ParamError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("snapshot publication failed: {0}")]
    Publish(#[from] PublishError),

    #[error("snapshot publication timed out")]
    PublishTimeout,

    #[error("token metadata unavailable: {0}")]
    TokenMetadata(LedgerError),

    #[error("ledger call failed: {0}")]
    Ledger(LedgerError),

    #[error("no receipt for {tx_hash} before the finality timeout")]
    FinalityTimeout { tx_hash: String },

    #[error("transaction {tx_hash} succeeded but carries no ProjectCreated event")]
    CreationEventMissing { tx_hash: String },

    #[error(transparent)]
    Backend(#[from] LaunchpadError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for OpenFundingError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => Self::NotFound,
            StoreError::Conflict(current) => Self::Conflict(current),
            StoreError::Forbidden(status) => Self::Forbidden(status),
            StoreError::Invalid(msg) => Self::Invalid(msg),
            StoreError::Backend(e) => Self::Backend(e),
        }
    }
}

impl OpenFundingError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NotFound => ErrorClass::NotFound,
            Self::Forbidden(_) => ErrorClass::Forbidden,
            Self::Invalid(_) | Self::Params(_) | Self::Manifest(_) => ErrorClass::Input,
            Self::Conflict(_) | Self::InProgress => ErrorClass::Conflict,
            Self::NotReady(_) => ErrorClass::Readiness,
            Self::Publish(_)
            | Self::PublishTimeout
            | Self::TokenMetadata(_)
            | Self::Ledger(_)
            | Self::FinalityTimeout { .. } => ErrorClass::External,
            Self::CreationEventMissing { .. } | Self::Backend(_) | Self::Internal(_) => {
                ErrorClass::Fatal
            }
        }
    }

    /// Only external failures are worth retrying unchanged.
    pub fn retryable(&self) -> bool {
        self.class() == ErrorClass::External
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::Invalid(_) => "INVALID_INPUT",
            Self::Conflict(_) => "CONFLICT",
            Self::InProgress => "OPENING_IN_PROGRESS",
            Self::NotReady(_) => "NOT_READY",
            Self::Params(ParamError::ScheduleMismatch { .. }) => "RELEASE_SCHEDULE_MISMATCH",
            Self::Params(ParamError::MissingTokenAddress(_)) => "MISSING_TOKEN_ADDRESS",
            Self::Params(_) => "INVALID_FUNDING_PARAMS",
            Self::Manifest(_) => "INVALID_EXTERNAL_LINKS",
            Self::Publish(_) => "PUBLISH_FAILED",
            Self::PublishTimeout => "PUBLISH_TIMEOUT",
            Self::TokenMetadata(_) => "TOKEN_METADATA_UNAVAILABLE",
            Self::Ledger(LedgerError::Reverted(_)) => "TRANSACTION_REVERTED",
            Self::Ledger(LedgerError::Timeout(_)) => "LEDGER_TIMEOUT",
            Self::Ledger(_) => "LEDGER_FAILED",
            Self::FinalityTimeout { .. } => "FINALITY_TIMEOUT",
            Self::CreationEventMissing { .. } => "CREATION_EVENT_MISSING",
            Self::Backend(_) | Self::Internal(_) => "INTERNAL",
        }
    }
}

pub type OpenResult<T> = std::result::Result<T, OpenFundingError>;

/// Pending edits flushed before validation.
#[derive(Debug, Clone, Default)]
pub struct OpenFundingRequest {
    pub patch: Option<ProjectPatch>,
    pub commitments: Option<Vec<Commitment>>,
    pub expected_version: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenFundingOutcome {
    pub project: ProjectRecord,
    /// The record was already open; nothing was deployed by this call.
    pub already_open: bool,
}

/// Ledger facts fixed for this deployment.
#[derive(Debug, Clone)]
pub struct OpenerSettings {
    pub chain_id: u64,
    pub factory_address: String,
    pub defaults: FundingDefaults,
    pub timeouts: Timeouts,
}

/// Releases the per-record claim when dropped.
struct InFlight {
    ids: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Ok(mut ids) = self.ids.lock() {
            ids.remove(&self.id);
        }
    }
}

/// Where the finishing task picks up.
enum Broadcast {
    /// Nothing sent yet.
    Pending(DeploymentParams),
    /// Sent by an earlier attempt.
    Sent(String),
}

/// Everything the finishing task needs to deploy and commit.
struct Deployment {
    project_id: String,
    actor: String,
    broadcast: Broadcast,
    snapshot: SnapshotRef,
    accepted_token: String,
    token_decimals: u8,
    created: Option<CreatedProject>,
}

#[derive(Clone)]
pub struct FundingOpener {
    store: RecordStore,
    sagas: SagaStore,
    publisher: Arc<dyn SnapshotPublisher>,
    ledger: Arc<dyn LedgerFactory>,
    tokens: Arc<dyn TokenMetadataReader>,
    settings: Arc<OpenerSettings>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl FundingOpener {
    pub fn new(
        store: RecordStore,
        sagas: SagaStore,
        publisher: Arc<dyn SnapshotPublisher>,
        ledger: Arc<dyn LedgerFactory>,
        tokens: Arc<dyn TokenMetadataReader>,
        settings: OpenerSettings,
    ) -> Self {
        Self {
            store,
            sagas,
            publisher,
            ledger,
            tokens,
            settings: Arc::new(settings),
            in_flight: Arc::default(),
        }
    }

    pub fn defaults(&self) -> &FundingDefaults {
        &self.settings.defaults
    }

    fn claim(&self, id: &str) -> OpenResult<InFlight> {
        let mut ids = self
            .in_flight
            .lock()
            .map_err(|_| OpenFundingError::Internal("in-flight registry poisoned".to_string()))?;
        if !ids.insert(id.to_string()) {
            return Err(OpenFundingError::InProgress);
        }
        Ok(InFlight {
            ids: Arc::clone(&self.in_flight),
            id: id.to_string(),
        })
    }

    /// Run (or resume) the opening of `id` on behalf of `actor`.
    pub async fn open(
        &self,
        id: &str,
        actor: &str,
        request: OpenFundingRequest,
    ) -> OpenResult<OpenFundingOutcome> {
        let claim = self.claim(id)?;

        let current = self.store.read(id).await?.ok_or(OpenFundingError::NotFound)?;
        if !current.is_draft() {
            return self.already_open(current).await;
        }

        let saga = self.sagas.begin(id).await?;
        info!(project_id = %id, resumed_tx = ?saga.tx_hash, "Opening funding");

        match self.prepare(id, actor, request, saga).await {
            Ok(deployment) => {
                let opener = self.clone();
                let task = tokio::spawn(async move {
                    let _claim = claim;
                    opener.finish(deployment).await
                });
                let project = task
                    .await
                    .map_err(|e| OpenFundingError::Internal(format!("finishing task failed: {e}")))??;
                Ok(OpenFundingOutcome {
                    project,
                    already_open: false,
                })
            }
            Err(e) => {
                self.record_abort(id, &e).await;
                Err(e)
            }
        }
    }

    /// A non-draft record is only a success if this service opened it.
    async fn already_open(&self, record: ProjectRecord) -> OpenResult<OpenFundingOutcome> {
        let saga = self.sagas.load(&record.id).await?;
        let ours = match (&saga, record.onchain()) {
            (Some(saga), Some(onchain)) => {
                saga.contract_address.as_deref() == Some(onchain.contract_address.as_str())
            }
            _ => false,
        };
        if !ours {
            return Err(OpenFundingError::Forbidden(record.status()));
        }
        if saga.is_some_and(|s| s.stage != OpeningStage::Committed) {
            self.sagas.advance(&record.id, OpeningStage::Committed).await?;
        }
        Ok(OpenFundingOutcome {
            project: record,
            already_open: true,
        })
    }

    /// Steps 1 to 4: everything before the first ledger write.
    async fn prepare(
        &self,
        id: &str,
        actor: &str,
        request: OpenFundingRequest,
        saga: OpeningSaga,
    ) -> OpenResult<Deployment> {
        // 1. Flush edits.
        let mut expected = request.expected_version;
        let mut saved = None;
        if let Some(patch) = request.patch.filter(|p| !p.is_empty()) {
            let record = self.store.update(id, actor, &patch, expected).await?;
            expected = expected.map(|_| record.version);
            saved = Some(record);
        }
        if let Some(items) = request.commitments {
            let record = self.store.update_commitments(id, actor, items, expected).await?;
            saved = Some(record);
        }
        if saved.is_none() {
            if let Some(expected) = expected {
                let current = self.store.read(id).await?.ok_or(OpenFundingError::NotFound)?;
                if current.version != expected {
                    return Err(OpenFundingError::Conflict(Box::new(current)));
                }
            }
        }

        // A broadcast transaction pins the deployment; later edits cannot change it.
        if let Some(tx_hash) = saga.tx_hash.clone() {
            return resume(id, actor, saga, tx_hash);
        }

        // 2. Re-validate what is stored.
        self.sagas.advance(id, OpeningStage::Validating).await?;
        let record = self.store.read(id).await?.ok_or(OpenFundingError::NotFound)?;
        if !record.is_draft() {
            return Err(OpenFundingError::Forbidden(record.status()));
        }
        let violations = readiness::check(record.content(), &self.settings.defaults.currency);
        if !violations.is_empty() {
            return Err(OpenFundingError::NotReady(violations));
        }

        // 3. Resolve parameters.
        let funding = &record.content().funding;
        let onchain_decimals = match params::onchain_decimals_needed(funding) {
            Some(token) => Some(self.read_decimals(&token).await?),
            None => None,
        };
        let resolution = params::resolve(
            funding,
            &record.creator_address,
            &self.settings.defaults,
            onchain_decimals,
        )?;
        let mut deploy_params = resolution.params;
        self.sagas
            .record_token(id, &deploy_params.accepted_token, resolution.token_decimals)
            .await?;

        // 4. Publish the snapshot once.
        let snapshot = match saga.snapshot {
            Some(snapshot) => {
                info!(project_id = %id, uri = %snapshot.uri, "Reusing stored snapshot");
                snapshot
            }
            None => self.publish_snapshot(&record).await?,
        };
        deploy_params.project_uri = snapshot.uri.clone();

        Ok(Deployment {
            project_id: id.to_string(),
            actor: actor.to_string(),
            accepted_token: deploy_params.accepted_token.clone(),
            broadcast: Broadcast::Pending(deploy_params),
            snapshot,
            token_decimals: resolution.token_decimals,
            created: None,
        })
    }

    /// Step 5: read the fee, send `createProject` and persist its hash.
    async fn broadcast(&self, id: &str, deploy_params: &DeploymentParams) -> OpenResult<String> {
        self.sagas.advance(id, OpeningStage::DeployPending).await?;
        let fee = timeout(self.settings.timeouts.finality, self.ledger.creation_fee())
            .await
            .map_err(|_| OpenFundingError::Ledger(LedgerError::Timeout("creationFee")))?
            .map_err(OpenFundingError::Ledger)?;
        let tx_hash = self
            .ledger
            .submit_create_project(deploy_params, fee)
            .await
            .map_err(OpenFundingError::Ledger)?;
        self.sagas.record_tx(id, &tx_hash).await?;
        info!(project_id = %id, tx_hash = %tx_hash, fee = %fee, "Deployment broadcast");
        Ok(tx_hash)
    }

    async fn read_decimals(&self, token: &str) -> OpenResult<u8> {
        match timeout(self.settings.timeouts.publish, self.tokens.decimals(token)).await {
            Ok(Ok(decimals)) => Ok(decimals),
            Ok(Err(e)) => Err(OpenFundingError::TokenMetadata(e)),
            Err(_) => Err(OpenFundingError::TokenMetadata(LedgerError::Timeout("decimals"))),
        }
    }

    async fn publish_snapshot(&self, record: &ProjectRecord) -> OpenResult<SnapshotRef> {
        self.sagas.advance(&record.id, OpeningStage::SnapshotPending).await?;
        let manifest = build_manifest(record)?;
        let document = serde_json::to_value(&manifest).map_err(LaunchpadError::from)?;

        let published = timeout(
            self.settings.timeouts.publish,
            self.publisher.publish(&snapshot_name(record), &document),
        )
        .await
        .map_err(|_| OpenFundingError::PublishTimeout)??;

        let saga = self.sagas.record_snapshot(&record.id, &published).await?;
        info!(project_id = %record.id, uri = %published.uri, "Snapshot published");
        saga.snapshot
            .ok_or_else(|| OpenFundingError::Internal("snapshot not recorded".to_string()))
    }

    /// Broadcast (unless already sent), await finality (unless already known)
    /// and commit. Runs detached from the request.
    async fn finish(&self, deployment: Deployment) -> OpenResult<ProjectRecord> {
        let id = deployment.project_id.clone();
        let result = self.finish_inner(deployment).await;
        if let Err(e) = &result {
            self.record_abort(&id, e).await;
        }
        result
    }

    async fn finish_inner(&self, deployment: Deployment) -> OpenResult<ProjectRecord> {
        let id = deployment.project_id.as_str();
        let tx_hash = match deployment.broadcast {
            Broadcast::Pending(deploy_params) => self.broadcast(id, &deploy_params).await?,
            Broadcast::Sent(tx_hash) => tx_hash,
        };

        let created = match deployment.created.clone() {
            Some(created) => created,
            None => {
                let receipt = timeout(
                    self.settings.timeouts.finality,
                    self.ledger
                        .wait_for_receipt(&tx_hash, self.settings.timeouts.receipt_poll),
                )
                .await
                .map_err(|_| OpenFundingError::FinalityTimeout {
                    tx_hash: tx_hash.clone(),
                })?
                .map_err(OpenFundingError::Ledger)?;

                if receipt.status == ReceiptStatus::Reverted {
                    self.sagas.clear_tx(id).await?;
                    return Err(OpenFundingError::Ledger(LedgerError::Reverted(tx_hash)));
                }
                let created = find_project_created(&receipt, &self.settings.factory_address)
                    .ok_or_else(|| OpenFundingError::CreationEventMissing {
                        tx_hash: tx_hash.clone(),
                    })?;
                self.confirm_registered(&created).await?;
                self.sagas
                    .record_deployment(id, &created.contract_address, created.project_id)
                    .await?;
                created
            }
        };
        self.sagas.advance(id, OpeningStage::Deployed).await?;

        // 6. Commit.
        let attachment = OnchainAttachment {
            contract_address: created.contract_address.clone(),
            chain_id: self.settings.chain_id,
            onchain_project_id: created.project_id,
            opened_tx_hash: tx_hash,
            accepted_token: deployment.accepted_token,
            token_decimals: deployment.token_decimals,
            snapshot: deployment.snapshot,
        };
        let record = self
            .store
            .set_status(
                id,
                &deployment.actor,
                ProjectStatus::Active,
                StatusExtras {
                    onchain: Some(attachment),
                    published_at: Some(db::now()),
                    ..Default::default()
                },
            )
            .await?;
        self.sagas.advance(id, OpeningStage::Committed).await?;

        info!(
            project_id = %id,
            contract = %created.contract_address,
            onchain_id = created.project_id,
            "Funding opened"
        );
        Ok(record)
    }

    /// The factory registry must not contradict the creation event. An
    /// unreachable registry is logged; the event stays authoritative.
    async fn confirm_registered(&self, created: &CreatedProject) -> OpenResult<()> {
        match self.ledger.project_by_id(created.project_id).await {
            Ok(Some(registered)) if registered != created.contract_address => {
                Err(OpenFundingError::Internal(format!(
                    "factory lists {registered} as project {}, event says {}",
                    created.project_id, created.contract_address
                )))
            }
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(onchain_id = created.project_id, "projectById lookup failed: {e}");
                Ok(())
            }
        }
    }

    async fn record_abort(&self, id: &str, e: &OpenFundingError) {
        match e.class() {
            ErrorClass::Fatal => error!(project_id = %id, code = e.code(), "Opening aborted: {e}"),
            _ => warn!(project_id = %id, code = e.code(), "Opening aborted: {e}"),
        }
        // NOT_FOUND means the saga row is gone with the draft.
        if matches!(e, OpenFundingError::NotFound) {
            return;
        }
        if let Err(db_err) = self.sagas.abort(id, &format!("{}: {e}", e.code())).await {
            error!(project_id = %id, "Failed to record saga abort: {db_err}");
        }
    }
}

/// Rebuild a deployment from the keys recorded by an earlier attempt.
fn resume(id: &str, actor: &str, saga: OpeningSaga, tx_hash: String) -> OpenResult<Deployment> {
    let missing = |what: &str| {
        OpenFundingError::Internal(format!("saga for {id} has a transaction but no {what}"))
    };
    let snapshot = saga.snapshot.ok_or_else(|| missing("snapshot"))?;
    let accepted_token = saga.accepted_token.ok_or_else(|| missing("accepted token"))?;
    let token_decimals = saga.token_decimals.ok_or_else(|| missing("token decimals"))?;
    let created = match (saga.contract_address, saga.onchain_project_id) {
        (Some(contract_address), Some(project_id)) => {
            info!(project_id = %id, contract = %contract_address, "Contract already deployed, committing");
            Some(CreatedProject {
                project_id,
                contract_address,
            })
        }
        _ => {
            info!(project_id = %id, tx_hash = %tx_hash, "Re-awaiting broadcast transaction");
            None
        }
    };
    Ok(Deployment {
        project_id: id.to_string(),
        actor: actor.to_string(),
        broadcast: Broadcast::Sent(tx_hash),
        snapshot,
        accepted_token,
        token_decimals,
        created,
    })
}
