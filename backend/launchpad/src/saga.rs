//! # Funding-opening saga
//!
//! Persisted progress of one record's attempt to open funding. Each external
//! step writes its idempotency key here before the next step starts:
//!
//! | key                | written                          | guards                    |
//! |--------------------|----------------------------------|---------------------------|
//! | `snapshot_uri`     | after publishing, only if null   | publishing twice          |
//! | `tx_hash`          | right after broadcast            | resubmitting `create`     |
//! | `contract_address` | once the creation event is found | re-awaiting a known result|
//!
//! ```text
//! SAVING → VALIDATING → SNAPSHOT_PENDING → SNAPSHOT_READY
//!        → DEPLOY_PENDING → DEPLOYED → COMMITTED
//! ```
//!
//! `ABORTED` is reachable from every stage but `COMMITTED`; a new attempt
//! restarts an aborted saga at `SAVING` and keeps whatever keys it recorded.

use std::fmt;

use serde::Serialize;
use sqlx::SqlitePool;
use tracing::debug;

use crate::db::{self, encode_ts};
use crate::errors::{LaunchpadError, Result};
use crate::types::SnapshotRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpeningStage {
    Saving,
    Validating,
    SnapshotPending,
    SnapshotReady,
    DeployPending,
    Deployed,
    Committed,
    Aborted,
}

impl OpeningStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Saving => "SAVING",
            Self::Validating => "VALIDATING",
            Self::SnapshotPending => "SNAPSHOT_PENDING",
            Self::SnapshotReady => "SNAPSHOT_READY",
            Self::DeployPending => "DEPLOY_PENDING",
            Self::Deployed => "DEPLOYED",
            Self::Committed => "COMMITTED",
            Self::Aborted => "ABORTED",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "SAVING" => Some(Self::Saving),
            "VALIDATING" => Some(Self::Validating),
            "SNAPSHOT_PENDING" => Some(Self::SnapshotPending),
            "SNAPSHOT_READY" => Some(Self::SnapshotReady),
            "DEPLOY_PENDING" => Some(Self::DeployPending),
            "DEPLOYED" => Some(Self::Deployed),
            "COMMITTED" => Some(Self::Committed),
            "ABORTED" => Some(Self::Aborted),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed)
    }

    /// Forward moves (skipping is allowed when a key is already known), any
    /// non-terminal stage to `ABORTED`, and `ABORTED` back to `SAVING`.
    pub fn can_advance_to(&self, next: OpeningStage) -> bool {
        match (self, next) {
            (Self::Committed, _) => false,
            (_, Self::Aborted) => true,
            (Self::Aborted, Self::Saving) => true,
            (Self::Aborted, _) => false,
            (current, next) => next >= *current,
        }
    }
}

impl fmt::Display for OpeningStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpeningSaga {
    pub project_id: String,
    pub stage: OpeningStage,
    pub snapshot: Option<SnapshotRef>,
    pub tx_hash: Option<String>,
    pub accepted_token: Option<String>,
    pub token_decimals: Option<u8>,
    pub contract_address: Option<String>,
    pub onchain_project_id: Option<u64>,
    pub last_error: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct SagaRow {
    project_id: String,
    stage: String,
    snapshot_content_id: Option<String>,
    snapshot_uri: Option<String>,
    snapshot_gateway_url: Option<String>,
    tx_hash: Option<String>,
    accepted_token: Option<String>,
    token_decimals: Option<i64>,
    contract_address: Option<String>,
    onchain_project_id: Option<i64>,
    last_error: Option<String>,
}

impl SagaRow {
    fn decode(self) -> Result<OpeningSaga> {
        let stage = OpeningStage::from_db(&self.stage)
            .ok_or_else(|| LaunchpadError::Corrupt(format!("unknown saga stage {:?}", self.stage)))?;
        let snapshot = match (self.snapshot_content_id, self.snapshot_uri) {
            (Some(content_id), Some(uri)) => Some(SnapshotRef {
                content_id,
                uri,
                gateway_url: self.snapshot_gateway_url,
            }),
            _ => None,
        };
        let token_decimals = self
            .token_decimals
            .map(u8::try_from)
            .transpose()
            .map_err(|_| LaunchpadError::Corrupt("token decimals out of range".to_string()))?;
        let onchain_project_id = self
            .onchain_project_id
            .map(u64::try_from)
            .transpose()
            .map_err(|_| LaunchpadError::Corrupt("negative on-chain project id".to_string()))?;
        Ok(OpeningSaga {
            project_id: self.project_id,
            stage,
            snapshot,
            tx_hash: self.tx_hash,
            accepted_token: self.accepted_token,
            token_decimals,
            contract_address: self.contract_address,
            onchain_project_id,
            last_error: self.last_error,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SagaStore {
    pool: SqlitePool,
}

impl SagaStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn load(&self, project_id: &str) -> Result<Option<OpeningSaga>> {
        let row = sqlx::query_as::<_, SagaRow>(
            r#"
            SELECT project_id, stage, snapshot_content_id, snapshot_uri, snapshot_gateway_url,
                   tx_hash, accepted_token, token_decimals, contract_address,
                   onchain_project_id, last_error
            FROM   funding_openings
            WHERE  project_id = ?1
            "#,
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(SagaRow::decode).transpose()
    }

    async fn require(&self, project_id: &str) -> Result<OpeningSaga> {
        self.load(project_id)
            .await?
            .ok_or_else(|| LaunchpadError::Corrupt(format!("saga for {project_id} vanished")))
    }

    /// Start or restart an attempt. Recorded keys survive a restart; a
    /// committed saga is returned untouched.
    pub async fn begin(&self, project_id: &str) -> Result<OpeningSaga> {
        let now = encode_ts(&db::now());
        sqlx::query(
            r#"
            INSERT INTO funding_openings (project_id, stage, updated_at)
            VALUES (?1, 'SAVING', ?2)
            ON CONFLICT (project_id) DO UPDATE
                SET stage = 'SAVING', last_error = NULL, updated_at = excluded.updated_at
                WHERE funding_openings.stage != 'COMMITTED'
            "#,
        )
        .bind(project_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        self.require(project_id).await
    }

    /// Move to `stage`. Illegal moves are ignored and the stored saga returned.
    pub async fn advance(&self, project_id: &str, stage: OpeningStage) -> Result<OpeningSaga> {
        let current = self.require(project_id).await?;
        if current.stage == stage {
            return Ok(current);
        }
        if !current.stage.can_advance_to(stage) {
            debug!(project_id, from = %current.stage, to = %stage, "Saga move ignored");
            return Ok(current);
        }
        sqlx::query("UPDATE funding_openings SET stage = ?1, updated_at = ?2 WHERE project_id = ?3")
            .bind(stage.as_str())
            .bind(encode_ts(&db::now()))
            .bind(project_id)
            .execute(&self.pool)
            .await?;
        debug!(project_id, from = %current.stage, to = %stage, "Saga advanced");
        Ok(OpeningSaga { stage, ..current })
    }

    /// Record token facts resolved for the deployment.
    pub async fn record_token(&self, project_id: &str, token: &str, decimals: u8) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE funding_openings
            SET    accepted_token = ?1, token_decimals = ?2, updated_at = ?3
            WHERE  project_id = ?4
            "#,
        )
        .bind(token)
        .bind(i64::from(decimals))
        .bind(encode_ts(&db::now()))
        .bind(project_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Store the published snapshot unless one is already recorded; returns the
    /// saga as stored, so a losing writer sees the winner's reference.
    pub async fn record_snapshot(&self, project_id: &str, snapshot: &SnapshotRef) -> Result<OpeningSaga> {
        sqlx::query(
            r#"
            UPDATE funding_openings
            SET    snapshot_content_id = ?1, snapshot_uri = ?2, snapshot_gateway_url = ?3,
                   stage = 'SNAPSHOT_READY', updated_at = ?4
            WHERE  project_id = ?5 AND snapshot_uri IS NULL
            "#,
        )
        .bind(&snapshot.content_id)
        .bind(&snapshot.uri)
        .bind(&snapshot.gateway_url)
        .bind(encode_ts(&db::now()))
        .bind(project_id)
        .execute(&self.pool)
        .await?;
        self.require(project_id).await
    }

    pub async fn record_tx(&self, project_id: &str, tx_hash: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE funding_openings
            SET    tx_hash = ?1, stage = 'DEPLOY_PENDING', updated_at = ?2
            WHERE  project_id = ?3 AND tx_hash IS NULL
            "#,
        )
        .bind(tx_hash)
        .bind(encode_ts(&db::now()))
        .bind(project_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Forget a reverted transaction so a later attempt may resubmit.
    pub async fn clear_tx(&self, project_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE funding_openings SET tx_hash = NULL, updated_at = ?1 WHERE project_id = ?2",
        )
        .bind(encode_ts(&db::now()))
        .bind(project_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_deployment(
        &self,
        project_id: &str,
        contract_address: &str,
        onchain_project_id: u64,
    ) -> Result<()> {
        let onchain_id = i64::try_from(onchain_project_id)
            .map_err(|_| LaunchpadError::Rpc(format!("project id {onchain_project_id} too large")))?;
        sqlx::query(
            r#"
            UPDATE funding_openings
            SET    contract_address = ?1, onchain_project_id = ?2, stage = 'DEPLOYED',
                   updated_at = ?3
            WHERE  project_id = ?4 AND contract_address IS NULL
            "#,
        )
        .bind(contract_address)
        .bind(onchain_id)
        .bind(encode_ts(&db::now()))
        .bind(project_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn abort(&self, project_id: &str, reason: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE funding_openings
            SET    stage = 'ABORTED', last_error = ?1, updated_at = ?2
            WHERE  project_id = ?3 AND stage != 'COMMITTED'
            "#,
        )
        .bind(reason)
        .bind(encode_ts(&db::now()))
        .bind(project_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;

    fn snapshot(cid: &str) -> SnapshotRef {
        SnapshotRef {
            content_id: cid.into(),
            uri: format!("ipfs://{cid}"),
            gateway_url: None,
        }
    }

    #[test]
    fn stage_moves() {
        use OpeningStage::*;
        assert!(Saving.can_advance_to(Validating));
        assert!(Saving.can_advance_to(Deployed));
        assert!(!Deployed.can_advance_to(SnapshotPending));
        assert!(DeployPending.can_advance_to(Aborted));
        assert!(Aborted.can_advance_to(Saving));
        assert!(!Aborted.can_advance_to(Deployed));
        assert!(!Committed.can_advance_to(Aborted));
        for stage in [Saving, Validating, SnapshotPending, SnapshotReady, DeployPending, Deployed, Committed, Aborted] {
            assert_eq!(OpeningStage::from_db(stage.as_str()), Some(stage));
        }
    }

    #[tokio::test]
    async fn snapshot_is_recorded_at_most_once() {
        let sagas = SagaStore::new(memory_pool().await);
        sagas.begin("p1").await.unwrap();

        let first = sagas.record_snapshot("p1", &snapshot("cid-a")).await.unwrap();
        let second = sagas.record_snapshot("p1", &snapshot("cid-b")).await.unwrap();
        assert_eq!(first.snapshot, Some(snapshot("cid-a")));
        assert_eq!(second.snapshot, Some(snapshot("cid-a")));
        assert_eq!(second.stage, OpeningStage::SnapshotReady);
    }

    #[tokio::test]
    async fn restart_keeps_keys_and_clears_error() {
        let sagas = SagaStore::new(memory_pool().await);
        sagas.begin("p1").await.unwrap();
        sagas.record_snapshot("p1", &snapshot("cid")).await.unwrap();
        sagas.record_tx("p1", "0xtx").await.unwrap();
        sagas.abort("p1", "finality timeout").await.unwrap();

        let aborted = sagas.load("p1").await.unwrap().unwrap();
        assert_eq!(aborted.stage, OpeningStage::Aborted);
        assert_eq!(aborted.last_error.as_deref(), Some("finality timeout"));

        let resumed = sagas.begin("p1").await.unwrap();
        assert_eq!(resumed.stage, OpeningStage::Saving);
        assert_eq!(resumed.tx_hash.as_deref(), Some("0xtx"));
        assert!(resumed.snapshot.is_some());
        assert!(resumed.last_error.is_none());
    }

    #[tokio::test]
    async fn tx_hash_is_write_once_until_cleared() {
        let sagas = SagaStore::new(memory_pool().await);
        sagas.begin("p1").await.unwrap();
        sagas.record_tx("p1", "0xfirst").await.unwrap();
        sagas.record_tx("p1", "0xsecond").await.unwrap();
        assert_eq!(sagas.load("p1").await.unwrap().unwrap().tx_hash.as_deref(), Some("0xfirst"));

        sagas.clear_tx("p1").await.unwrap();
        sagas.record_tx("p1", "0xsecond").await.unwrap();
        assert_eq!(sagas.load("p1").await.unwrap().unwrap().tx_hash.as_deref(), Some("0xsecond"));
    }

    #[tokio::test]
    async fn committed_saga_is_final() {
        let sagas = SagaStore::new(memory_pool().await);
        sagas.begin("p1").await.unwrap();
        sagas.record_token("p1", "0xtoken", 6).await.unwrap();
        sagas.record_deployment("p1", "0xcontract", 3).await.unwrap();
        sagas.advance("p1", OpeningStage::Committed).await.unwrap();

        sagas.abort("p1", "late").await.unwrap();
        let again = sagas.begin("p1").await.unwrap();
        assert_eq!(again.stage, OpeningStage::Committed);
        assert_eq!(again.contract_address.as_deref(), Some("0xcontract"));
        assert_eq!(again.onchain_project_id, Some(3));
        assert_eq!(again.token_decimals, Some(6));
        assert!(again.last_error.is_none());
    }

    #[tokio::test]
    async fn illegal_moves_are_ignored() {
        let sagas = SagaStore::new(memory_pool().await);
        sagas.begin("p1").await.unwrap();
        sagas.advance("p1", OpeningStage::Deployed).await.unwrap();
        let saga = sagas.advance("p1", OpeningStage::Validating).await.unwrap();
        assert_eq!(saga.stage, OpeningStage::Deployed);
    }
}
