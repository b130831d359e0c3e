//! # Record store
//!
//! Versioned project records plus their append-only event log, persisted in
//! SQLite.
//!
//! Every mutation is a single transaction holding:
//!
//! 1. `UPDATE projects … WHERE id = ? AND version = ?` (compare-and-set), and
//! 2. exactly one `INSERT INTO project_events`.
//!
//! A failed compare-and-set rolls back both, so rejected mutations leave no
//! event behind. The store never holds a transaction open across anything but
//! its own SQL statements.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::{SqliteConnection, SqlitePool};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::{self, decode_opt_ts, decode_ts, encode_ts};
use crate::errors::LaunchpadError;
use crate::events::{EventKind, EventRow, ProjectEvent};
use crate::links::{normalize_links, validate_draft_links};
use crate::rules::normalize_address;
use crate::types::{
    Commitment, OnchainAttachment, ProjectContent, ProjectPatch, ProjectRecord, ProjectState,
    ProjectStatus, PublishedProject, MAX_COMMITMENTS,
};

/// Retries for content writes without an expected version that lose a race.
const MAX_CAS_ATTEMPTS: usize = 5;

/// How an unguarded mutation reacts to losing the compare-and-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retry {
    /// Give up with `Conflict` after `MAX_CAS_ATTEMPTS`.
    Bounded,
    /// Keep re-reading and re-applying until it lands or the record is gone.
    UntilApplied,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("project not found")]
    NotFound,

    /// Stale expected version; carries the current record.
    #[error("version conflict (current version {})", .0.version)]
    Conflict(Box<ProjectRecord>),

    #[error("operation not allowed while project is {0}")]
    Forbidden(ProjectStatus),

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error(transparent)]
    Backend(#[from] LaunchpadError),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        Self::Backend(LaunchpadError::Database(e))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Backend(LaunchpadError::Json(e))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Extra fields written alongside a status change.
#[derive(Debug, Clone, Default)]
pub struct StatusExtras {
    /// Required when leaving `DRAFT`.
    pub onchain: Option<OnchainAttachment>,
    pub published_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub raised: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct ProjectRow {
    id: String,
    creator_address: String,
    status: String,
    version: i64,
    content: String,
    created_at: String,
    updated_at: String,
    published_at: Option<String>,
    closed_at: Option<String>,
}

impl ProjectRow {
    fn decode(self) -> StoreResult<ProjectRecord> {
        let status: ProjectStatus = self
            .status
            .parse()
            .map_err(|e: String| LaunchpadError::Corrupt(e))?;
        let state = match status {
            ProjectStatus::Draft => ProjectState::Draft(serde_json::from_str(&self.content)?),
            ProjectStatus::Active => ProjectState::Active(serde_json::from_str(&self.content)?),
            ProjectStatus::Completed => {
                ProjectState::Completed(serde_json::from_str(&self.content)?)
            }
            ProjectStatus::Failed => ProjectState::Failed(serde_json::from_str(&self.content)?),
        };
        Ok(ProjectRecord {
            id: self.id,
            creator_address: self.creator_address,
            state,
            created_at: decode_ts(&self.created_at)?,
            updated_at: decode_ts(&self.updated_at)?,
            published_at: decode_opt_ts(self.published_at.as_deref())?,
            closed_at: decode_opt_ts(self.closed_at.as_deref())?,
            version: self.version,
        })
    }
}

fn encode_content(state: &ProjectState) -> serde_json::Result<String> {
    match state {
        ProjectState::Draft(content) => serde_json::to_string(content),
        ProjectState::Active(p) | ProjectState::Completed(p) | ProjectState::Failed(p) => {
            serde_json::to_string(p)
        }
    }
}

/// Explicitly constructed store handle; cheap to clone.
#[derive(Debug, Clone)]
pub struct RecordStore {
    pool: SqlitePool,
}

impl RecordStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ─────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────

    pub async fn read(&self, id: &str) -> StoreResult<Option<ProjectRecord>> {
        let row = sqlx::query_as::<_, ProjectRow>(
            r#"
            SELECT id, creator_address, status, version, content,
                   created_at, updated_at, published_at, closed_at
            FROM   projects
            WHERE  id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ProjectRow::decode).transpose()
    }

    pub async fn list_by_creator(&self, address: &str) -> StoreResult<Vec<ProjectRecord>> {
        let rows = sqlx::query_as::<_, ProjectRow>(
            r#"
            SELECT id, creator_address, status, version, content,
                   created_at, updated_at, published_at, closed_at
            FROM   projects
            WHERE  creator_address = ?1
            ORDER  BY created_at ASC, id ASC
            "#,
        )
        .bind(normalize_address(address))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ProjectRow::decode).collect()
    }

    /// Events for one project, oldest first.
    pub async fn events(&self, project_id: &str) -> StoreResult<Vec<ProjectEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT seq, id, project_id, event_type, timestamp, actor_address, payload
            FROM   project_events
            WHERE  project_id = ?1
            ORDER  BY seq ASC
            "#,
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> StoreResult<ProjectEvent> {
                let kind = EventKind::from_db(&row.event_type).ok_or_else(|| {
                    LaunchpadError::Corrupt(format!("unknown event type {:?}", row.event_type))
                })?;
                let payload = row
                    .payload
                    .as_deref()
                    .map(serde_json::from_str::<Value>)
                    .transpose()?;
                Ok(ProjectEvent {
                    id: row.id,
                    project_id: row.project_id,
                    kind,
                    timestamp: decode_ts(&row.timestamp)?,
                    actor_address: row.actor_address,
                    payload,
                })
            })
            .collect()
    }

    // ─────────────────────────────────────────────────────────
    // Writes
    // ─────────────────────────────────────────────────────────

    pub async fn create(&self, creator_address: &str) -> StoreResult<ProjectRecord> {
        let creator = normalize_address(creator_address);
        let now = db::now();
        let record = ProjectRecord {
            id: Uuid::new_v4().to_string(),
            creator_address: creator.clone(),
            state: ProjectState::Draft(ProjectContent::default()),
            created_at: now,
            updated_at: now,
            published_at: None,
            closed_at: None,
            version: 1,
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO projects
                (id, creator_address, status, version, content, created_at, updated_at,
                 published_at, closed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, NULL)
            "#,
        )
        .bind(&record.id)
        .bind(&record.creator_address)
        .bind(record.status().as_str())
        .bind(record.version)
        .bind(encode_content(&record.state)?)
        .bind(encode_ts(&record.created_at))
        .bind(encode_ts(&record.updated_at))
        .execute(&mut *tx)
        .await?;
        insert_event(&mut tx, &record.id, EventKind::Created, &creator, None).await?;
        tx.commit().await?;

        info!(project_id = %record.id, creator = %creator, "Draft created");
        Ok(record)
    }

    /// Merge `core`/`funding` partials and replace external links.
    pub async fn update(
        &self,
        id: &str,
        actor_address: &str,
        patch: &ProjectPatch,
        expected_version: Option<i64>,
    ) -> StoreResult<ProjectRecord> {
        let links = match &patch.external_links {
            Some(links) => {
                let links = normalize_links(links);
                validate_draft_links(&links).map_err(|issues| {
                    StoreError::Invalid(format!("INVALID_EXTERNAL_LINKS: {}", issues.join("; ")))
                })?;
                Some(links)
            }
            None => None,
        };
        let patch = ProjectPatch {
            external_links: links,
            ..patch.clone()
        };
        let payload = json!({ "fields": patch.touched_groups() });

        self.mutate(id, actor_address, expected_version, Retry::Bounded, |record| {
            let status = record.status();
            let content = record.draft_mut().ok_or(StoreError::Forbidden(status))?;
            patch.apply_to(content);
            Ok((EventKind::Edited, Some(payload.clone())))
        })
        .await
    }

    /// Replace the whole commitment list.
    pub async fn update_commitments(
        &self,
        id: &str,
        actor_address: &str,
        items: Vec<Commitment>,
        expected_version: Option<i64>,
    ) -> StoreResult<ProjectRecord> {
        if items.len() > MAX_COMMITMENTS {
            return Err(StoreError::Invalid(format!(
                "TOO_MANY: at most {MAX_COMMITMENTS} commitments are allowed"
            )));
        }
        let payload = json!({ "count": items.len() });

        self.mutate(id, actor_address, expected_version, Retry::Bounded, |record| {
            let status = record.status();
            let content = record.draft_mut().ok_or(StoreError::Forbidden(status))?;
            content.commitments = items.clone();
            Ok((EventKind::CommitmentsUpdated, Some(payload.clone())))
        })
        .await
    }

    /// Remove a draft together with its events and any opening saga.
    pub async fn delete_draft(&self, id: &str, actor_address: &str) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        // A draft whose opening already broadcast a transaction must stay.
        let removed = sqlx::query(
            r#"
            DELETE FROM projects
            WHERE  id = ?1 AND status = 'DRAFT'
              AND  NOT EXISTS (SELECT 1 FROM funding_openings
                               WHERE project_id = ?1 AND tx_hash IS NOT NULL)
            "#,
        )
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if removed == 0 {
            tx.rollback().await?;
            return match self.read(id).await? {
                Some(record) if record.is_draft() => {
                    warn!(project_id = %id, "Delete refused: deployment in flight");
                    Err(StoreError::Conflict(Box::new(record)))
                }
                Some(record) => Err(StoreError::Forbidden(record.status())),
                None => Err(StoreError::NotFound),
            };
        }

        sqlx::query("DELETE FROM project_events WHERE project_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM funding_openings WHERE project_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(project_id = %id, actor = %normalize_address(actor_address), "Draft deleted");
        Ok(())
    }

    /// Unconditional status change. Callers must have established that the
    /// transition is legal; the store only refuses shapes the record type
    /// cannot hold (returning to `DRAFT`, or leaving it without an attachment).
    ///
    /// Leaving `DRAFT` for `ACTIVE` is logged as `FUNDING_OPENED`; every other
    /// change as `STATUS_CHANGED`. Concurrent edits never make it fail: a lost
    /// compare-and-set is re-applied to the fresh record until it lands, so the
    /// only race outcome is `NotFound` when the record has been deleted.
    pub async fn set_status(
        &self,
        id: &str,
        actor_address: &str,
        status: ProjectStatus,
        extras: StatusExtras,
    ) -> StoreResult<ProjectRecord> {
        self.mutate(id, actor_address, None, Retry::UntilApplied, |record| {
            apply_status(record, status, extras.clone())
        })
        .await
    }

    /// Read-modify-write with a compare-and-set on `version`.
    async fn mutate<F>(
        &self,
        id: &str,
        actor_address: &str,
        expected_version: Option<i64>,
        retry: Retry,
        mut apply: F,
    ) -> StoreResult<ProjectRecord>
    where
        F: FnMut(&mut ProjectRecord) -> StoreResult<(EventKind, Option<Value>)>,
    {
        let actor = normalize_address(actor_address);

        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let current = self.read(id).await?.ok_or(StoreError::NotFound)?;
            let mut next = current.clone();
            let (kind, payload) = apply(&mut next)?;

            if let Some(expected) = expected_version {
                if expected != current.version {
                    debug!(
                        project_id = %id,
                        expected,
                        current = current.version,
                        "Stale write rejected"
                    );
                    return Err(StoreError::Conflict(Box::new(current)));
                }
            }

            next.version = current.version + 1;
            next.updated_at = db::now();

            let mut tx = self.pool.begin().await?;
            let updated = sqlx::query(
                r#"
                UPDATE projects
                SET    status = ?1, content = ?2, version = ?3, updated_at = ?4,
                       published_at = ?5, closed_at = ?6
                WHERE  id = ?7 AND version = ?8
                "#,
            )
            .bind(next.status().as_str())
            .bind(encode_content(&next.state)?)
            .bind(next.version)
            .bind(encode_ts(&next.updated_at))
            .bind(next.published_at.as_ref().map(encode_ts))
            .bind(next.closed_at.as_ref().map(encode_ts))
            .bind(id)
            .bind(current.version)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if updated == 0 {
                tx.rollback().await?;
                if expected_version.is_some() {
                    // Lost the race between read and write to another writer.
                    return match self.read(id).await? {
                        Some(latest) => Err(StoreError::Conflict(Box::new(latest))),
                        None => Err(StoreError::NotFound),
                    };
                }
                if retry == Retry::Bounded && attempt >= MAX_CAS_ATTEMPTS {
                    warn!(project_id = %id, "Compare-and-set retries exhausted");
                    return match self.read(id).await? {
                        Some(latest) => Err(StoreError::Conflict(Box::new(latest))),
                        None => Err(StoreError::NotFound),
                    };
                }
                debug!(project_id = %id, attempt, "Compare-and-set lost, retrying");
                tokio::task::yield_now().await;
                continue;
            }

            insert_event(&mut tx, id, kind, &actor, payload).await?;
            tx.commit().await?;
            debug!(project_id = %id, version = next.version, event = kind.as_str(), "Mutation applied");
            return Ok(next);
        }
    }
}

fn apply_status(
    record: &mut ProjectRecord,
    status: ProjectStatus,
    extras: StatusExtras,
) -> StoreResult<(EventKind, Option<Value>)> {
    let now = db::now();
    let previous = record.status();

    let wrap: fn(PublishedProject) -> ProjectState = match status {
        ProjectStatus::Draft => {
            return Err(StoreError::Invalid(
                "a record cannot return to DRAFT".to_string(),
            ))
        }
        ProjectStatus::Active => ProjectState::Active,
        ProjectStatus::Completed => ProjectState::Completed,
        ProjectStatus::Failed => ProjectState::Failed,
    };

    let published = match &record.state {
        ProjectState::Draft(content) => {
            let onchain = extras.onchain.clone().ok_or_else(|| {
                StoreError::Invalid("leaving DRAFT requires an on-chain attachment".to_string())
            })?;
            record.published_at = Some(extras.published_at.unwrap_or(now));
            PublishedProject {
                content: content.clone(),
                onchain,
                raised: extras.raised.clone(),
            }
        }
        ProjectState::Active(p) | ProjectState::Completed(p) | ProjectState::Failed(p) => {
            let mut p = p.clone();
            if let Some(onchain) = &extras.onchain {
                p.onchain = onchain.clone();
            }
            if let Some(raised) = &extras.raised {
                p.raised = Some(raised.clone());
            }
            p
        }
    };

    if matches!(status, ProjectStatus::Completed | ProjectStatus::Failed) {
        record.closed_at = Some(extras.closed_at.unwrap_or(now));
    }

    let kind = if previous == ProjectStatus::Draft && status == ProjectStatus::Active {
        EventKind::FundingOpened
    } else {
        EventKind::StatusChanged
    };
    let payload = json!({
        "from": previous.as_str(),
        "status": status.as_str(),
        "contractAddress": published.onchain.contract_address,
        "snapshotUri": published.onchain.snapshot.uri,
    });

    record.state = wrap(published);
    Ok((kind, Some(payload)))
}

async fn insert_event(
    conn: &mut SqliteConnection,
    project_id: &str,
    kind: EventKind,
    actor: &str,
    payload: Option<Value>,
) -> StoreResult<()> {
    let payload = payload.map(|p| serde_json::to_string(&p)).transpose()?;
    sqlx::query(
        r#"
        INSERT INTO project_events (id, project_id, event_type, timestamp, actor_address, payload)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(project_id)
    .bind(kind.as_str())
    .bind(encode_ts(&db::now()))
    .bind(actor)
    .bind(payload)
    .execute(conn)
    .await?;
    Ok(())
}
