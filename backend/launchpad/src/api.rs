//! Axum REST API handlers.
//!
//! The caller's address arrives in `X-Creator-Address`, bound to the session by
//! the upstream gateway. Drafts are private to their creator; published
//! records and their public events are readable by any caller.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

use crate::events::ProjectEvent;
use crate::ledger::TokenMetadataReader;
use crate::manifest::{build_manifest, ManifestError};
use crate::orchestrator::{ErrorClass, FundingOpener, OpenFundingError, OpenFundingRequest};
use crate::readiness::{self, Readiness, ViolationDetail};
use crate::rules::{is_hex_address, normalize_address};
use crate::store::{RecordStore, StoreError};
use crate::types::{Commitment, ProjectPatch, ProjectRecord, ProjectStatus};

pub const CREATOR_HEADER: &str = "x-creator-address";

#[derive(Clone)]
pub struct AppState {
    pub store: RecordStore,
    pub opener: FundingOpener,
    pub tokens: Arc<dyn TokenMetadataReader>,
}

// ─────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Unauthorized(&'static str),

    #[error("project not found")]
    NotFound,

    #[error("{0}")]
    Forbidden(String),

    #[error("{message}")]
    BadRequest { code: String, message: String },

    #[error("version conflict")]
    Conflict(Box<ProjectRecord>),

    #[error(transparent)]
    Open(OpenFundingError),

    #[error("upstream failure: {0}")]
    Upstream(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn bad_request(code: &str, message: impl Into<String>) -> Self {
        Self::BadRequest {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Open(e) => class_status(e.class()),
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

fn class_status(class: ErrorClass) -> StatusCode {
    match class {
        ErrorClass::Input | ErrorClass::Readiness => StatusCode::BAD_REQUEST,
        ErrorClass::NotFound => StatusCode::NOT_FOUND,
        ErrorClass::Forbidden => StatusCode::FORBIDDEN,
        ErrorClass::Conflict => StatusCode::CONFLICT,
        ErrorClass::External => StatusCode::BAD_GATEWAY,
        ErrorClass::Fatal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => Self::NotFound,
            StoreError::Conflict(current) => Self::Conflict(current),
            StoreError::Forbidden(status) => {
                Self::Forbidden(format!("project is {status}; only drafts can change"))
            }
            // Store messages lead with their code: "CODE: detail".
            StoreError::Invalid(msg) => match msg.split_once(": ") {
                Some((code, detail)) if is_error_code(code) => Self::bad_request(code, detail),
                _ => Self::bad_request("INVALID_INPUT", msg),
            },
            StoreError::Backend(e) => Self::Internal(e.to_string()),
        }
    }
}

fn is_error_code(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_uppercase() || c == '_')
}

impl From<OpenFundingError> for ApiError {
    fn from(e: OpenFundingError) -> Self {
        Self::Open(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match &self {
            Self::Unauthorized(msg) => json!({ "error": "UNAUTHORIZED", "message": msg }),
            Self::NotFound => json!({ "error": "NOT_FOUND", "message": self.to_string() }),
            Self::Forbidden(msg) => json!({ "error": "FORBIDDEN", "message": msg }),
            Self::BadRequest { code, message } => json!({ "error": code, "message": message }),
            Self::Conflict(project) => json!({ "error": "CONFLICT", "project": project }),
            Self::Open(e) => open_error_body(e),
            Self::Upstream(msg) => json!({ "error": "UPSTREAM_FAILED", "message": msg }),
            Self::Internal(msg) => {
                error!("Internal error: {msg}");
                json!({ "error": "INTERNAL", "message": "internal server error" })
            }
        };
        (status, Json(body)).into_response()
    }
}

fn open_error_body(e: &OpenFundingError) -> serde_json::Value {
    let mut body = json!({
        "error": e.code(),
        "message": e.to_string(),
        "class": e.class(),
        "retryable": e.retryable(),
    });
    match e {
        OpenFundingError::NotReady(violations) => {
            let errors: Vec<ViolationDetail> =
                violations.iter().copied().map(ViolationDetail::from).collect();
            body["errors"] = json!(errors);
        }
        OpenFundingError::Conflict(project) => body["project"] = json!(project),
        OpenFundingError::FinalityTimeout { tx_hash }
        | OpenFundingError::CreationEventMissing { tx_hash } => body["txHash"] = json!(tx_hash),
        OpenFundingError::Backend(_) | OpenFundingError::Internal(_) => {
            body["message"] = json!("internal server error");
        }
        _ => {}
    }
    body
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

// ─────────────────────────────────────────────────────────
// Caller identity
// ─────────────────────────────────────────────────────────

/// Normalised address of the caller.
pub fn caller(headers: &HeaderMap) -> ApiResult<String> {
    let raw = headers
        .get(CREATOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or_default();
    if raw.is_empty() {
        return Err(ApiError::Unauthorized("missing X-Creator-Address"));
    }
    if !is_hex_address(raw) {
        return Err(ApiError::Unauthorized("malformed X-Creator-Address"));
    }
    Ok(normalize_address(raw))
}

fn required_body<T>(body: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    body.map(|Json(b)| b)
        .map_err(|e| ApiError::bad_request("INVALID_INPUT", e.body_text()))
}

/// A request without a JSON body reads as the default body.
fn optional_body<T: Default>(body: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    match body {
        Err(JsonRejection::MissingJsonContentType(_)) => Ok(T::default()),
        other => required_body(other),
    }
}

async fn load(state: &AppState, id: &str) -> ApiResult<ProjectRecord> {
    state.store.read(id).await?.ok_or(ApiError::NotFound)
}

/// Load `id` and require that `caller` created it.
async fn load_owned(state: &AppState, id: &str, caller: &str) -> ApiResult<ProjectRecord> {
    let record = load(state, id).await?;
    if record.creator_address != caller {
        warn!(project_id = %id, caller, "Ownership check failed");
        return Err(ApiError::Forbidden("not the creator of this project".to_string()));
    }
    Ok(record)
}

// ─────────────────────────────────────────────────────────
// Request / response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct CreateProjectBody {
    pub status: Option<ProjectStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProjectBody {
    pub if_match_version: Option<i64>,
    #[serde(flatten)]
    pub patch: ProjectPatch,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitmentsBody {
    pub if_match_version: Option<i64>,
    pub items: Vec<Commitment>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenFundingBody {
    pub if_match_version: Option<i64>,
    #[serde(flatten)]
    pub patch: ProjectPatch,
    pub commitments: Option<Vec<Commitment>>,
}

impl From<OpenFundingBody> for OpenFundingRequest {
    fn from(body: OpenFundingBody) -> Self {
        Self {
            patch: Some(body.patch).filter(|p| !p.is_empty()),
            commitments: body.commitments,
            expected_version: body.if_match_version,
        }
    }
}

#[derive(Serialize)]
pub struct ProjectsResponse {
    pub count: usize,
    pub projects: Vec<ProjectRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DraftReadiness {
    Ready,
    Incomplete,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftSummary {
    pub id: String,
    pub title: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub readiness: DraftReadiness,
    pub version: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSummary {
    pub id: String,
    pub title: Option<String>,
    pub raised: String,
    pub target: String,
    pub deadline: Option<String>,
    pub contract: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedSummary {
    pub id: String,
    pub title: Option<String>,
    pub outcome: ProjectStatus,
    pub closed_at: Option<DateTime<Utc>>,
}

/// The caller's records grouped by lifecycle, most recently updated first.
#[derive(Serialize)]
pub struct OverviewResponse {
    pub wallet: String,
    pub drafts: Vec<DraftSummary>,
    pub active: Vec<ActiveSummary>,
    pub archive: Vec<ArchivedSummary>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsResponse {
    pub project_id: String,
    pub count: usize,
    pub events: Vec<ProjectEvent>,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub address: String,
    pub symbol: String,
    pub decimals: u8,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `POST /projects`
pub async fn create_project(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<CreateProjectBody>, JsonRejection>,
) -> ApiResult<Response> {
    let caller = caller(&headers)?;
    let body = optional_body(body)?;
    if body.status.is_some_and(|s| s != ProjectStatus::Draft) {
        return Err(ApiError::bad_request(
            "INVALID_STATUS",
            "new projects start as DRAFT",
        ));
    }
    let record = state.store.create(&caller).await?;
    Ok((StatusCode::CREATED, Json(record)).into_response())
}

/// `GET /projects`
///
/// Every record the caller created, drafts included.
pub async fn list_projects(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<ProjectsResponse>> {
    let caller = caller(&headers)?;
    let projects = state.store.list_by_creator(&caller).await?;
    Ok(Json(ProjectsResponse {
        count: projects.len(),
        projects,
    }))
}

/// `GET /creator/overview`
pub async fn creator_overview(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<OverviewResponse>> {
    let caller = caller(&headers)?;
    let mut projects = state.store.list_by_creator(&caller).await?;
    projects.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

    let default_currency = &state.opener.defaults().currency;
    let mut overview = OverviewResponse {
        wallet: caller,
        drafts: Vec::new(),
        active: Vec::new(),
        archive: Vec::new(),
    };
    for record in projects {
        let content = record.content();
        let title = content.core.title.clone();
        match record.state.published() {
            None => {
                let ready = readiness::check(content, default_currency).is_empty();
                overview.drafts.push(DraftSummary {
                    id: record.id.clone(),
                    title,
                    updated_at: record.updated_at,
                    readiness: if ready {
                        DraftReadiness::Ready
                    } else {
                        DraftReadiness::Incomplete
                    },
                    version: record.version,
                });
            }
            Some(published) if record.status() == ProjectStatus::Active => {
                overview.active.push(ActiveSummary {
                    id: record.id.clone(),
                    title,
                    raised: published.raised.clone().unwrap_or_else(|| "0".to_string()),
                    target: content.funding.target.clone().unwrap_or_else(|| "0".to_string()),
                    deadline: content.funding.deadline.clone(),
                    contract: published.onchain.contract_address.clone(),
                });
            }
            Some(_) => overview.archive.push(ArchivedSummary {
                id: record.id.clone(),
                title,
                outcome: record.status(),
                closed_at: record.closed_at,
            }),
        }
    }
    Ok(Json(overview))
}

/// `GET /projects/:id`
pub async fn get_project(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<ProjectRecord>> {
    let caller = caller(&headers)?;
    let record = load(&state, &id).await?;
    if record.is_draft() && record.creator_address != caller {
        return Err(ApiError::Forbidden("drafts are private to their creator".to_string()));
    }
    Ok(Json(record))
}

/// `PATCH /projects/:id`
pub async fn update_project(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Result<Json<UpdateProjectBody>, JsonRejection>,
) -> ApiResult<Json<ProjectRecord>> {
    let caller = caller(&headers)?;
    let body = required_body(body)?;
    load_owned(&state, &id, &caller).await?;
    let record = state
        .store
        .update(&id, &caller, &body.patch, body.if_match_version)
        .await?;
    Ok(Json(record))
}

/// `DELETE /projects/:id`
pub async fn delete_project(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let caller = caller(&headers)?;
    load_owned(&state, &id, &caller).await?;
    state.store.delete_draft(&id, &caller).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `PUT /projects/:id/commitments`
pub async fn replace_commitments(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Result<Json<CommitmentsBody>, JsonRejection>,
) -> ApiResult<Json<ProjectRecord>> {
    let caller = caller(&headers)?;
    let body = required_body(body)?;
    load_owned(&state, &id, &caller).await?;
    let record = state
        .store
        .update_commitments(&id, &caller, body.items, body.if_match_version)
        .await?;
    Ok(Json(record))
}

/// `POST /projects/:id/validate-open`
pub async fn validate_open(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Readiness>> {
    let caller = caller(&headers)?;
    let record = load_owned(&state, &id, &caller).await?;
    let violations = readiness::check(record.content(), &state.opener.defaults().currency);
    Ok(Json(Readiness::from_violations(&violations)))
}

/// `GET /projects/:id/manifest`
///
/// Preview of the snapshot document that opening funding would publish.
pub async fn get_manifest(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let caller = caller(&headers)?;
    let record = load_owned(&state, &id, &caller).await?;
    match build_manifest(&record) {
        Ok(manifest) => Ok(Json(manifest).into_response()),
        Err(ManifestError::InvalidExternalLinks(issues)) => Err(ApiError::bad_request(
            "INVALID_EXTERNAL_LINKS",
            issues.join("; "),
        )),
    }
}

/// `POST /projects/:id/open-funding`
///
/// Optional body carries edits to flush before validation.
pub async fn open_funding(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Result<Json<OpenFundingBody>, JsonRejection>,
) -> ApiResult<Response> {
    let caller = caller(&headers)?;
    let request = optional_body(body)?.into();
    load_owned(&state, &id, &caller).await?;
    let outcome = state.opener.open(&id, &caller, request).await?;
    Ok(Json(outcome).into_response())
}

/// `GET /projects/:id/events`
///
/// Public history: events at or after publication. Drafts have none.
pub async fn get_project_events(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<EventsResponse>> {
    let record = load(&state, &project_id).await?;
    let events = match record.published_at {
        None => Vec::new(),
        Some(published_at) => state
            .store
            .events(&project_id)
            .await?
            .into_iter()
            .filter(|e| e.timestamp >= published_at)
            .collect(),
    };
    Ok(Json(EventsResponse {
        project_id,
        count: events.len(),
        events,
    }))
}

/// `GET /tokens/:address`
pub async fn get_token(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> ApiResult<Json<TokenResponse>> {
    if !is_hex_address(address.trim()) {
        return Err(ApiError::bad_request("INVALID_ADDRESS", "expected a 0x-prefixed address"));
    }
    let address = normalize_address(&address);
    let symbol = state
        .tokens
        .symbol(&address)
        .await
        .map_err(|e| ApiError::Upstream(e.to_string()))?;
    let decimals = state
        .tokens
        .decimals(&address)
        .await
        .map_err(|e| ApiError::Upstream(e.to_string()))?;
    Ok(Json(TokenResponse {
        address,
        symbol,
        decimals,
    }))
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
