//! # Types
//!
//! Shared data structures for project records.
//!
//! ## Status as a sum type
//!
//! A record's content lives inside its [`ProjectState`]. Only the `Draft`
//! variant hands out a mutable [`ProjectContent`]; published variants carry a
//! frozen copy together with the non-null [`OnchainAttachment`]:
//!
//! ```text
//! Draft ──► Active ──► Completed
//!             └──────► Failed
//! ```
//!
//! A draft may also be deleted outright.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Maximum number of delivery commitments per project.
pub const MAX_COMMITMENTS: usize = 5;
/// Maximum number of external links per project.
pub const MAX_EXTERNAL_LINKS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProjectStatus {
    Draft,
    Active,
    Completed,
    Failed,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::Active => "ACTIVE",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DRAFT" => Ok(Self::Draft),
            "ACTIVE" => Ok(Self::Active),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown project status {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProjectCategory {
    Software,
    Hardware,
    Media,
    Publishing,
    Games,
    Education,
    ScienceTools,
    CommunityPublicGoods,
    Environment,
    Other,
}

impl ProjectCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Software => "SOFTWARE",
            Self::Hardware => "HARDWARE",
            Self::Media => "MEDIA",
            Self::Publishing => "PUBLISHING",
            Self::Games => "GAMES",
            Self::Education => "EDUCATION",
            Self::ScienceTools => "SCIENCE_TOOLS",
            Self::CommunityPublicGoods => "COMMUNITY_PUBLIC_GOODS",
            Self::Environment => "ENVIRONMENT",
            Self::Other => "OTHER",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliverableType {
    Prototype,
    Alpha,
    Beta,
    PublicRelease,
    MfgBatch,
    Shipment,
    AuditReview,
    EventScreening,
    ReportDataset,
    GovAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationMethod {
    PublicLink,
    OnchainProof,
    ThirdPartyDoc,
    DeliveryEvidence,
    CommunityVote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureConsequence {
    FullRefund,
    PartialRefund,
    PauseUntilResolved,
    DeadlineExtensionVote,
    OpenSourceRelease,
    MilestoneRemovedEscrow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReleaseModel {
    AllOrNothing,
    Milestone,
}

impl ReleaseModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AllOrNothing => "ALL_OR_NOTHING",
            Self::Milestone => "MILESTONE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExternalLinkType {
    Website,
    Docs,
    Media,
    Repo,
    Audit,
    Social,
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectCore {
    pub title: Option<String>,
    pub category: Option<ProjectCategory>,
    pub definition: Option<String>,
    /// Required example deliverable when the category is `OTHER`.
    pub deliverable_example: Option<String>,
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalLink {
    /// Stable row id supplied by the editor.
    pub id: String,
    #[serde(rename = "type")]
    pub link_type: ExternalLinkType,
    pub label: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Milestone {
    pub name: String,
    pub percent: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MilestonePlan {
    pub initial_percent: u32,
    pub milestones: Vec<Milestone>,
}

impl MilestonePlan {
    /// Initial share followed by every milestone share.
    pub fn percents(&self) -> Vec<u32> {
        std::iter::once(self.initial_percent)
            .chain(self.milestones.iter().map(|m| m.percent))
            .collect()
    }
}

/// Funding terms edited while the record is a draft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FundingTerms {
    /// Display label (e.g. "USDC"); the token itself is `token_address`.
    pub currency: Option<String>,
    pub token_address: Option<String>,
    pub token_decimals: Option<u8>,
    pub target: Option<String>,
    pub minimum_allocation: Option<String>,
    /// `YYYY-MM-DD`
    pub deadline: Option<String>,
    pub release_model: Option<ReleaseModel>,
    pub milestone_plan: Option<MilestonePlan>,
    pub vote_duration_days: Option<u32>,
    pub quorum_bps: Option<u16>,
    pub stamp_uri: Option<String>,
}

impl Default for FundingTerms {
    fn default() -> Self {
        Self {
            currency: Some("USDC".to_string()),
            token_address: None,
            token_decimals: None,
            target: None,
            minimum_allocation: None,
            deadline: None,
            release_model: Some(ReleaseModel::Milestone),
            milestone_plan: None,
            vote_duration_days: None,
            quorum_bps: None,
            stamp_uri: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Commitment {
    pub deliverable_type: DeliverableType,
    /// `YYYY-MM-DD`
    pub deadline: String,
    pub verification_method: VerificationMethod,
    pub verification_details: String,
    pub failure_consequence: FailureConsequence,
    /// Required with `PARTIAL_REFUND`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refund_percent: Option<f64>,
    /// Optional with `DEADLINE_EXTENSION_VOTE`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vote_duration_days: Option<f64>,
    pub details: String,
}

/// Everything a creator edits. Frozen once funding opens.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectContent {
    pub core: ProjectCore,
    #[serde(default)]
    pub external_links: Vec<ExternalLink>,
    pub funding: FundingTerms,
    #[serde(default)]
    pub commitments: Vec<Commitment>,
}

/// Reference returned by content-addressed storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRef {
    pub content_id: String,
    pub uri: String,
    pub gateway_url: Option<String>,
}

/// Ledger deployment details, present on every published record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnchainAttachment {
    pub contract_address: String,
    pub chain_id: u64,
    pub onchain_project_id: u64,
    pub opened_tx_hash: String,
    pub accepted_token: String,
    pub token_decimals: u8,
    pub snapshot: SnapshotRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedProject {
    #[serde(flatten)]
    pub content: ProjectContent,
    pub onchain: OnchainAttachment,
    /// Observed from the ledger; never written by the creator.
    pub raised: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProjectState {
    Draft(ProjectContent),
    Active(PublishedProject),
    Completed(PublishedProject),
    Failed(PublishedProject),
}

impl ProjectState {
    pub fn status(&self) -> ProjectStatus {
        match self {
            Self::Draft(_) => ProjectStatus::Draft,
            Self::Active(_) => ProjectStatus::Active,
            Self::Completed(_) => ProjectStatus::Completed,
            Self::Failed(_) => ProjectStatus::Failed,
        }
    }

    pub fn content(&self) -> &ProjectContent {
        match self {
            Self::Draft(content) => content,
            Self::Active(p) | Self::Completed(p) | Self::Failed(p) => &p.content,
        }
    }

    pub fn published(&self) -> Option<&PublishedProject> {
        match self {
            Self::Draft(_) => None,
            Self::Active(p) | Self::Completed(p) | Self::Failed(p) => Some(p),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRecord {
    pub id: String,
    pub creator_address: String,
    #[serde(flatten)]
    pub state: ProjectState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub version: i64,
}

impl ProjectRecord {
    pub fn status(&self) -> ProjectStatus {
        self.state.status()
    }

    pub fn is_draft(&self) -> bool {
        matches!(self.state, ProjectState::Draft(_))
    }

    pub fn content(&self) -> &ProjectContent {
        self.state.content()
    }

    pub fn draft_mut(&mut self) -> Option<&mut ProjectContent> {
        match &mut self.state {
            ProjectState::Draft(content) => Some(content),
            _ => None,
        }
    }

    pub fn onchain(&self) -> Option<&OnchainAttachment> {
        self.state.published().map(|p| &p.onchain)
    }
}

// ─────────────────────────────────────────────────────────
// Patches
// ─────────────────────────────────────────────────────────

/// Distinguishes an absent key (`None`) from an explicit `null` (`Some(None)`).
fn double_option<'de, T, D>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(de).map(Some)
}

macro_rules! patch_struct {
    ($(#[$meta:meta])* $name:ident => $target:ty { $($field:ident: $ty:ty),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub struct $name {
            $(
                #[serde(default, deserialize_with = "double_option")]
                pub $field: Option<Option<$ty>>,
            )*
        }

        impl $name {
            pub fn apply_to(&self, target: &mut $target) {
                $(
                    if let Some(value) = &self.$field {
                        target.$field = value.clone();
                    }
                )*
            }

            pub fn is_empty(&self) -> bool {
                true $(&& self.$field.is_none())*
            }
        }
    };
}

patch_struct! {
    /// Partial update of [`ProjectCore`].
    CorePatch => ProjectCore {
        title: String,
        category: ProjectCategory,
        definition: String,
        deliverable_example: String,
        explanation: String,
    }
}

patch_struct! {
    /// Partial update of [`FundingTerms`].
    FundingPatch => FundingTerms {
        currency: String,
        token_address: String,
        token_decimals: u8,
        target: String,
        minimum_allocation: String,
        deadline: String,
        release_model: ReleaseModel,
        milestone_plan: MilestonePlan,
        vote_duration_days: u32,
        quorum_bps: u16,
        stamp_uri: String,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectPatch {
    #[serde(default)]
    pub core: Option<CorePatch>,
    #[serde(default)]
    pub funding: Option<FundingPatch>,
    #[serde(default)]
    pub external_links: Option<Vec<ExternalLink>>,
}

impl ProjectPatch {
    pub fn apply_to(&self, content: &mut ProjectContent) {
        if let Some(core) = &self.core {
            core.apply_to(&mut content.core);
        }
        if let Some(funding) = &self.funding {
            funding.apply_to(&mut content.funding);
        }
        if let Some(links) = &self.external_links {
            content.external_links = links.clone();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.core.as_ref().map_or(true, CorePatch::is_empty)
            && self.funding.as_ref().map_or(true, FundingPatch::is_empty)
            && self.external_links.is_none()
    }

    /// Field groups touched by this patch, for the event payload.
    pub fn touched_groups(&self) -> Vec<&'static str> {
        let mut groups = Vec::new();
        if self.core.as_ref().is_some_and(|c| !c.is_empty()) {
            groups.push("core");
        }
        if self.funding.as_ref().is_some_and(|f| !f.is_empty()) {
            groups.push("funding");
        }
        if self.external_links.is_some() {
            groups.push("externalLinks");
        }
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_distinguishes_absent_from_null() {
        let mut core = ProjectCore {
            title: Some("Old".into()),
            explanation: Some("keep".into()),
            ..Default::default()
        };
        let patch: CorePatch =
            serde_json::from_str(r#"{"title":"New","deliverableExample":null}"#).unwrap();
        patch.apply_to(&mut core);
        assert_eq!(core.title.as_deref(), Some("New"));
        assert_eq!(core.explanation.as_deref(), Some("keep"));

        let clear: CorePatch = serde_json::from_str(r#"{"explanation":null}"#).unwrap();
        clear.apply_to(&mut core);
        assert_eq!(core.explanation, None);
    }

    #[test]
    fn unknown_enum_values_are_rejected() {
        let res: Result<CorePatch, _> = serde_json::from_str(r#"{"category":"SPACESHIPS"}"#);
        assert!(res.is_err());
    }

    #[test]
    fn record_serializes_flat_with_status_tag() {
        let now = Utc::now();
        let record = ProjectRecord {
            id: "p1".into(),
            creator_address: "0xabc".into(),
            state: ProjectState::Draft(ProjectContent::default()),
            created_at: now,
            updated_at: now,
            published_at: None,
            closed_at: None,
            version: 1,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "DRAFT");
        assert_eq!(json["funding"]["currency"], "USDC");
        assert_eq!(json["funding"]["releaseModel"], "MILESTONE");
        assert!(json["commitments"].as_array().unwrap().is_empty());
        assert_eq!(json["version"], 1);
    }

    #[test]
    fn milestone_plan_percents_include_initial_share() {
        let plan = MilestonePlan {
            initial_percent: 20,
            milestones: vec![
                Milestone { name: "a".into(), percent: 40 },
                Milestone { name: "b".into(), percent: 40 },
            ],
        };
        assert_eq!(plan.percents(), vec![20, 40, 40]);
    }

    #[test]
    fn patch_reports_touched_groups() {
        let patch: ProjectPatch =
            serde_json::from_str(r#"{"core":{"title":"X"},"funding":{}}"#).unwrap();
        assert_eq!(patch.touched_groups(), vec!["core"]);
        assert!(!patch.is_empty());
        assert!(ProjectPatch::default().is_empty());
    }
}
