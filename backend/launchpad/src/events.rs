//! Project event log entries.
//!
//! One event is appended for every accepted record mutation. Events are never
//! rewritten; they disappear only together with a deleted draft.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// All recognised event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    /// A draft was created.
    Created,
    /// `core`, `funding` or external links were edited.
    Edited,
    /// The commitment list was replaced.
    CommitmentsUpdated,
    /// The draft was frozen and attached to a ledger contract.
    FundingOpened,
    /// Any later status change observed from the ledger.
    StatusChanged,
}

impl EventKind {
    /// Parse the stored identifier back into an [`EventKind`].
    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "CREATED" => Some(Self::Created),
            "EDITED" => Some(Self::Edited),
            "COMMITMENTS_UPDATED" => Some(Self::CommitmentsUpdated),
            "FUNDING_OPENED" => Some(Self::FundingOpened),
            "STATUS_CHANGED" => Some(Self::StatusChanged),
            _ => None,
        }
    }

    /// Return the identifier stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Edited => "EDITED",
            Self::CommitmentsUpdated => "COMMITMENTS_UPDATED",
            Self::FundingOpened => "FUNDING_OPENED",
            Self::StatusChanged => "STATUS_CHANGED",
        }
    }
}

/// A decoded event, as returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectEvent {
    pub id: String,
    pub project_id: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub actor_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// A raw event row as stored in / read from the database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EventRow {
    pub seq: i64,
    pub id: String,
    pub project_id: String,
    pub event_type: String,
    pub timestamp: String,
    pub actor_address: String,
    pub payload: Option<String>,
}
