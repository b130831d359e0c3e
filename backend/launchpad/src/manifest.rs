//! Snapshot document pinned to content-addressed storage when funding opens.
//!
//! The document is a pure function of the record: no generated ids, no clock
//! reads. Building it twice from the same record yields equal documents.

use serde::Serialize;
use thiserror::Error;

use crate::links::{publishable_rows, validate_publish_links};
use crate::rules::clean_text;
use crate::types::{
    Commitment, ExternalLinkType, MilestonePlan, ProjectRecord, ProjectStatus,
};

pub const MANIFEST_SCHEMA: &str = "launchpad.project.v1";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("INVALID_EXTERNAL_LINKS: {}", .0.join("; "))]
    InvalidExternalLinks(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestFunding {
    pub currency: String,
    pub token_address: Option<String>,
    pub token_decimals: Option<u8>,
    pub target: String,
    pub minimum_allocation: String,
    pub deadline: String,
    pub release_model: String,
    pub milestone_plan: Option<MilestonePlan>,
    pub vote_duration_days: Option<u32>,
    pub quorum_bps: Option<u16>,
    pub stamp_uri: Option<String>,

    // Deployment facts; null until the record is published. The pinned
    // snapshot predates deployment, so it always carries nulls here.
    pub accepted_token: Option<String>,
    pub chain_id: Option<u64>,
    pub contract_address: Option<String>,
    pub onchain_project_id: Option<u64>,
    #[serde(rename = "projectURI")]
    pub project_uri: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestLink {
    #[serde(rename = "type")]
    pub link_type: ExternalLinkType,
    pub label: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attribute {
    pub trait_type: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectManifest {
    pub schema: &'static str,
    pub project_id: String,
    pub status: ProjectStatus,
    pub creator: String,
    pub created_at: String,
    pub published_at: Option<String>,

    pub title: String,
    pub category: String,
    pub definition: String,
    pub deliverable_example: Option<String>,
    pub explanation: Option<String>,

    pub funding: ManifestFunding,
    pub commitments: Vec<Commitment>,
    pub external_links: Vec<ManifestLink>,

    // Marketplace / explorer display fields.
    pub name: String,
    pub description: String,
    pub attributes: Vec<Attribute>,
}

fn owned(value: Option<&String>) -> Option<String> {
    clean_text(value.map(String::as_str)).map(str::to_string)
}

/// Build the snapshot for `record`, applying the strict publish-time link rules.
pub fn build_manifest(record: &ProjectRecord) -> Result<ProjectManifest, ManifestError> {
    let content = record.content();
    let core = &content.core;
    let funding = &content.funding;
    let onchain = record.onchain();

    let links = publishable_rows(&content.external_links);
    validate_publish_links(&links).map_err(ManifestError::InvalidExternalLinks)?;

    let title = owned(core.title.as_ref()).unwrap_or_else(|| "Untitled project".to_string());
    let category = core
        .category
        .map_or_else(|| "UNKNOWN".to_string(), |c| c.as_str().to_string());
    let definition = owned(core.definition.as_ref()).unwrap_or_default();
    let explanation = owned(core.explanation.as_ref());
    let currency = owned(funding.currency.as_ref()).unwrap_or_else(|| "USDC".to_string());
    let release_model = funding
        .release_model
        .map(|m| m.as_str().to_string())
        .unwrap_or_default();

    let description = match &explanation {
        Some(exp) => format!("{definition}\n\n{exp}"),
        None => definition.clone(),
    };

    let attributes = [
        ("Category", category.clone()),
        ("Currency", currency.clone()),
        ("Release model", release_model.clone()),
    ]
    .into_iter()
    .filter(|(_, value)| !value.trim().is_empty())
    .map(|(trait_type, value)| Attribute { trait_type, value })
    .collect();

    Ok(ProjectManifest {
        schema: MANIFEST_SCHEMA,
        project_id: record.id.clone(),
        status: record.status(),
        creator: record.creator_address.clone(),
        created_at: crate::db::encode_ts(&record.created_at),
        published_at: record.published_at.as_ref().map(crate::db::encode_ts),

        name: title.clone(),
        title,
        category,
        definition,
        deliverable_example: owned(core.deliverable_example.as_ref()),
        explanation,

        funding: ManifestFunding {
            currency,
            token_address: owned(funding.token_address.as_ref()),
            token_decimals: funding.token_decimals,
            target: owned(funding.target.as_ref()).unwrap_or_default(),
            minimum_allocation: owned(funding.minimum_allocation.as_ref()).unwrap_or_default(),
            deadline: owned(funding.deadline.as_ref()).unwrap_or_default(),
            release_model,
            milestone_plan: funding.milestone_plan.clone(),
            vote_duration_days: funding.vote_duration_days,
            quorum_bps: funding.quorum_bps,
            stamp_uri: owned(funding.stamp_uri.as_ref()),
            accepted_token: onchain.map(|o| o.accepted_token.clone()),
            chain_id: onchain.map(|o| o.chain_id),
            contract_address: onchain.map(|o| o.contract_address.clone()),
            onchain_project_id: onchain.map(|o| o.onchain_project_id),
            project_uri: onchain.map(|o| o.snapshot.uri.clone()),
        },
        commitments: content.commitments.clone(),
        external_links: links
            .into_iter()
            .map(|l| ManifestLink {
                link_type: l.link_type,
                label: l.label,
                url: l.url,
            })
            .collect(),

        description,
        attributes,
    })
}

/// Name under which the snapshot is pinned.
pub fn snapshot_name(record: &ProjectRecord) -> String {
    format!("launchpad-project-{}", record.id)
}
