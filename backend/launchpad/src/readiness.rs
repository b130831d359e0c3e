//! # Readiness
//!
//! Decides whether a draft may open funding. The check is a pure function of
//! the record content: every rule runs (nothing short-circuits) and the
//! resulting codes come back deduplicated, ordered by check group.
//!
//! The server's evaluation is the only one that gates the transition; clients
//! may run the same rules for early feedback.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::rules::{
    char_len, clean_text, has_conditional_language, has_link, is_hex_address,
    is_integer_in_range, is_iso_date,
};
use crate::types::{
    Commitment, FailureConsequence, ProjectCategory, ProjectContent, ReleaseModel,
    MAX_COMMITMENTS,
};

pub const MAX_DEFINITION_CHARS: usize = 400;
pub const MAX_OTHER_DEFINITION_CHARS: usize = 200;
pub const MAX_SHORT_TEXT_CHARS: usize = 150;
pub const MAX_TOKEN_DECIMALS: u8 = 30;

/// Violation codes. Declaration order is the reporting order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Violation {
    // 1–2: identity
    MissingTitle,
    MissingCategory,
    // 3: definition
    DefinitionEmpty,
    DefinitionHasLinks,
    DefinitionTooLong,
    OtherDefinitionTooLong,
    OtherDeliverableExampleRequired,
    OtherDeliverableExampleInvalid,
    // 4: funding block
    FundingIncomplete,
    DeadlineInvalid,
    // 5: milestone plan vs commitments
    MilestonePlanMissing,
    MilestonesExceedCommitments,
    // 6: commitments
    MissingCommitments,
    CommitmentsTooMany,
    CommitmentsIncomplete,
    CommitmentsTextTooLong,
    CommitmentsHaveConditionals,
    CommitmentsDetailsHasLinks,
    CommitmentsDeadlineInvalid,
    CommitmentsRefundInvalid,
    CommitmentsVoteDurationInvalid,
    // 7: token policy
    MissingTokenAddress,
    TokenAddressInvalid,
    TokenDecimalsInvalid,
}

impl Violation {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingTitle => "MISSING_TITLE",
            Self::MissingCategory => "MISSING_CATEGORY",
            Self::DefinitionEmpty => "DEFINITION_EMPTY",
            Self::DefinitionHasLinks => "DEFINITION_HAS_LINKS",
            Self::DefinitionTooLong => "DEFINITION_TOO_LONG",
            Self::OtherDefinitionTooLong => "OTHER_DEFINITION_TOO_LONG",
            Self::OtherDeliverableExampleRequired => "OTHER_DELIVERABLE_EXAMPLE_REQUIRED",
            Self::OtherDeliverableExampleInvalid => "OTHER_DELIVERABLE_EXAMPLE_INVALID",
            Self::FundingIncomplete => "FUNDING_INCOMPLETE",
            Self::DeadlineInvalid => "DEADLINE_INVALID",
            Self::MilestonePlanMissing => "MILESTONE_PLAN_MISSING",
            Self::MilestonesExceedCommitments => "MILESTONES_EXCEED_COMMITMENTS",
            Self::MissingCommitments => "MISSING_COMMITMENTS",
            Self::CommitmentsTooMany => "COMMITMENTS_TOO_MANY",
            Self::CommitmentsIncomplete => "COMMITMENTS_INCOMPLETE",
            Self::CommitmentsTextTooLong => "COMMITMENTS_TEXT_TOO_LONG",
            Self::CommitmentsHaveConditionals => "COMMITMENTS_HAVE_CONDITIONALS",
            Self::CommitmentsDetailsHasLinks => "COMMITMENTS_DETAILS_HAS_LINKS",
            Self::CommitmentsDeadlineInvalid => "COMMITMENTS_DEADLINE_INVALID",
            Self::CommitmentsRefundInvalid => "COMMITMENTS_REFUND_INVALID",
            Self::CommitmentsVoteDurationInvalid => "COMMITMENTS_VOTE_DURATION_INVALID",
            Self::MissingTokenAddress => "MISSING_TOKEN_ADDRESS",
            Self::TokenAddressInvalid => "TOKEN_ADDRESS_INVALID",
            Self::TokenDecimalsInvalid => "TOKEN_DECIMALS_INVALID",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::MissingTitle => "Title is required.",
            Self::MissingCategory => "Category is required.",
            Self::DefinitionEmpty => "Project definition is required.",
            Self::DefinitionHasLinks => "Project definition must not contain links.",
            Self::DefinitionTooLong => "Project definition must be 400 characters or less.",
            Self::OtherDefinitionTooLong => "For Other, definition must be 200 characters or less.",
            Self::OtherDeliverableExampleRequired => "For Other, an example deliverable is required.",
            Self::OtherDeliverableExampleInvalid => {
                "Example deliverable must be 150 characters or less and not contain links or conditionals."
            }
            Self::FundingIncomplete => "Funding structure is incomplete.",
            Self::DeadlineInvalid => "Deadline is invalid.",
            Self::MilestonePlanMissing => "Milestone release needs a milestone plan.",
            Self::MilestonesExceedCommitments => "Each milestone must be backed by a commitment.",
            Self::MissingCommitments => "At least one commitment is required.",
            Self::CommitmentsTooMany => "At most 5 commitments are allowed.",
            Self::CommitmentsIncomplete => "Some commitments are incomplete.",
            Self::CommitmentsTextTooLong => "Commitment texts must be 150 characters or less.",
            Self::CommitmentsHaveConditionals => {
                "Commitments must not contain conditionals (aim/hope/try/plan/etc)."
            }
            Self::CommitmentsDetailsHasLinks => "Commitment details must not contain links.",
            Self::CommitmentsDeadlineInvalid => "Some commitment deadlines are invalid.",
            Self::CommitmentsRefundInvalid => {
                "Partial refund commitments must include a percent (1–100)."
            }
            Self::CommitmentsVoteDurationInvalid => {
                "Extension vote duration must be a whole number of days (1–14)."
            }
            Self::MissingTokenAddress => "Accepted token address is required.",
            Self::TokenAddressInvalid => "Token address must be a 0x address.",
            Self::TokenDecimalsInvalid => "Token decimals must be an integer between 0 and 30.",
        }
    }

    /// Field group the violation points at.
    pub fn field(&self) -> &'static str {
        match self {
            Self::MissingTitle
            | Self::MissingCategory
            | Self::DefinitionEmpty
            | Self::DefinitionHasLinks
            | Self::DefinitionTooLong
            | Self::OtherDefinitionTooLong
            | Self::OtherDeliverableExampleRequired
            | Self::OtherDeliverableExampleInvalid => "core",
            Self::FundingIncomplete
            | Self::DeadlineInvalid
            | Self::MilestonePlanMissing
            | Self::MissingTokenAddress
            | Self::TokenAddressInvalid
            | Self::TokenDecimalsInvalid => "funding",
            Self::MilestonesExceedCommitments
            | Self::MissingCommitments
            | Self::CommitmentsTooMany
            | Self::CommitmentsIncomplete
            | Self::CommitmentsTextTooLong
            | Self::CommitmentsHaveConditionals
            | Self::CommitmentsDetailsHasLinks
            | Self::CommitmentsDeadlineInvalid
            | Self::CommitmentsRefundInvalid
            | Self::CommitmentsVoteDurationInvalid => "commitments",
        }
    }
}

/// Structured form returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViolationDetail {
    pub code: &'static str,
    pub message: &'static str,
    pub field: &'static str,
}

impl From<Violation> for ViolationDetail {
    fn from(v: Violation) -> Self {
        Self {
            code: v.code(),
            message: v.message(),
            field: v.field(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Readiness {
    pub ok: bool,
    pub errors: Vec<ViolationDetail>,
}

impl Readiness {
    pub fn from_violations(violations: &[Violation]) -> Self {
        Self {
            ok: violations.is_empty(),
            errors: violations.iter().copied().map(ViolationDetail::from).collect(),
        }
    }
}

/// Run every rule. An empty result means the draft is ready.
pub fn check(content: &ProjectContent, default_currency: &str) -> Vec<Violation> {
    let mut out = BTreeSet::new();
    check_core(content, &mut out);
    check_funding(content, &mut out);
    check_milestones(content, &mut out);
    check_commitments(&content.commitments, &mut out);
    check_token(content, default_currency, &mut out);
    out.into_iter().collect()
}

fn check_core(content: &ProjectContent, out: &mut BTreeSet<Violation>) {
    let core = &content.core;
    if clean_text(core.title.as_deref()).is_none() {
        out.insert(Violation::MissingTitle);
    }
    if core.category.is_none() {
        out.insert(Violation::MissingCategory);
    }

    let definition = core.definition.as_deref().unwrap_or("").trim();
    if definition.is_empty() {
        out.insert(Violation::DefinitionEmpty);
    }
    if has_link(definition) {
        out.insert(Violation::DefinitionHasLinks);
    }

    if core.category == Some(ProjectCategory::Other) {
        if char_len(definition) > MAX_OTHER_DEFINITION_CHARS {
            out.insert(Violation::OtherDefinitionTooLong);
        }
        match clean_text(core.deliverable_example.as_deref()) {
            None => {
                out.insert(Violation::OtherDeliverableExampleRequired);
            }
            Some(example) => {
                if char_len(example) > MAX_SHORT_TEXT_CHARS
                    || has_link(example)
                    || has_conditional_language(example)
                {
                    out.insert(Violation::OtherDeliverableExampleInvalid);
                }
            }
        }
    } else if char_len(definition) > MAX_DEFINITION_CHARS {
        out.insert(Violation::DefinitionTooLong);
    }
}

fn check_funding(content: &ProjectContent, out: &mut BTreeSet<Violation>) {
    let f = &content.funding;
    let complete = clean_text(f.currency.as_deref()).is_some()
        && clean_text(f.target.as_deref()).is_some()
        && clean_text(f.minimum_allocation.as_deref()).is_some()
        && clean_text(f.deadline.as_deref()).is_some()
        && f.release_model.is_some();
    if !complete {
        out.insert(Violation::FundingIncomplete);
    }
    if let Some(deadline) = clean_text(f.deadline.as_deref()) {
        if !is_iso_date(deadline) {
            out.insert(Violation::DeadlineInvalid);
        }
    }
}

fn check_milestones(content: &ProjectContent, out: &mut BTreeSet<Violation>) {
    if content.funding.release_model != Some(ReleaseModel::Milestone) {
        return;
    }
    match &content.funding.milestone_plan {
        None => {
            out.insert(Violation::MilestonePlanMissing);
        }
        Some(plan) => {
            if content.commitments.len() < plan.milestones.len() {
                out.insert(Violation::MilestonesExceedCommitments);
            }
        }
    }
}

fn check_commitments(items: &[Commitment], out: &mut BTreeSet<Violation>) {
    if items.is_empty() {
        out.insert(Violation::MissingCommitments);
        return;
    }
    if items.len() > MAX_COMMITMENTS {
        out.insert(Violation::CommitmentsTooMany);
    }

    for c in items {
        let deadline = c.deadline.trim();
        let verification = c.verification_details.trim();
        let details = c.details.trim();

        if deadline.is_empty() || verification.is_empty() || details.is_empty() {
            out.insert(Violation::CommitmentsIncomplete);
        }
        if !deadline.is_empty() && !is_iso_date(deadline) {
            out.insert(Violation::CommitmentsDeadlineInvalid);
        }
        if char_len(verification) > MAX_SHORT_TEXT_CHARS || char_len(details) > MAX_SHORT_TEXT_CHARS
        {
            out.insert(Violation::CommitmentsTextTooLong);
        }
        if has_conditional_language(verification) || has_conditional_language(details) {
            out.insert(Violation::CommitmentsHaveConditionals);
        }
        if has_link(details) {
            out.insert(Violation::CommitmentsDetailsHasLinks);
        }

        match c.failure_consequence {
            FailureConsequence::PartialRefund => {
                let valid = c
                    .refund_percent
                    .is_some_and(|p| is_integer_in_range(p, 1, 100));
                if !valid {
                    out.insert(Violation::CommitmentsRefundInvalid);
                }
            }
            FailureConsequence::DeadlineExtensionVote => {
                if let Some(days) = c.vote_duration_days {
                    if !is_integer_in_range(days, 1, 14) {
                        out.insert(Violation::CommitmentsVoteDurationInvalid);
                    }
                }
            }
            _ => {}
        }
    }
}

fn check_token(content: &ProjectContent, default_currency: &str, out: &mut BTreeSet<Violation>) {
    let f = &content.funding;
    let is_default = clean_text(f.currency.as_deref())
        .map_or(true, |c| c.eq_ignore_ascii_case(default_currency));
    let address = clean_text(f.token_address.as_deref());

    match address {
        Some(addr) if !is_hex_address(addr) => {
            out.insert(Violation::TokenAddressInvalid);
        }
        None if !is_default => {
            out.insert(Violation::MissingTokenAddress);
        }
        _ => {}
    }

    let decimals_ok = f.token_decimals.map_or(false, |d| d <= MAX_TOKEN_DECIMALS);
    if !is_default && !decimals_ok {
        out.insert(Violation::TokenDecimalsInvalid);
    }
    if is_default && f.token_decimals.is_some_and(|d| d > MAX_TOKEN_DECIMALS) {
        out.insert(Violation::TokenDecimalsInvalid);
    }
}
