//! Ledger deployment parameters derived from a ready record.
//!
//! Everything here is deterministic: the same content, defaults and token
//! decimals always produce the same [`DeploymentParams`]. The only external
//! input, an on-chain `decimals()` read, is performed by the caller and passed
//! in.

use chrono::{NaiveTime, TimeZone, Utc};
use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::config::FundingDefaults;
use crate::readiness::MAX_TOKEN_DECIMALS;
use crate::rules::{clean_text, normalize_address, parse_iso_date, sums_to_hundred};
use crate::types::{FundingTerms, MilestonePlan, ReleaseModel};

const SECONDS_PER_DAY: u64 = 86_400;
const FULL_RELEASE_BPS: u16 = 10_000;
const MAX_QUORUM_BPS: u16 = 10_000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParamError {
    #[error("accepted token address is required for currency {0}")]
    MissingTokenAddress(String),

    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("{field} is not a valid amount: {reason}")]
    InvalidAmount { field: &'static str, reason: String },

    #[error("{0} must be greater than zero")]
    NonPositiveAmount(&'static str),

    #[error("token decimals {0} exceed the maximum of 30")]
    DecimalsOutOfRange(u8),

    #[error("deadline {0:?} is not a valid date")]
    InvalidDeadline(String),

    #[error("quorum {0} bps exceeds 10000")]
    QuorumOutOfRange(u16),

    #[error("milestone release needs a milestone plan")]
    MilestonePlanMissing,

    #[error("release schedule sums to {sum}% (shares {parts:?}); it must total exactly 100%")]
    ScheduleMismatch { sum: u64, parts: Vec<u32> },
}

/// Arguments of the factory's `createProject` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentParams {
    pub project_uri: String,
    pub stamp_uri: String,
    pub accepted_token: String,
    pub creator: String,
    #[serde(serialize_with = "as_decimal")]
    pub target_amount: u128,
    pub deadline: u64,
    #[serde(serialize_with = "as_decimal")]
    pub stamp_price: u128,
    #[serde(serialize_with = "as_decimal")]
    pub max_supply: u128,
    pub vote_duration_secs: u64,
    pub quorum_bps: u16,
    pub release_bps: Vec<u16>,
}

/// Base-unit integers travel as decimal strings; JSON numbers lose precision.
fn as_decimal<S: Serializer>(value: &u128, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&value.to_string())
}

/// Built-in precision for well-known currency labels.
pub fn label_decimals(currency: &str) -> u8 {
    match currency.trim().to_ascii_uppercase().as_str() {
        "USDC" | "USDT" => 6,
        _ => 18,
    }
}

/// Token address whose `decimals()` must be read on-chain, if any: an explicit
/// address without explicit decimals.
pub fn onchain_decimals_needed(funding: &FundingTerms) -> Option<String> {
    if funding.token_decimals.is_some() {
        return None;
    }
    clean_text(funding.token_address.as_deref()).map(normalize_address)
}

/// Explicit decimals, then the on-chain value, then the label default. A
/// missing label counts as `default_currency`.
pub fn resolve_decimals(
    funding: &FundingTerms,
    default_currency: &str,
    onchain: Option<u8>,
) -> Result<u8, ParamError> {
    let currency = clean_text(funding.currency.as_deref()).unwrap_or(default_currency);
    let decimals = funding
        .token_decimals
        .or(onchain)
        .unwrap_or_else(|| label_decimals(currency));
    if decimals > MAX_TOKEN_DECIMALS {
        return Err(ParamError::DecimalsOutOfRange(decimals));
    }
    Ok(decimals)
}

/// Explicit address, then the configured default for the default currency.
pub fn resolve_token(funding: &FundingTerms, defaults: &FundingDefaults) -> Result<String, ParamError> {
    if let Some(addr) = clean_text(funding.token_address.as_deref()) {
        return Ok(normalize_address(addr));
    }
    let currency = clean_text(funding.currency.as_deref()).unwrap_or(&defaults.currency);
    if currency.eq_ignore_ascii_case(&defaults.currency) {
        if let Some(addr) = &defaults.token_address {
            return Ok(normalize_address(addr));
        }
    }
    Err(ParamError::MissingTokenAddress(currency.to_string()))
}

/// Parse a non-negative decimal string into integer base units.
pub fn parse_units(value: &str, decimals: u8) -> Result<u128, String> {
    let value = value.trim();
    let (int_part, frac_part) = match value.split_once('.') {
        Some((i, f)) => (i, f),
        None => (value, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return Err("empty".to_string());
    }
    let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if !all_digits(int_part) || !all_digits(frac_part) {
        return Err(format!("{value:?} is not a plain decimal number"));
    }
    if frac_part.len() > usize::from(decimals) {
        return Err(format!("more than {decimals} fractional digits"));
    }

    let overflow = || "amount too large".to_string();
    let scale = 10u128.checked_pow(u32::from(decimals)).ok_or_else(overflow)?;
    let int_units = if int_part.is_empty() {
        0
    } else {
        int_part.parse::<u128>().map_err(|_| overflow())?
    };
    let frac_units = if frac_part.is_empty() {
        0
    } else {
        let pad = 10u128
            .checked_pow((usize::from(decimals) - frac_part.len()) as u32)
            .ok_or_else(overflow)?;
        frac_part
            .parse::<u128>()
            .map_err(|_| overflow())?
            .checked_mul(pad)
            .ok_or_else(overflow)?
    };
    int_units
        .checked_mul(scale)
        .and_then(|v| v.checked_add(frac_units))
        .ok_or_else(overflow)
}

/// End of the given UTC day (23:59:59) as unix seconds.
pub fn deadline_to_unix(date: &str) -> Option<u64> {
    let day = parse_iso_date(date)?;
    let end = day.and_time(NaiveTime::from_hms_opt(23, 59, 59)?);
    u64::try_from(Utc.from_utc_datetime(&end).timestamp()).ok()
}

pub fn ceil_div(a: u128, b: u128) -> Option<u128> {
    if b == 0 {
        return None;
    }
    Some(a / b + u128::from(a % b != 0))
}

/// Release schedule in basis points.
pub fn release_bps(
    model: ReleaseModel,
    plan: Option<&MilestonePlan>,
) -> Result<Vec<u16>, ParamError> {
    match model {
        ReleaseModel::AllOrNothing => Ok(vec![FULL_RELEASE_BPS]),
        ReleaseModel::Milestone => {
            let plan = plan.ok_or(ParamError::MilestonePlanMissing)?;
            let parts = plan.percents();
            if !sums_to_hundred(&parts) {
                return Err(ParamError::ScheduleMismatch {
                    sum: parts.iter().map(|p| u64::from(*p)).sum(),
                    parts,
                });
            }
            // Every share is at most 100 here, so ×100 fits in u16.
            Ok(parts.iter().map(|p| (*p * 100) as u16).collect())
        }
    }
}

pub fn vote_duration_secs(days: u32) -> u64 {
    u64::from(days.max(1)) * SECONDS_PER_DAY
}

fn required<'a>(value: Option<&'a String>, field: &'static str) -> Result<&'a str, ParamError> {
    clean_text(value.map(String::as_str)).ok_or(ParamError::MissingField(field))
}

fn positive_amount(raw: &str, decimals: u8, field: &'static str) -> Result<u128, ParamError> {
    let units =
        parse_units(raw, decimals).map_err(|reason| ParamError::InvalidAmount { field, reason })?;
    if units == 0 {
        return Err(ParamError::NonPositiveAmount(field));
    }
    Ok(units)
}

/// Resolved parameters plus the token facts recorded on activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub params: DeploymentParams,
    pub token_decimals: u8,
}

/// Resolve everything except the snapshot URI, which is filled in once the
/// snapshot is published.
pub fn resolve(
    funding: &FundingTerms,
    creator: &str,
    defaults: &FundingDefaults,
    onchain_decimals: Option<u8>,
) -> Result<Resolution, ParamError> {
    let decimals = resolve_decimals(funding, &defaults.currency, onchain_decimals)?;
    let accepted_token = resolve_token(funding, defaults)?;

    let target = positive_amount(required(funding.target.as_ref(), "target")?, decimals, "target")?;
    let minimum = positive_amount(
        required(funding.minimum_allocation.as_ref(), "minimumAllocation")?,
        decimals,
        "minimumAllocation",
    )?;

    let deadline_raw = required(funding.deadline.as_ref(), "deadline")?;
    let deadline = deadline_to_unix(deadline_raw)
        .ok_or_else(|| ParamError::InvalidDeadline(deadline_raw.to_string()))?;

    let model = funding
        .release_model
        .ok_or(ParamError::MissingField("releaseModel"))?;
    let release = release_bps(model, funding.milestone_plan.as_ref())?;

    let max_supply = ceil_div(target, minimum).ok_or(ParamError::NonPositiveAmount("minimumAllocation"))?;
    let quorum_bps = funding.quorum_bps.unwrap_or(defaults.quorum_bps);
    if quorum_bps > MAX_QUORUM_BPS {
        return Err(ParamError::QuorumOutOfRange(quorum_bps));
    }
    let stamp_uri = clean_text(funding.stamp_uri.as_deref())
        .unwrap_or(&defaults.stamp_uri)
        .to_string();

    Ok(Resolution {
        params: DeploymentParams {
            project_uri: String::new(),
            stamp_uri,
            accepted_token,
            creator: normalize_address(creator),
            target_amount: target,
            deadline,
            stamp_price: minimum,
            max_supply,
            vote_duration_secs: vote_duration_secs(
                funding.vote_duration_days.unwrap_or(defaults.vote_duration_days),
            ),
            quorum_bps,
            release_bps: release,
        },
        token_decimals: decimals,
    })
}
