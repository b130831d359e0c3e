//! Text and number predicates shared by the readiness validator and the
//! request boundary. Nothing here touches state or I/O.

use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;

/// Wording that turns a commitment into a wish. Matched on word boundaries,
/// case-insensitively.
pub const BANNED_CONDITIONAL_WORDS: &[&str] = &[
    "aim",
    "aims",
    "aiming",
    "hope",
    "hopes",
    "hoping",
    "try",
    "tries",
    "trying",
    "plan",
    "plans",
    "planned",
    "planning",
    "intend",
    "intends",
    "intended",
    "intending",
    "maybe",
    "might",
    "likely",
    "approximately",
    "around",
    "soon",
    "later",
];

fn conditional_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let pattern = format!(r"(?i)\b({})\b", BANNED_CONDITIONAL_WORDS.join("|"));
        Regex::new(&pattern).expect("conditional regex must compile")
    })
}

fn link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(https?://|\bwww\.)").expect("link regex must compile"))
}

fn iso_date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("date regex must compile"))
}

fn address_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^0x[a-fA-F0-9]{40}$").expect("address regex must compile"))
}

pub fn has_conditional_language(text: &str) -> bool {
    conditional_re().is_match(text)
}

pub fn has_link(text: &str) -> bool {
    link_re().is_match(text)
}

/// `YYYY-MM-DD` naming a real calendar day.
pub fn is_iso_date(date: &str) -> bool {
    parse_iso_date(date).is_some()
}

pub fn parse_iso_date(date: &str) -> Option<NaiveDate> {
    if !iso_date_re().is_match(date) {
        return None;
    }
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

pub fn is_hex_address(value: &str) -> bool {
    address_re().is_match(value)
}

/// Sum of a percent list; `None` on overflow.
pub fn percent_sum(parts: &[u32]) -> Option<u32> {
    parts.iter().try_fold(0u32, |acc, p| acc.checked_add(*p))
}

pub fn sums_to_hundred(parts: &[u32]) -> bool {
    percent_sum(parts) == Some(100)
}

/// Whole number in `[min, max]`. Fractional values never qualify.
pub fn is_integer_in_range(value: f64, min: u32, max: u32) -> bool {
    value.is_finite() && value.fract() == 0.0 && value >= f64::from(min) && value <= f64::from(max)
}

/// Character count of the trimmed text.
pub fn char_len(text: &str) -> usize {
    text.trim().chars().count()
}

/// Trimmed, non-empty text or `None`.
pub fn clean_text(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|t| !t.is_empty())
}

pub fn normalize_address(address: &str) -> String {
    address.trim().to_lowercase()
}
