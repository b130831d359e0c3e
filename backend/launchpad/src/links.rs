//! External link rules.
//!
//! Drafts may hold half-filled rows (empty label or url) so the editor can
//! save work in progress. The snapshot uses [`validate_publish_links`], which
//! additionally requires both fields and rejects duplicate URLs.

use std::collections::HashSet;

use reqwest::Url;

use crate::types::{ExternalLink, MAX_EXTERNAL_LINKS};

pub const MAX_LABEL_CHARS: usize = 40;
pub const MIN_PUBLISH_LABEL_CHARS: usize = 2;
pub const MAX_URL_CHARS: usize = 2048;

const FORBIDDEN_URL_PREFIXES: &[&str] = &["javascript:", "data:", "vbscript:"];

/// Trim label and url of every row.
pub fn normalize_links(links: &[ExternalLink]) -> Vec<ExternalLink> {
    links
        .iter()
        .map(|l| ExternalLink {
            id: l.id.trim().to_string(),
            link_type: l.link_type,
            label: l.label.trim().to_string(),
            url: l.url.trim().to_string(),
        })
        .collect()
}

/// Rules applied when a draft is saved. Returns one message per problem.
pub fn validate_draft_links(links: &[ExternalLink]) -> Result<(), Vec<String>> {
    let mut issues = Vec::new();
    if links.len() > MAX_EXTERNAL_LINKS {
        issues.push(format!("At most {MAX_EXTERNAL_LINKS} external links are allowed."));
    }
    for (idx, link) in links.iter().enumerate() {
        let row = idx + 1;
        if link.id.trim().is_empty() {
            issues.push(format!("Link {row}: id is required."));
        }
        if link.label.trim().chars().count() > MAX_LABEL_CHARS {
            issues.push(format!("Link {row}: label must be {MAX_LABEL_CHARS} characters or less."));
        }
        if let Err(msg) = check_url(link.url.trim()) {
            issues.push(format!("Link {row}: {msg}"));
        }
    }
    if issues.is_empty() {
        Ok(())
    } else {
        Err(issues)
    }
}

/// Publish-time rules. Empty rows must already be filtered out
/// (see [`publishable_rows`]).
pub fn validate_publish_links(links: &[ExternalLink]) -> Result<(), Vec<String>> {
    let mut issues = match validate_draft_links(links) {
        Ok(()) => Vec::new(),
        Err(issues) => issues,
    };

    for (idx, link) in links.iter().enumerate() {
        let row = idx + 1;
        let label_len = link.label.trim().chars().count();
        if !(MIN_PUBLISH_LABEL_CHARS..=MAX_LABEL_CHARS).contains(&label_len) {
            issues.push(format!(
                "Link {row}: label is required ({MIN_PUBLISH_LABEL_CHARS}–{MAX_LABEL_CHARS} chars)."
            ));
        }
        if link.url.trim().is_empty() {
            issues.push(format!("Link {row}: URL is required."));
        }
    }

    let mut seen = HashSet::new();
    let duplicate = links
        .iter()
        .map(|l| l.url.trim().to_lowercase())
        .filter(|u| !u.is_empty())
        .any(|u| !seen.insert(u));
    if duplicate {
        issues.push("Duplicate URLs are not allowed.".to_string());
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(issues)
    }
}

/// Trimmed rows with at least a label or a url.
pub fn publishable_rows(links: &[ExternalLink]) -> Vec<ExternalLink> {
    normalize_links(links)
        .into_iter()
        .filter(|l| !l.label.is_empty() || !l.url.is_empty())
        .collect()
}

fn check_url(url: &str) -> Result<(), String> {
    if url.is_empty() {
        return Ok(());
    }
    if url.chars().count() > MAX_URL_CHARS {
        return Err(format!("URL must be {MAX_URL_CHARS} characters or less."));
    }
    let lower = url.to_lowercase();
    if FORBIDDEN_URL_PREFIXES.iter().any(|p| lower.starts_with(p)) {
        return Err("URL scheme not allowed.".to_string());
    }
    if !lower.starts_with("https://") {
        return Err("Use https:// URLs.".to_string());
    }
    match Url::parse(url) {
        Ok(parsed) if parsed.host_str().is_some() => Ok(()),
        _ => Err("Invalid URL.".to_string()),
    }
}
