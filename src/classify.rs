//! Keyword-rule status classification.
//!
//! Only the description is inspected. Regulatory prose uses "shall not" in
//! plenty of non-prohibitive contexts, so prohibition needs either an
//! explicit prohibition phrase or at least two prohibition keywords.
//! Organizational entries (bare chapter labels, definitions, reserved
//! sections) stay [`RegulationStatus::Unknown`].

use crate::models::RegulationStatus;

const PROHIBITION_PHRASES: &[&str] = &[
    "shall not",
    "must not",
    "may not",
    "cannot",
    "no person may",
    "no person shall",
    "it is unlawful",
    "it is illegal",
    "prohibited from",
    "forbidden to",
];

const PROHIBITION_KEYWORDS: &[&str] = &[
    "prohibited",
    "forbidden",
    "not permitted",
    "not allowed",
    "banned",
    "unlawful",
    "illegal",
    "prohibits",
    "ban",
    "outlaw",
    "prohibition",
];

const REQUIREMENT_INDICATORS: &[&str] = &[
    "requirement",
    "standard",
    "regulation",
    "rule",
    "procedure",
    "guideline",
    "registration",
    "labeling",
    "approval",
    "manufacturing",
    "prescription",
    "record",
    "report",
    "quota",
];

const REGULATED_PRODUCTS: &[&str] = &["food", "drug", "device", "controlled substance", "biologic", "cosmetic"];

const ALLOWANCE_KEYWORDS: &[&str] = &[
    "permitted",
    "allowed",
    "authorized",
    "approved",
    "provision",
    "shall",
    "must",
    "requires",
    "mandates",
];

/// Classify a regulation by its description.
pub fn classify(description: &str) -> RegulationStatus {
    let text = description.trim().to_lowercase();
    if text.is_empty() {
        return RegulationStatus::Unknown;
    }

    if PROHIBITION_PHRASES.iter().any(|p| text.contains(p)) {
        return RegulationStatus::Prohibited;
    }
    let prohibition_hits = PROHIBITION_KEYWORDS
        .iter()
        .filter(|k| text.contains(*k))
        .count();
    if prohibition_hits >= 2 {
        return RegulationStatus::Prohibited;
    }

    if text.contains("reserved") || text.contains("definition") || is_bare_label(&text) {
        return RegulationStatus::Unknown;
    }

    if REQUIREMENT_INDICATORS.iter().any(|k| text.contains(k))
        || REGULATED_PRODUCTS.iter().any(|k| text.contains(k))
        || ALLOWANCE_KEYWORDS.iter().any(|k| text.contains(k))
    {
        return RegulationStatus::Allowed;
    }

    if text.len() < 20 || text == "general" {
        RegulationStatus::Unknown
    } else {
        RegulationStatus::Allowed
    }
}

/// "chapter i", "subchapter h" and the like.
fn is_bare_label(text: &str) -> bool {
    let mut words = text.split_whitespace();
    match (words.next(), words.next(), words.next()) {
        (Some("chapter" | "subchapter"), Some(id), None) => id.chars().all(|c| c.is_ascii_alphanumeric()),
        _ => false,
    }
}
