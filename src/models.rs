//! Core data models used throughout the harness.
//!
//! These types represent the regulation records, embedding entries, search
//! history and change feed that flow through the acquisition and retrieval
//! pipeline. Timestamps are Unix seconds, matching the SQLite columns.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Classification of what a regulation does. Derived, not authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegulationStatus {
    Allowed,
    Prohibited,
    Unknown,
}

impl RegulationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allowed => "ALLOWED",
            Self::Prohibited => "PROHIBITED",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for RegulationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RegulationStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ALLOWED" => Ok(Self::Allowed),
            "PROHIBITED" => Ok(Self::Prohibited),
            "UNKNOWN" => Ok(Self::Unknown),
            other => anyhow::bail!("unknown regulation status: '{}'", other),
        }
    }
}

/// One regulation node of Title 21 (chapter, subchapter, part or section).
///
/// Updates are full-record replacements; `id` is derived from the
/// hierarchical locator and never changes for the same regulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegulationRecord {
    pub id: i64,
    pub title: String,
    pub chapter: String,
    pub subchapter: String,
    pub part: String,
    pub section_range: String,
    pub description: String,
    pub source_url: String,
    pub status: RegulationStatus,
    pub content_summary: Option<String>,
    pub last_updated: i64,
    pub created_at: i64,
}

impl RegulationRecord {
    /// Build a record whose id is derived from its locator fields.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        title: &str,
        chapter: &str,
        subchapter: &str,
        part: &str,
        section_range: &str,
        description: &str,
        source_url: &str,
        now: i64,
    ) -> Self {
        Self {
            id: record_id_for(title, chapter, subchapter, part, section_range),
            title: title.to_string(),
            chapter: chapter.to_string(),
            subchapter: subchapter.to_string(),
            part: part.to_string(),
            section_range: section_range.to_string(),
            description: description.to_string(),
            source_url: source_url.to_string(),
            status: RegulationStatus::Unknown,
            content_summary: None,
            last_updated: now,
            created_at: now,
        }
    }

    /// A record is usable when it names at least one locator and has a
    /// description to match against.
    pub fn is_valid(&self) -> bool {
        let has_locator = !self.chapter.trim().is_empty()
            || !self.subchapter.trim().is_empty()
            || !self.part.trim().is_empty();
        has_locator && !self.description.trim().is_empty()
    }

    /// Content equality: every field except the two timestamps.
    pub fn same_content(&self, other: &RegulationRecord) -> bool {
        self.id == other.id
            && self.title == other.title
            && self.chapter == other.chapter
            && self.subchapter == other.subchapter
            && self.part == other.part
            && self.section_range == other.section_range
            && self.description == other.description
            && self.source_url == other.source_url
            && self.status == other.status
            && self.content_summary == other.content_summary
    }

    /// Text fed to the embedding provider for this record.
    pub fn searchable_text(&self) -> String {
        let mut parts = Vec::new();
        if !self.part.is_empty() {
            parts.push(format!("Part {}", strip_prefix_ci(&self.part, "part ")));
        }
        if !self.chapter.is_empty() {
            parts.push(format!("Chapter {}", strip_prefix_ci(&self.chapter, "chapter ")));
        }
        if !self.subchapter.is_empty() {
            parts.push(format!(
                "Subchapter {}",
                strip_prefix_ci(&self.subchapter, "subchapter ")
            ));
        }
        if !self.description.is_empty() {
            parts.push(self.description.clone());
        }
        if !self.section_range.is_empty() {
            parts.push(format!("Sections {}", self.section_range));
        }
        parts.join(" | ")
    }
}

fn strip_prefix_ci<'a>(value: &'a str, prefix: &str) -> &'a str {
    match value.get(..prefix.len()) {
        Some(head) if head.eq_ignore_ascii_case(prefix) => &value[prefix.len()..],
        _ => value,
    }
}

/// Derive a stable positive id from a regulation's locator.
///
/// The same locator maps to the same id in every process, which keeps the
/// change feed meaningful across fetches.
pub fn record_id_for(
    title: &str,
    chapter: &str,
    subchapter: &str,
    part: &str,
    section_range: &str,
) -> i64 {
    let mut hasher = Sha256::new();
    for field in [title, chapter, subchapter, part, section_range] {
        hasher.update(field.trim().to_lowercase().as_bytes());
        hasher.update([0x1f]);
    }
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    // Keep ids within JavaScript's safe integer range for JSON consumers.
    (u64::from_be_bytes(bytes) & ((1u64 << 53) - 1)) as i64
}

/// Vector representation of one regulation.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingEntry {
    pub record_id: i64,
    pub model: String,
    pub vector: Vec<f32>,
    pub source_text_hash: String,
}

/// One logged search. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHistoryEntry {
    pub query: String,
    pub result_count: usize,
    pub result_ids: Vec<i64>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Updated,
    Removed,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Updated => "updated",
            Self::Removed => "removed",
        }
    }
}

impl FromStr for ChangeKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "added" => Ok(Self::Added),
            "updated" => Ok(Self::Updated),
            "removed" => Ok(Self::Removed),
            other => anyhow::bail!("unknown change kind: '{}'", other),
        }
    }
}

/// A detected difference between the stored and freshly fetched corpus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub record_id: i64,
    pub kind: ChangeKind,
    /// Names of the fields that differ (empty for added/removed).
    pub changed_fields: Vec<String>,
    pub previous_snapshot: Option<RegulationRecord>,
    pub new_snapshot: Option<RegulationRecord>,
    pub detected_at: i64,
}
