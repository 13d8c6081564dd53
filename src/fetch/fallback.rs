//! Bundled minimal reference dataset used when every live source fails.

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::models::RegulationRecord;

const FALLBACK_JSON: &str = include_str!("../../data/fallback_regulations.json");

#[derive(Deserialize)]
struct FallbackEntry {
    title: String,
    chapter: String,
    subchapter: String,
    part: String,
    #[serde(default)]
    section_range: String,
    description: String,
    #[serde(default)]
    source_url: String,
}

/// Load the bundled dataset, stamping every record with `now`.
///
/// The dataset is compiled into the binary; failing to parse it is a
/// build defect and is reported as [`Error::InvariantViolation`].
pub fn load(now: i64) -> Result<Vec<RegulationRecord>> {
    let entries: Vec<FallbackEntry> = serde_json::from_str(FALLBACK_JSON)
        .map_err(|e| Error::invariant(format!("bundled fallback dataset is malformed: {}", e)))?;

    let records: Vec<RegulationRecord> = entries
        .into_iter()
        .map(|e| {
            RegulationRecord::new(
                &e.title,
                &e.chapter,
                &e.subchapter,
                &e.part,
                &e.section_range,
                &e.description,
                &e.source_url,
                now,
            )
        })
        .collect();

    if records.is_empty() || records.iter().any(|r| !r.is_valid()) {
        return Err(Error::invariant(
            "bundled fallback dataset contains no valid records",
        ));
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_fallback_is_valid_and_unique() {
        let records = load(42).unwrap();
        assert!(records.len() >= 10);
        let ids: BTreeSet<i64> = records.iter().map(|r| r.id).collect();
        assert_eq!(ids.len(), records.len());
        assert!(records.iter().all(|r| r.created_at == 42));
        assert!(records
            .iter()
            .any(|r| r.part == "Part 801" && r.description.contains("medical device")));
    }
}
