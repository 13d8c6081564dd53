//! Change detection between the stored corpus and a fresh fetch.
//!
//! Comparison is exact, field by field: any difference in a field other than
//! `created_at` produces an `updated` change naming the differing fields.
//! Output is ordered by record id so repeated runs over the same inputs
//! produce the same feed.

use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet};

use crate::config::Config;
use crate::db;
use crate::models::{ChangeKind, ChangeRecord, RegulationRecord};
use crate::store::{RecordStore, SqliteStore};

/// Diff `old` (by id) against `new`.
///
/// If `new` contains the same id twice, the last occurrence wins, matching
/// full-record replacement on upsert.
pub fn detect_changes(
    old: &BTreeMap<i64, RegulationRecord>,
    new: &[RegulationRecord],
    detected_at: i64,
) -> Vec<ChangeRecord> {
    let new_by_id: BTreeMap<i64, &RegulationRecord> = new.iter().map(|r| (r.id, r)).collect();
    let ids: BTreeSet<i64> = old.keys().chain(new_by_id.keys()).copied().collect();

    let mut changes = Vec::new();
    for id in ids {
        match (old.get(&id), new_by_id.get(&id)) {
            (None, Some(added)) => changes.push(ChangeRecord {
                record_id: id,
                kind: ChangeKind::Added,
                changed_fields: Vec::new(),
                previous_snapshot: None,
                new_snapshot: Some((*added).clone()),
                detected_at,
            }),
            (Some(removed), None) => changes.push(ChangeRecord {
                record_id: id,
                kind: ChangeKind::Removed,
                changed_fields: Vec::new(),
                previous_snapshot: Some(removed.clone()),
                new_snapshot: None,
                detected_at,
            }),
            (Some(before), Some(after)) => {
                let fields = changed_fields(before, after);
                if !fields.is_empty() {
                    changes.push(ChangeRecord {
                        record_id: id,
                        kind: ChangeKind::Updated,
                        changed_fields: fields,
                        previous_snapshot: Some(before.clone()),
                        new_snapshot: Some((*after).clone()),
                        detected_at,
                    });
                }
            }
            (None, None) => {}
        }
    }
    changes
}

/// Names of the fields that differ, excluding `created_at`.
pub fn changed_fields(before: &RegulationRecord, after: &RegulationRecord) -> Vec<String> {
    let mut fields = Vec::new();
    let mut check = |name: &str, differs: bool| {
        if differs {
            fields.push(name.to_string());
        }
    };
    check("title", before.title != after.title);
    check("chapter", before.chapter != after.chapter);
    check("subchapter", before.subchapter != after.subchapter);
    check("part", before.part != after.part);
    check("section_range", before.section_range != after.section_range);
    check("description", before.description != after.description);
    check("source_url", before.source_url != after.source_url);
    check("status", before.status != after.status);
    check("content_summary", before.content_summary != after.content_summary);
    check("last_updated", before.last_updated != after.last_updated);
    fields
}

/// Start of a look-back window of `days` days ending at `now`. Negative
/// windows are empty and huge ones clamp to the start of time.
fn window_start(now: i64, days: i64) -> i64 {
    now.saturating_sub(days.max(0).saturating_mul(86_400))
}

/// CLI entry point: print the change feed for the last `days` days.
pub async fn run_changes(config: &Config, days: i64, limit: usize) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool);

    let since = window_start(chrono::Utc::now().timestamp(), days);
    let changes = store.recent_changes(since, limit).await?;
    store.close().await;

    if changes.is_empty() {
        println!("No changes in the last {} day(s).", days);
        return Ok(());
    }

    println!("Changes in the last {} day(s): {}", days, changes.len());
    println!();
    for change in &changes {
        let snapshot = change
            .new_snapshot
            .as_ref()
            .or(change.previous_snapshot.as_ref());
        let label = snapshot.map(locator_label).unwrap_or_default();
        println!(
            "  {:<8} {:<18} {}  {}",
            change.kind.as_str(),
            change.record_id,
            format_ts(change.detected_at),
            label
        );
        if !change.changed_fields.is_empty() {
            println!("           fields: {}", change.changed_fields.join(", "));
        }
    }
    Ok(())
}

fn locator_label(r: &RegulationRecord) -> String {
    [r.chapter.as_str(), r.subchapter.as_str(), r.part.as_str()]
        .iter()
        .filter(|s| !s.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(" / ")
}

fn format_ts(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(part: &str, desc: &str) -> RegulationRecord {
        RegulationRecord::new("Title 21", "Chapter I", "Subchapter H", part, "", desc, "", 100)
    }

    fn by_id(records: &[RegulationRecord]) -> BTreeMap<i64, RegulationRecord> {
        records.iter().map(|r| (r.id, r.clone())).collect()
    }

    #[test]
    fn test_identical_input_yields_nothing() {
        let corpus = vec![record("Part 801", "Labeling"), record("Part 803", "Reporting")];
        assert!(detect_changes(&by_id(&corpus), &corpus, 200).is_empty());
    }

    #[test]
    fn test_created_at_is_ignored() {
        let old = vec![record("Part 801", "Labeling")];
        let mut new = old.clone();
        new[0].created_at = 999;
        assert!(detect_changes(&by_id(&old), &new, 200).is_empty());
    }

    #[test]
    fn test_added_updated_removed_ordered_by_id() {
        let kept = record("Part 801", "Labeling");
        let removed = record("Part 802", "Old part");
        let old = vec![kept.clone(), removed.clone()];

        let mut updated = kept.clone();
        updated.description = "Labeling requirements".into();
        updated.last_updated = 300;
        let added = record("Part 803", "Medical device reporting");
        let new = vec![added.clone(), updated.clone()];

        let changes = detect_changes(&by_id(&old), &new, 300);
        assert_eq!(changes.len(), 3);
        let ids: Vec<i64> = changes.iter().map(|c| c.record_id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);

        let find = |id: i64| changes.iter().find(|c| c.record_id == id).unwrap();
        let u = find(kept.id);
        assert_eq!(u.kind, ChangeKind::Updated);
        assert_eq!(u.changed_fields, vec!["description", "last_updated"]);
        assert_eq!(u.previous_snapshot.as_ref().unwrap().description, "Labeling");

        let a = find(added.id);
        assert_eq!(a.kind, ChangeKind::Added);
        assert!(a.previous_snapshot.is_none());

        let r = find(removed.id);
        assert_eq!(r.kind, ChangeKind::Removed);
        assert!(r.new_snapshot.is_none());
        assert_eq!(r.detected_at, 300);
    }

    #[test]
    fn test_window_start_clamps() {
        assert_eq!(window_start(1_000_000, 1), 1_000_000 - 86_400);
        assert_eq!(window_start(1_000_000, -5), 1_000_000);
        assert_eq!(window_start(1_000_000, i64::MAX), 1_000_000 - i64::MAX);
        assert_eq!(window_start(-10, i64::MAX), i64::MIN);
    }
}
