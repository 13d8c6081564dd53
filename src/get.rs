//! Regulation lookup by id, used by `cfr get`.

use anyhow::{bail, Result};

use crate::config::Config;
use crate::db;
use crate::models::{ChangeRecord, RegulationRecord};
use crate::store::{RecordStore, SqliteStore};

/// A regulation with its change history, newest first.
#[derive(Debug, Clone)]
pub struct RegulationView {
    pub record: RegulationRecord,
    pub changes: Vec<ChangeRecord>,
}

pub async fn get_regulation(store: &dyn RecordStore, id: i64) -> Result<RegulationView> {
    let record = match store.get_by_id(id).await? {
        Some(r) => r,
        None => bail!("regulation not found: {}", id),
    };
    let changes = store.changes_for(id).await?;
    Ok(RegulationView { record, changes })
}

/// CLI entry point: look up one regulation and print it.
pub async fn run_get(config: &Config, id: i64) -> Result<()> {
    let store = SqliteStore::new(db::connect(config).await?);
    let view = get_regulation(&store, id).await;
    store.close().await;
    let RegulationView { record: r, changes } = view?;

    println!("--- Regulation ---");
    println!("id:            {}", r.id);
    println!("title:         {}", r.title);
    if !r.chapter.is_empty() {
        println!("chapter:       {}", r.chapter);
    }
    if !r.subchapter.is_empty() {
        println!("subchapter:    {}", r.subchapter);
    }
    if !r.part.is_empty() {
        println!("part:          {}", r.part);
    }
    if !r.section_range.is_empty() {
        println!("sections:      {}", r.section_range);
    }
    println!("status:        {}", r.status);
    if !r.source_url.is_empty() {
        println!("source_url:    {}", r.source_url);
    }
    println!("created_at:    {}", format_ts_iso(r.created_at));
    println!("last_updated:  {}", format_ts_iso(r.last_updated));
    println!();
    println!("--- Description ---");
    println!("{}", r.description);
    if let Some(summary) = &r.content_summary {
        println!();
        println!("--- Summary ---");
        println!("{}", summary);
    }
    if !changes.is_empty() {
        println!();
        println!("--- Changes ({}) ---", changes.len());
        for c in &changes {
            print!("{}  {}", format_ts_iso(c.detected_at), c.kind.as_str());
            if !c.changed_fields.is_empty() {
                print!("  [{}]", c.changed_fields.join(", "));
            }
            println!();
        }
    }
    Ok(())
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| ts.to_string())
}
