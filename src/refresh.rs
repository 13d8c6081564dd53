//! Refresh pipeline.
//!
//! resolve → classify → reconcile timestamps → detect changes → atomic
//! commit → background re-index.
//!
//! Reconciliation keeps `created_at` from the stored record and only bumps
//! `last_updated` when content actually changed, so an unchanged source
//! produces an empty change feed.
//!
//! Fallback data only seeds an empty store. When a corpus already exists and
//! every live source failed, the stored corpus is kept as is; diffing the
//! bundled sample against it would report most of Title 21 as removed.

use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::changes::detect_changes;
use crate::classify::classify;
use crate::config::Config;
use crate::db;
use crate::fetch::{FetchService, FetchSource, HttpTransport, Resolver};
use crate::index::EmbeddingIndex;
use crate::models::{ChangeKind, ChangeRecord, RegulationRecord};
use crate::store::{RecordStore, SqliteStore};

#[derive(Debug, Clone)]
pub struct RefreshReport {
    pub source: FetchSource,
    pub endpoint: Option<String>,
    pub degraded: bool,
    pub fetched: usize,
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub unchanged: usize,
    /// False when nothing was written (dry run, shared or fallback result).
    pub committed: bool,
    pub changes: Vec<ChangeRecord>,
}

/// Run one refresh against `store`.
pub async fn refresh(
    service: &FetchService,
    store: &dyn RecordStore,
    dry_run: bool,
) -> Result<RefreshReport> {
    let result = service.fetch().await?;
    let outcome = result.outcome;
    let now = outcome.fetched_at;

    let old: BTreeMap<i64, RegulationRecord> = store
        .get_all()
        .await?
        .into_iter()
        .map(|r| (r.id, r))
        .collect();

    let mut report = RefreshReport {
        source: outcome.source,
        endpoint: outcome.endpoint.as_ref().map(|e| e.to_string()),
        degraded: outcome.degraded,
        fetched: result.records.len(),
        added: 0,
        updated: 0,
        removed: 0,
        unchanged: 0,
        committed: false,
        changes: Vec::new(),
    };

    match outcome.source {
        FetchSource::Shared => {
            info!("refresh already in flight; nothing to commit");
            return Ok(report);
        }
        FetchSource::Fallback if !old.is_empty() => {
            warn!(
                stored = old.len(),
                "all sources failed; keeping the stored corpus"
            );
            report.unchanged = old.len();
            return Ok(report);
        }
        _ => {}
    }

    let records = reconcile(result.records, &old, now);
    let changes = detect_changes(&old, &records, now);

    for change in &changes {
        match change.kind {
            ChangeKind::Added => report.added += 1,
            ChangeKind::Updated => report.updated += 1,
            ChangeKind::Removed => report.removed += 1,
        }
    }
    report.unchanged = records.len().saturating_sub(report.added + report.updated);

    if !dry_run {
        let removed_ids: Vec<i64> = changes
            .iter()
            .filter(|c| c.kind == ChangeKind::Removed)
            .map(|c| c.record_id)
            .collect();
        store.commit_refresh(&records, &removed_ids, &changes).await?;
        report.committed = true;
    }

    report.changes = changes;
    Ok(report)
}

/// Classify fetched records and carry timestamps over from the stored copy.
pub fn reconcile(
    fetched: Vec<RegulationRecord>,
    old: &BTreeMap<i64, RegulationRecord>,
    now: i64,
) -> Vec<RegulationRecord> {
    fetched
        .into_iter()
        .map(|mut record| {
            record.status = classify(&record.description);
            match old.get(&record.id) {
                Some(stored) => {
                    if record.content_summary.is_none() {
                        record.content_summary = stored.content_summary.clone();
                    }
                    record.created_at = stored.created_at;
                    record.last_updated = if record.same_content(stored) {
                        stored.last_updated
                    } else {
                        now
                    };
                }
                None => {
                    record.created_at = now;
                    record.last_updated = now;
                }
            }
            record
        })
        .collect()
}

/// CLI entry point for `cfr refresh`.
pub async fn run_refresh(config: &Config, dry_run: bool) -> Result<()> {
    let store = Arc::new(SqliteStore::new(db::connect(config).await?));
    let transport = Arc::new(HttpTransport::new(
        &config.fetch.user_agent,
        config.fetch.attempt_timeout(),
    )?);
    let service = FetchService::new(Resolver::from_config(&config.fetch, transport), store.clone());

    let report = refresh(&service, store.as_ref(), dry_run).await?;

    if dry_run {
        println!("refresh (dry-run)");
    } else {
        println!("refresh");
    }
    println!("  source: {}", report.source.as_str());
    if let Some(endpoint) = &report.endpoint {
        println!("  endpoint: {}", endpoint);
    }
    println!("  fetched: {} records", report.fetched);
    println!("  added: {}", report.added);
    println!("  updated: {}", report.updated);
    println!("  removed: {}", report.removed);
    println!("  unchanged: {}", report.unchanged);
    if report.degraded {
        println!("  degraded: using bundled fallback data");
    }

    if report.committed && config.embedding.is_enabled() {
        match crate::embedding::create_provider(&config.embedding) {
            Ok(provider) => {
                let index = Arc::new(EmbeddingIndex::new(
                    store.clone(),
                    Arc::from(provider),
                    config.embedding.batch_size,
                ));
                // The CLI process exits after this command, so wait for it.
                if let Err(e) = index.spawn_reindex().await {
                    warn!(error = %e, "re-index task panicked");
                }
            }
            Err(e) => warn!(error = %e, "embedding provider unavailable; skipping re-index"),
        }
    }

    println!("ok");
    store.close().await;
    Ok(())
}
