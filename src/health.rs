//! Acquisition health report, used by `cfr health`.
//!
//! Everything here is read from the persisted [`FetchAttemptState`]; no
//! endpoint is contacted.

use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::config::Config;
use crate::db;
use crate::fetch::{health_status, CachePolicy, FetchAttemptState, HealthStatus};
use crate::store::{RecordStore, SqliteStore};

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub cached_endpoint: Option<String>,
    pub last_success_at: Option<i64>,
    pub cache_expiry: Option<i64>,
    pub cache_expired: bool,
    pub fallback_in_use: bool,
    pub last_attempt_at: Option<i64>,
    pub failure_counts: BTreeMap<String, u32>,
}

pub fn health_report(state: &FetchAttemptState, policy: &CachePolicy, now: i64) -> HealthReport {
    HealthReport {
        status: health_status(state, policy, now),
        cached_endpoint: state.last_successful_endpoint.as_ref().map(|e| e.to_string()),
        last_success_at: state.last_success_at,
        cache_expiry: state.cache_expiry,
        cache_expired: state.is_cache_expired(now),
        fallback_in_use: state.fallback_in_use,
        last_attempt_at: state.last_attempt_at,
        failure_counts: state
            .failure_counts
            .iter()
            .filter(|(_, n)| **n > 0)
            .map(|(url, n)| (url.clone(), *n))
            .collect(),
    }
}

/// Persisted state, or an empty one before the first refresh.
pub async fn load_state(store: &dyn RecordStore, config: &Config) -> Result<FetchAttemptState> {
    match store.load_fetch_state().await? {
        Some(json) => Ok(FetchAttemptState::from_json(&json)?),
        None => Ok(FetchAttemptState::new(config.fetch.candidate_endpoints())),
    }
}

pub async fn run_health(config: &Config) -> Result<()> {
    let store = SqliteStore::new(db::connect(config).await?);
    let state = load_state(&store, config).await;
    store.close().await;

    let report = health_report(&state?, &config.fetch.cache_policy(), chrono::Utc::now().timestamp());

    println!("status:           {}", report.status);
    println!(
        "cached endpoint:  {}",
        report.cached_endpoint.as_deref().unwrap_or("(none)")
    );
    println!("last success:     {}", format_opt_ts(report.last_success_at));
    println!(
        "cache expiry:     {}{}",
        format_opt_ts(report.cache_expiry),
        if report.cache_expired && report.cache_expiry.is_some() {
            " (expired)"
        } else {
            ""
        }
    );
    println!("last attempt:     {}", format_opt_ts(report.last_attempt_at));
    println!("fallback in use:  {}", report.fallback_in_use);

    if !report.failure_counts.is_empty() {
        println!();
        println!("{:<56} FAILURES", "ENDPOINT");
        for (url, n) in &report.failure_counts {
            println!("{:<56} {}", url, n);
        }
    }
    Ok(())
}

fn format_opt_ts(ts: Option<i64>) -> String {
    match ts {
        Some(ts) => crate::stats::format_ts_relative(ts),
        None => "never".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{EndpointKey, StrategyKind};
    use crate::store::InMemoryStore;

    #[test]
    fn test_report_without_history() {
        let report = health_report(&FetchAttemptState::default(), &CachePolicy::default(), 1_000);
        assert_eq!(report.status, HealthStatus::Error);
        assert!(report.cached_endpoint.is_none());
        assert!(report.cache_expired);
        assert!(report.failure_counts.is_empty());
    }

    #[test]
    fn test_report_lists_only_failing_endpoints() {
        let mut state = FetchAttemptState::default();
        state.last_successful_endpoint = Some(EndpointKey {
            url: "http://a.test".into(),
            strategy: StrategyKind::Table,
        });
        state.last_success_at = Some(1_000);
        state.cache_expiry = Some(1_000 + 86_400);
        state.failure_counts.insert("http://a.test".into(), 0);
        state.failure_counts.insert("http://b.test".into(), 2);

        let report = health_report(&state, &CachePolicy::default(), 2_000);
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.cached_endpoint.as_deref(), Some("http://a.test [table]"));
        assert!(!report.cache_expired);
        assert_eq!(report.failure_counts.len(), 1);
        assert_eq!(report.failure_counts.get("http://b.test"), Some(&2));
    }

    #[tokio::test]
    async fn test_corrupt_state_is_reported() {
        let store = InMemoryStore::new();
        store.save_fetch_state("{not json").await.unwrap();
        let config = Config::with_db_path("/tmp/unused.db");
        let err = load_state(&store, &config).await.unwrap_err();
        assert!(err.to_string().contains("malformed"));
    }
}
