//! Fetch resolver: acquires regulation records from an unreliable source.
//!
//! The resolver walks an ordered chain of endpoints, applying each
//! endpoint's parse strategies in fixed priority order (table → links → api)
//! until one yields valid records. A persisted [`FetchAttemptState`] remembers
//! the last endpoint that worked so later runs try it first, and health is
//! derived from that state alone without touching the network.
//!
//! Network and parse faults never escape [`Resolver::resolve_and_fetch`]:
//! when every candidate fails the bundled [`fallback`] dataset is returned
//! and the outcome is marked degraded. The only error it returns is
//! [`Error::InvariantViolation`] for corrupt state.

pub mod fallback;
pub mod service;
pub mod strategy;
pub mod transport;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::FetchConfig;
use crate::error::{Error, Result};
use crate::models::RegulationRecord;

pub use service::{FetchResult, FetchService};
pub use strategy::{ParseContext, Parser};
pub use transport::{HttpTransport, Transport, TransportResponse};

/// Parse strategy applied to an endpoint's response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Table,
    Links,
    Api,
}

impl StrategyKind {
    /// Fixed priority order.
    pub const ALL: [StrategyKind; 3] = [Self::Table, Self::Links, Self::Api];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Table => "table",
            Self::Links => "links",
            Self::Api => "api",
        }
    }

    pub fn parser(&self) -> Parser {
        match self {
            Self::Table => strategy::parse_table,
            Self::Links => strategy::parse_links,
            Self::Api => strategy::parse_api,
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A source URL plus the strategies to try on it, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub url: String,
    pub strategies: Vec<StrategyKind>,
}

/// The (url, strategy) pair that produced records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointKey {
    pub url: String,
    pub strategy: StrategyKind,
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.url, self.strategy)
    }
}

/// Expiry rule for the last-known-good endpoint.
#[derive(Debug, Clone, Copy)]
pub struct CachePolicy {
    pub max_age: chrono::Duration,
    /// When the cached endpoint expires, keep it as a candidate (true) or
    /// forget it entirely (false).
    pub revalidate_on_expiry: bool,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            max_age: chrono::Duration::days(7),
            revalidate_on_expiry: true,
        }
    }
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub attempt_timeout: Duration,
    pub total_budget: Duration,
}

impl RetryPolicy {
    /// Delay before retry `attempt` (1-based): base, 2×base, 4×base … capped at 2^5.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base * (1u32 << attempt.saturating_sub(1).min(5))
    }
}

impl From<&FetchConfig> for RetryPolicy {
    fn from(config: &FetchConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            attempt_timeout: config.attempt_timeout(),
            total_budget: config.total_budget(),
        }
    }
}

/// Persisted resolver state. Superseded on every attempt, never deleted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchAttemptState {
    pub candidate_endpoints: Vec<Endpoint>,
    pub last_successful_endpoint: Option<EndpointKey>,
    pub last_success_at: Option<i64>,
    pub cache_expiry: Option<i64>,
    /// Consecutive failures per endpoint URL; reset on success.
    #[serde(default)]
    pub failure_counts: BTreeMap<String, u32>,
    #[serde(default)]
    pub fallback_in_use: bool,
    #[serde(default)]
    pub last_attempt_at: Option<i64>,
}

impl FetchAttemptState {
    pub fn new(candidate_endpoints: Vec<Endpoint>) -> Self {
        Self {
            candidate_endpoints,
            ..Self::default()
        }
    }

    /// Decode a persisted revision. Malformed state is a programming fault.
    pub fn from_json(json: &str) -> Result<Self> {
        let state: Self = serde_json::from_str(json)
            .map_err(|e| Error::invariant(format!("persisted fetch state is malformed: {}", e)))?;
        state.validate()?;
        Ok(state)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Other(e.into()))
    }

    /// The cached endpoint, its success time and its expiry are set together
    /// and the expiry never precedes the success.
    pub fn validate(&self) -> Result<()> {
        match (
            &self.last_successful_endpoint,
            self.last_success_at,
            self.cache_expiry,
        ) {
            (None, None, None) => Ok(()),
            (Some(_), Some(at), Some(expiry)) if expiry >= at => Ok(()),
            (Some(_), Some(at), Some(expiry)) => Err(Error::invariant(format!(
                "fetch state cache_expiry {} precedes last_success_at {}",
                expiry, at
            ))),
            _ => Err(Error::invariant(
                "fetch state has a partially recorded last successful endpoint",
            )),
        }
    }

    pub fn is_cache_expired(&self, now: i64) -> bool {
        self.cache_expiry.map(|e| now >= e).unwrap_or(true)
    }

    pub fn failures_for(&self, url: &str) -> u32 {
        self.failure_counts.get(url).copied().unwrap_or(0)
    }

    fn record_failure(&mut self, url: &str) {
        *self.failure_counts.entry(url.to_string()).or_insert(0) += 1;
    }

    fn forget_cached_endpoint(&mut self) {
        self.last_successful_endpoint = None;
        self.last_success_at = None;
        self.cache_expiry = None;
    }
}

/// Overall health of the acquisition path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Error,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derive health from persisted state only.
///
/// `healthy` needs a success inside the cache window, no failures recorded
/// against the cached endpoint and no fallback data in use. Any prior
/// success otherwise yields `degraded`; no success ever yields `error`.
pub fn health_status(state: &FetchAttemptState, policy: &CachePolicy, now: i64) -> HealthStatus {
    let (Some(key), Some(success_at)) = (&state.last_successful_endpoint, state.last_success_at)
    else {
        return HealthStatus::Error;
    };
    let fresh = now - success_at <= policy.max_age.num_seconds();
    if fresh && state.failures_for(&key.url) == 0 && !state.fallback_in_use {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    }
}

/// Provenance of the stored corpus, read from persisted state only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CorpusSource {
    /// No resolve has ever run.
    #[default]
    Unfetched,
    /// Last live fetch is inside the cache window.
    Live,
    /// Last-known-good live data, older than the cache window.
    Cached,
    /// The latest resolve fell back to bundled data.
    Fallback,
}

impl CorpusSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unfetched => "unfetched",
            Self::Live => "live",
            Self::Cached => "cached",
            Self::Fallback => "fallback",
        }
    }

    pub fn from_state(state: &FetchAttemptState, policy: &CachePolicy, now: i64) -> Self {
        if state.fallback_in_use {
            return Self::Fallback;
        }
        match state.last_success_at {
            Some(at) if now - at <= policy.max_age.num_seconds() => Self::Live,
            Some(_) => Self::Cached,
            None => Self::Unfetched,
        }
    }
}

impl fmt::Display for CorpusSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a result set came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchSource {
    /// Fetched live from the trusted cached endpoint.
    CachedEndpoint,
    /// Fetched live after walking the candidate chain.
    Live,
    /// Previous result handed to a caller that arrived during an in-flight fetch.
    Shared,
    /// Bundled dataset; every live source failed.
    Fallback,
}

impl FetchSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CachedEndpoint => "cached_endpoint",
            Self::Live => "live",
            Self::Shared => "shared",
            Self::Fallback => "fallback",
        }
    }
}

/// One failed network or parse attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptReport {
    pub url: String,
    pub strategy: Option<StrategyKind>,
    pub error: String,
}

/// Provenance of a resolve.
#[derive(Debug, Clone, Serialize)]
pub struct FetchOutcome {
    pub source: FetchSource,
    /// Endpoint and strategy that produced the records, if live.
    pub endpoint: Option<EndpointKey>,
    pub degraded: bool,
    pub fetched_at: i64,
    pub failures: Vec<AttemptReport>,
}

enum EndpointFailure {
    /// Transport failed or returned an error status.
    Network(String),
    /// Wall-clock budget ran out.
    Budget,
}

/// Walks the endpoint chain. Holds no mutable state of its own; the
/// [`FetchAttemptState`] is passed in by the caller on every call.
pub struct Resolver {
    transport: Arc<dyn Transport>,
    candidates: Vec<Endpoint>,
    cache: CachePolicy,
    retry: RetryPolicy,
    parsers: BTreeMap<StrategyKind, Parser>,
}

impl Resolver {
    pub fn new(
        transport: Arc<dyn Transport>,
        candidates: Vec<Endpoint>,
        cache: CachePolicy,
        retry: RetryPolicy,
    ) -> Self {
        let parsers = StrategyKind::ALL.iter().map(|k| (*k, k.parser())).collect();
        Self {
            transport,
            candidates,
            cache,
            retry,
            parsers,
        }
    }

    pub fn from_config(config: &FetchConfig, transport: Arc<dyn Transport>) -> Self {
        Self::new(
            transport,
            config.candidate_endpoints(),
            config.cache_policy(),
            RetryPolicy::from(config),
        )
    }

    /// Replace the parser used for `kind`.
    pub fn with_parser(mut self, kind: StrategyKind, parser: Parser) -> Self {
        self.parsers.insert(kind, parser);
        self
    }

    pub fn cache_policy(&self) -> &CachePolicy {
        &self.cache
    }

    pub fn candidates(&self) -> &[Endpoint] {
        &self.candidates
    }

    /// Resolve an endpoint and fetch records, mutating `state` to reflect
    /// the attempt.
    pub async fn resolve_and_fetch(
        &self,
        state: &mut FetchAttemptState,
    ) -> Result<(Vec<RegulationRecord>, FetchOutcome)> {
        state.validate()?;

        let now = chrono::Utc::now().timestamp();
        let deadline = Instant::now() + self.retry.total_budget;
        state.candidate_endpoints = self.candidates.clone();
        state.last_attempt_at = Some(now);

        let mut failures = Vec::new();
        let mut tried: HashSet<(String, StrategyKind)> = HashSet::new();

        // Trusted cached endpoint goes first while fresh.
        let mut plan: Vec<(Endpoint, bool)> = Vec::new();
        if let Some(cached) = state.last_successful_endpoint.clone() {
            if !state.is_cache_expired(now) {
                plan.push((
                    Endpoint {
                        url: cached.url.clone(),
                        strategies: vec![cached.strategy],
                    },
                    true,
                ));
            } else if self.cache.revalidate_on_expiry {
                debug!(endpoint = %cached, "cached endpoint expired; revalidating in candidate order");
                if !self.candidates.iter().any(|c| c.url == cached.url) {
                    plan.extend(self.candidates.iter().cloned().map(|c| (c, false)));
                    plan.push((
                        Endpoint {
                            url: cached.url.clone(),
                            strategies: vec![cached.strategy],
                        },
                        false,
                    ));
                }
            } else {
                info!(endpoint = %cached, "cached endpoint expired; forgetting it");
                state.forget_cached_endpoint();
            }
        }
        if !plan.iter().any(|(_, from_cache)| !*from_cache) {
            plan.extend(self.candidates.iter().cloned().map(|c| (c, false)));
        }

        // Per-resolve bookkeeping: a URL that failed at the network level is
        // not downloaded again, a body that failed to parse is re-parsed with
        // the remaining strategies, and each URL counts at most one failure.
        let mut unreachable: HashSet<String> = HashSet::new();
        let mut bodies: HashMap<String, Vec<u8>> = HashMap::new();
        let mut counted: HashSet<String> = HashSet::new();

        for (endpoint, from_cache) in plan {
            if unreachable.contains(&endpoint.url) {
                continue;
            }
            let strategies: Vec<StrategyKind> = endpoint
                .strategies
                .iter()
                .copied()
                .filter(|s| !tried.contains(&(endpoint.url.clone(), *s)))
                .collect();
            if strategies.is_empty() {
                continue;
            }
            for s in &strategies {
                tried.insert((endpoint.url.clone(), *s));
            }

            let body = match bodies.remove(&endpoint.url) {
                Some(body) => body,
                None => match self.fetch_with_retry(&endpoint.url, deadline, &mut failures).await {
                    Ok(body) => body,
                    Err(EndpointFailure::Budget) => {
                        warn!(
                            budget_secs = self.retry.total_budget.as_secs(),
                            "fetch budget exhausted; skipping remaining endpoints"
                        );
                        break;
                    }
                    Err(EndpointFailure::Network(reason)) => {
                        debug!(url = %endpoint.url, error = %reason, "endpoint unreachable");
                        unreachable.insert(endpoint.url.clone());
                        if counted.insert(endpoint.url.clone()) {
                            state.record_failure(&endpoint.url);
                        }
                        continue;
                    }
                },
            };

            match self.parse_body(&endpoint.url, &body, &strategies, now, &mut failures) {
                Some((records, strategy)) => {
                    let key = EndpointKey {
                        url: endpoint.url.clone(),
                        strategy,
                    };
                    info!(
                        endpoint = %key,
                        records = records.len(),
                        cached = from_cache,
                        "fetched regulations"
                    );
                    state.last_successful_endpoint = Some(key.clone());
                    state.last_success_at = Some(now);
                    state.cache_expiry = Some(now + self.cache.max_age.num_seconds());
                    state.failure_counts.insert(endpoint.url.clone(), 0);
                    state.fallback_in_use = false;

                    let outcome = FetchOutcome {
                        source: if from_cache {
                            FetchSource::CachedEndpoint
                        } else {
                            FetchSource::Live
                        },
                        endpoint: Some(key),
                        degraded: false,
                        fetched_at: now,
                        failures,
                    };
                    return Ok((records, outcome));
                }
                None => {
                    if counted.insert(endpoint.url.clone()) {
                        state.record_failure(&endpoint.url);
                    }
                    bodies.insert(endpoint.url.clone(), body);
                }
            }
        }

        let unavailable = Error::SourceUnavailable {
            message: format!("{} failed attempts across all endpoints", failures.len()),
        };
        warn!(error = %unavailable, "using bundled fallback regulations");

        let records = fallback::load(now)?;
        state.fallback_in_use = true;
        let outcome = FetchOutcome {
            source: FetchSource::Fallback,
            endpoint: None,
            degraded: true,
            fetched_at: now,
            failures,
        };
        Ok((records, outcome))
    }

    /// Apply `strategies` in order to an already downloaded body.
    fn parse_body(
        &self,
        url: &str,
        body: &[u8],
        strategies: &[StrategyKind],
        now: i64,
        failures: &mut Vec<AttemptReport>,
    ) -> Option<(Vec<RegulationRecord>, StrategyKind)> {
        let ctx = ParseContext {
            url,
            fetched_at: now,
        };
        for strategy in strategies {
            let Some(parser) = self.parsers.get(strategy) else {
                continue;
            };
            match parser(body, &ctx) {
                Some(records) if !records.is_empty() => return Some((records, *strategy)),
                _ => {
                    let mismatch = Error::ParseMismatch {
                        url: url.to_string(),
                        strategy: strategy.to_string(),
                    };
                    debug!(error = %mismatch, "strategy produced no records");
                    failures.push(AttemptReport {
                        url: url.to_string(),
                        strategy: Some(*strategy),
                        error: mismatch.to_string(),
                    });
                }
            }
        }
        None
    }

    async fn fetch_with_retry(
        &self,
        url: &str,
        deadline: Instant,
        failures: &mut Vec<AttemptReport>,
    ) -> Result<Vec<u8>, EndpointFailure> {
        let mut last_err = String::from("no attempt made");

        for attempt in 0..=self.retry.max_retries {
            if attempt > 0 {
                let delay = self.retry.backoff(attempt);
                if Instant::now() + delay >= deadline {
                    return Err(EndpointFailure::Budget);
                }
                tokio::time::sleep(delay).await;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(EndpointFailure::Budget);
            }
            let timeout = self.retry.attempt_timeout.min(remaining);

            let error = match tokio::time::timeout(timeout, self.transport.get(url)).await {
                Ok(Ok(response)) if response.is_success() => return Ok(response.body),
                Ok(Ok(response)) if response.status == 404 => {
                    warn!(url = %url, "endpoint not found (404); not retrying");
                    failures.push(AttemptReport {
                        url: url.to_string(),
                        strategy: None,
                        error: "HTTP 404".to_string(),
                    });
                    return Err(EndpointFailure::Network("HTTP 404".to_string()));
                }
                Ok(Ok(response)) => format!("HTTP {}", response.status),
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("timed out after {}ms", timeout.as_millis()),
            };

            warn!(url = %url, attempt = attempt + 1, error = %error, "fetch attempt failed");
            failures.push(AttemptReport {
                url: url.to_string(),
                strategy: None,
                error: error.clone(),
            });
            last_err = error;
        }

        Err(EndpointFailure::Network(last_err))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Transport answering from a fixed table; unknown URLs fail to connect.
    #[derive(Default)]
    pub(crate) struct ScriptedTransport {
        pub responses: Mutex<HashMap<String, (u16, String)>>,
        pub calls: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        pub fn with(pairs: &[(&str, u16, &str)]) -> Self {
            let t = Self::default();
            if let Ok(mut map) = t.responses.lock() {
                for (url, status, body) in pairs {
                    map.insert(url.to_string(), (*status, body.to_string()));
                }
            }
            t
        }

        pub fn clear(&self) {
            self.responses.lock().unwrap().clear();
        }

        pub fn call_count(&self, url: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|u| *u == url).count()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn get(&self, url: &str) -> anyhow::Result<TransportResponse> {
            self.calls.lock().unwrap().push(url.to_string());
            match self.responses.lock().unwrap().get(url) {
                Some((status, body)) => Ok(TransportResponse {
                    status: *status,
                    content_type: None,
                    body: body.clone().into_bytes(),
                }),
                None => Err(anyhow!("connection refused")),
            }
        }
    }

    pub(crate) const PART_HTML: &str = r#"<table>
<tr><td><a href="/current/title-21/chapter-I">Chapter I</a></td><td>Food and Drug Administration</td></tr>
<tr><td><a href="/current/title-21/chapter-I/subchapter-H/part-801">Part 801</a></td><td>Labeling</td><td>801.1 - 801.437</td></tr>
</table>"#;

    pub(crate) fn quick_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            backoff_base: Duration::ZERO,
            attempt_timeout: Duration::from_secs(5),
            total_budget: Duration::from_secs(30),
        }
    }

    fn endpoints(urls: &[&str]) -> Vec<Endpoint> {
        urls.iter()
            .map(|u| Endpoint {
                url: u.to_string(),
                strategies: StrategyKind::ALL.to_vec(),
            })
            .collect()
    }

    fn resolver(transport: Arc<ScriptedTransport>, urls: &[&str]) -> Resolver {
        Resolver::new(
            transport,
            endpoints(urls),
            CachePolicy::default(),
            quick_retry(),
        )
    }

    #[tokio::test]
    async fn test_first_working_endpoint_wins() {
        let transport = Arc::new(ScriptedTransport::with(&[
            ("http://a.test", 500, ""),
            ("http://b.test", 200, PART_HTML),
        ]));
        let resolver = resolver(transport.clone(), &["http://a.test", "http://b.test"]);
        let mut state = FetchAttemptState::default();

        let (records, outcome) = resolver.resolve_and_fetch(&mut state).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(outcome.source, FetchSource::Live);
        assert!(!outcome.degraded);
        assert_eq!(
            state.last_successful_endpoint,
            Some(EndpointKey {
                url: "http://b.test".into(),
                strategy: StrategyKind::Table,
            })
        );
        assert_eq!(state.failures_for("http://a.test"), 1);
        assert_eq!(state.failures_for("http://b.test"), 0);
        // 500 is retried: initial attempt plus two retries.
        assert_eq!(transport.call_count("http://a.test"), 3);
        assert!(state.validate().is_ok());
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let transport = Arc::new(ScriptedTransport::with(&[
            ("http://a.test", 404, ""),
            ("http://b.test", 200, PART_HTML),
        ]));
        let resolver = resolver(transport.clone(), &["http://a.test", "http://b.test"]);
        let mut state = FetchAttemptState::default();
        resolver.resolve_and_fetch(&mut state).await.unwrap();
        assert_eq!(transport.call_count("http://a.test"), 1);
    }

    #[tokio::test]
    async fn test_strategies_fall_through_to_api() {
        let api = r#"{"type":"title","identifier":"21","children":[
            {"type":"chapter","identifier":"I","children":[
              {"type":"part","identifier":"1","label_description":"General enforcement regulations"}]}]}"#;
        let transport = Arc::new(ScriptedTransport::with(&[("http://api.test", 200, api)]));
        let resolver = resolver(transport, &["http://api.test"]);
        let mut state = FetchAttemptState::default();

        let (records, outcome) = resolver.resolve_and_fetch(&mut state).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(outcome.endpoint.unwrap().strategy, StrategyKind::Api);
        // table and links both mismatched before api succeeded
        assert_eq!(outcome.failures.len(), 2);
    }

    #[tokio::test]
    async fn test_all_failing_returns_fallback() {
        let transport = Arc::new(ScriptedTransport::default());
        let resolver = resolver(transport, &["http://a.test", "http://b.test"]);
        let mut state = FetchAttemptState::default();

        let (records, outcome) = resolver.resolve_and_fetch(&mut state).await.unwrap();
        assert!(!records.is_empty());
        assert_eq!(outcome.source, FetchSource::Fallback);
        assert!(outcome.degraded);
        assert!(state.fallback_in_use);
        assert_eq!(state.failures_for("http://a.test"), 1);
        assert_eq!(state.failures_for("http://b.test"), 1);
        assert!(state.last_successful_endpoint.is_none());
        assert_eq!(
            health_status(&state, resolver.cache_policy(), chrono::Utc::now().timestamp()),
            HealthStatus::Error
        );
    }

    #[tokio::test]
    async fn test_fresh_cached_endpoint_is_tried_first() {
        let transport = Arc::new(ScriptedTransport::with(&[
            ("http://a.test", 200, PART_HTML),
            ("http://b.test", 200, PART_HTML),
        ]));
        let resolver = resolver(transport.clone(), &["http://a.test", "http://b.test"]);
        let now = chrono::Utc::now().timestamp();
        let mut state = FetchAttemptState {
            last_successful_endpoint: Some(EndpointKey {
                url: "http://b.test".into(),
                strategy: StrategyKind::Table,
            }),
            last_success_at: Some(now - 60),
            cache_expiry: Some(now + 3600),
            ..FetchAttemptState::default()
        };

        let (_, outcome) = resolver.resolve_and_fetch(&mut state).await.unwrap();
        assert_eq!(outcome.source, FetchSource::CachedEndpoint);
        assert_eq!(transport.call_count("http://a.test"), 0);
    }

    #[tokio::test]
    async fn test_dead_cached_endpoint_is_not_retried_as_candidate() {
        let transport = Arc::new(ScriptedTransport::with(&[
            ("http://a.test", 500, ""),
            ("http://b.test", 200, PART_HTML),
        ]));
        let resolver = resolver(transport.clone(), &["http://a.test", "http://b.test"]);
        let now = chrono::Utc::now().timestamp();
        let mut state = FetchAttemptState {
            last_successful_endpoint: Some(EndpointKey {
                url: "http://a.test".into(),
                strategy: StrategyKind::Table,
            }),
            last_success_at: Some(now - 60),
            cache_expiry: Some(now + 3600),
            ..FetchAttemptState::default()
        };

        let (_, outcome) = resolver.resolve_and_fetch(&mut state).await.unwrap();
        assert_eq!(outcome.source, FetchSource::Live);
        // one retry cycle only, and one failure for this resolve
        assert_eq!(transport.call_count("http://a.test"), 3);
        assert_eq!(state.failures_for("http://a.test"), 1);
        assert_eq!(
            state.last_successful_endpoint.map(|k| k.url),
            Some("http://b.test".to_string())
        );
    }

    #[tokio::test]
    async fn test_cached_strategy_mismatch_reuses_body() {
        let api = r#"{"type":"title","identifier":"21","children":[
            {"type":"chapter","identifier":"I","children":[
              {"type":"part","identifier":"11","label_description":"Electronic records"}]}]}"#;
        let transport = Arc::new(ScriptedTransport::with(&[("http://a.test", 200, api)]));
        let resolver = resolver(transport.clone(), &["http://a.test"]);
        let now = chrono::Utc::now().timestamp();
        let mut state = FetchAttemptState {
            last_successful_endpoint: Some(EndpointKey {
                url: "http://a.test".into(),
                strategy: StrategyKind::Table,
            }),
            last_success_at: Some(now - 60),
            cache_expiry: Some(now + 3600),
            ..FetchAttemptState::default()
        };

        let (records, outcome) = resolver.resolve_and_fetch(&mut state).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(outcome.endpoint.unwrap().strategy, StrategyKind::Api);
        assert_eq!(transport.call_count("http://a.test"), 1);
        assert_eq!(state.failures_for("http://a.test"), 0);
    }

    #[tokio::test]
    async fn test_expired_cache_is_forgotten_without_revalidation() {
        let transport = Arc::new(ScriptedTransport::default());
        let resolver = Resolver::new(
            transport,
            endpoints(&["http://a.test"]),
            CachePolicy {
                max_age: chrono::Duration::days(7),
                revalidate_on_expiry: false,
            },
            quick_retry(),
        );
        let now = chrono::Utc::now().timestamp();
        let mut state = FetchAttemptState {
            last_successful_endpoint: Some(EndpointKey {
                url: "http://old.test".into(),
                strategy: StrategyKind::Links,
            }),
            last_success_at: Some(now - 10 * 86_400),
            cache_expiry: Some(now - 3 * 86_400),
            ..FetchAttemptState::default()
        };

        resolver.resolve_and_fetch(&mut state).await.unwrap();
        assert!(state.last_successful_endpoint.is_none());
        assert!(state.validate().is_ok());
    }

    #[tokio::test]
    async fn test_expired_cache_revalidated_after_candidates() {
        let transport = Arc::new(ScriptedTransport::with(&[("http://old.test", 200, PART_HTML)]));
        let resolver = resolver(transport.clone(), &["http://a.test"]);
        let now = chrono::Utc::now().timestamp();
        let mut state = FetchAttemptState {
            last_successful_endpoint: Some(EndpointKey {
                url: "http://old.test".into(),
                strategy: StrategyKind::Table,
            }),
            last_success_at: Some(now - 10 * 86_400),
            cache_expiry: Some(now - 3 * 86_400),
            ..FetchAttemptState::default()
        };

        let (_, outcome) = resolver.resolve_and_fetch(&mut state).await.unwrap();
        assert_eq!(outcome.source, FetchSource::Live);
        assert_eq!(transport.call_count("http://a.test"), 3);
        assert_eq!(state.last_success_at, Some(outcome.fetched_at));
    }

    #[tokio::test]
    async fn test_corrupt_state_is_invariant_violation() {
        let transport = Arc::new(ScriptedTransport::default());
        let resolver = resolver(transport, &["http://a.test"]);
        let mut state = FetchAttemptState {
            last_successful_endpoint: Some(EndpointKey {
                url: "http://a.test".into(),
                strategy: StrategyKind::Table,
            }),
            ..FetchAttemptState::default()
        };
        let err = resolver.resolve_and_fetch(&mut state).await.unwrap_err();
        assert!(matches!(err, Error::InvariantViolation { .. }));

        let err = FetchAttemptState::from_json("{not json").unwrap_err();
        assert!(matches!(err, Error::InvariantViolation { .. }));
    }

    #[tokio::test]
    async fn test_zero_budget_goes_straight_to_fallback() {
        let transport = Arc::new(ScriptedTransport::with(&[("http://a.test", 200, PART_HTML)]));
        let resolver = Resolver::new(
            transport.clone(),
            endpoints(&["http://a.test"]),
            CachePolicy::default(),
            RetryPolicy {
                total_budget: Duration::ZERO,
                ..quick_retry()
            },
        );
        let mut state = FetchAttemptState::default();
        let (_, outcome) = resolver.resolve_and_fetch(&mut state).await.unwrap();
        assert_eq!(outcome.source, FetchSource::Fallback);
        assert_eq!(transport.call_count("http://a.test"), 0);
        // budget exhaustion is not an endpoint failure
        assert_eq!(state.failures_for("http://a.test"), 0);
    }

    #[tokio::test]
    async fn test_health_transitions() {
        let transport = Arc::new(ScriptedTransport::with(&[("http://a.test", 200, PART_HTML)]));
        let resolver = resolver(transport.clone(), &["http://a.test"]);
        let policy = *resolver.cache_policy();
        let mut state = FetchAttemptState::default();
        let now = || chrono::Utc::now().timestamp();

        assert_eq!(health_status(&state, &policy, now()), HealthStatus::Error);

        resolver.resolve_and_fetch(&mut state).await.unwrap();
        assert_eq!(health_status(&state, &policy, now()), HealthStatus::Healthy);

        transport.clear();
        let (_, outcome) = resolver.resolve_and_fetch(&mut state).await.unwrap();
        assert!(outcome.degraded);
        assert_eq!(health_status(&state, &policy, now()), HealthStatus::Degraded);
    }

    #[test]
    fn test_stale_success_is_degraded() {
        let state = FetchAttemptState {
            last_successful_endpoint: Some(EndpointKey {
                url: "http://a.test".into(),
                strategy: StrategyKind::Table,
            }),
            last_success_at: Some(0),
            cache_expiry: Some(7 * 86_400),
            ..FetchAttemptState::default()
        };
        let policy = CachePolicy::default();
        assert_eq!(health_status(&state, &policy, 86_400), HealthStatus::Healthy);
        assert_eq!(health_status(&state, &policy, 30 * 86_400), HealthStatus::Degraded);
    }

    #[test]
    fn test_corpus_source_from_state() {
        let policy = CachePolicy::default();
        let mut state = FetchAttemptState::default();
        assert_eq!(CorpusSource::from_state(&state, &policy, 100), CorpusSource::Unfetched);

        state.last_successful_endpoint = Some(EndpointKey {
            url: "http://a.test".into(),
            strategy: StrategyKind::Table,
        });
        state.last_success_at = Some(0);
        state.cache_expiry = Some(7 * 86_400);
        assert_eq!(CorpusSource::from_state(&state, &policy, 86_400), CorpusSource::Live);
        assert_eq!(CorpusSource::from_state(&state, &policy, 30 * 86_400), CorpusSource::Cached);

        state.fallback_in_use = true;
        assert_eq!(CorpusSource::from_state(&state, &policy, 86_400), CorpusSource::Fallback);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let retry = RetryPolicy {
            backoff_base: Duration::from_millis(100),
            ..quick_retry()
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(3), Duration::from_millis(400));
        assert_eq!(retry.backoff(10), Duration::from_millis(3200));
    }

    #[test]
    fn test_state_json_roundtrip_validates() {
        let state = FetchAttemptState::new(endpoints(&["http://a.test"]));
        let json = state.to_json().unwrap();
        assert_eq!(FetchAttemptState::from_json(&json).unwrap(), state);
    }
}
