//! End-to-end library flow with fakes:
//! refresh → index → hybrid search → analyze, plus health transitions when
//! the source goes away.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use cfr_harness::agent::{Orchestrator, SummarySource};
use cfr_harness::config::{AgentConfig, RetrievalConfig};
use cfr_harness::embedding::EmbeddingProvider;
use cfr_harness::fetch::{
    CachePolicy, CorpusSource, Endpoint, FetchService, FetchSource, HealthStatus, Resolver, RetryPolicy,
    StrategyKind, Transport, TransportResponse,
};
use cfr_harness::index::EmbeddingIndex;
use cfr_harness::llm::DisabledLlm;
use cfr_harness::refresh::refresh;
use cfr_harness::search::HybridEngine;
use cfr_harness::store::{InMemoryStore, RecordStore};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SOURCE_URL: &str = "http://ecfr.test/current/title-21";

const TOC_HTML: &str = r#"
<html><body>
<table class="regulation-table">
  <tr><th>Heading</th><th>Description</th><th>Sections</th></tr>
  <tr><td><a href="/current/title-21/chapter-I">Chapter I</a></td><td>Food and Drug Administration</td><td>1 - 1299</td></tr>
  <tr><td><a href="/current/title-21/chapter-I/subchapter-H">Subchapter H</a></td><td>Medical Devices</td><td>800 - 898</td></tr>
  <tr><td><a href="/current/title-21/chapter-I/subchapter-H/part-801">Part 801</a></td><td>Labeling requirements for medical devices</td><td>801.1 - 801.437</td></tr>
  <tr><td><a href="/current/title-21/chapter-I/subchapter-H/part-862">Part 862</a></td><td>Clinical Chemistry and Clinical Toxicology Devices</td><td>862.1 - 862.3950</td></tr>
</table>
</body></html>"#;

/// Serves `TOC_HTML` until switched off, then refuses connections.
struct SwitchableTransport {
    up: Mutex<bool>,
}

impl SwitchableTransport {
    fn new() -> Self {
        Self { up: Mutex::new(true) }
    }

    fn take_down(&self) {
        *self.up.lock().unwrap() = false;
    }
}

#[async_trait]
impl Transport for SwitchableTransport {
    async fn get(&self, url: &str) -> Result<TransportResponse> {
        if !*self.up.lock().unwrap() {
            return Err(anyhow!("connection refused"));
        }
        if url != SOURCE_URL {
            return Ok(TransportResponse {
                status: 404,
                content_type: None,
                body: Vec::new(),
            });
        }
        Ok(TransportResponse {
            status: 200,
            content_type: Some("text/html".into()),
            body: TOC_HTML.as_bytes().to_vec(),
        })
    }
}

/// Bag-of-concepts embedder: one dimension per concept, with synonyms.
#[derive(Default)]
struct ConceptProvider {
    calls: AtomicUsize,
}

const CONCEPTS: &[&[&str]] = &[
    &["label"],
    &["device"],
    &["toxic", "poison"],
    &["chemistry", "chemical"],
    &["food"],
    &["drug"],
];

#[async_trait]
impl EmbeddingProvider for ConceptProvider {
    fn model_name(&self) -> &str {
        "concepts-v1"
    }

    fn dims(&self) -> usize {
        CONCEPTS.len()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts
            .iter()
            .map(|t| {
                let t = t.to_lowercase();
                CONCEPTS
                    .iter()
                    .map(|words| words.iter().filter(|w| t.contains(*w)).count() as f32)
                    .collect()
            })
            .collect())
    }
}

fn fetch_service(transport: Arc<SwitchableTransport>, store: Arc<InMemoryStore>) -> FetchService {
    let resolver = Resolver::new(
        transport,
        vec![
            Endpoint {
                url: SOURCE_URL.to_string(),
                strategies: StrategyKind::ALL.to_vec(),
            },
            Endpoint {
                url: "http://ecfr.test/api/title/21".to_string(),
                strategies: vec![StrategyKind::Api],
            },
        ],
        CachePolicy::default(),
        RetryPolicy {
            max_retries: 1,
            backoff_base: Duration::ZERO,
            attempt_timeout: Duration::from_secs(5),
            total_budget: Duration::from_secs(30),
        },
    );
    FetchService::new(resolver, store)
}

#[tokio::test]
async fn test_refresh_index_search_analyze() {
    let store = Arc::new(InMemoryStore::new());
    let transport = Arc::new(SwitchableTransport::new());
    let service = fetch_service(transport.clone(), store.clone());

    assert_eq!(service.health().await.unwrap(), HealthStatus::Error);

    let report = refresh(&service, store.as_ref(), false).await.unwrap();
    assert_eq!(report.source, FetchSource::Live);
    assert_eq!(report.added, 4);
    assert!(report.committed);
    assert_eq!(service.health().await.unwrap(), HealthStatus::Healthy);

    let provider = Arc::new(ConceptProvider::default());
    let index = Arc::new(EmbeddingIndex::new(store.clone(), provider.clone(), 16));
    index.spawn_reindex().await.unwrap();
    assert_eq!(index.snapshot().len(), 4);

    let calls = provider.calls.load(Ordering::SeqCst);
    let again = index.reindex().await.unwrap();
    assert_eq!(again.embedded, 0);
    assert_eq!(again.skipped, 4);
    assert_eq!(provider.calls.load(Ordering::SeqCst), calls);

    let engine = HybridEngine::new(store.clone(), Some(index.clone()), RetrievalConfig::default());
    assert_eq!(
        engine.search("labeling", 5, false).await.unwrap().meta.corpus_source,
        CorpusSource::Live
    );

    // No record mentions "poison"; only the embedding links it to toxicology.
    let response = engine.search("poison", 5, true).await.unwrap();
    assert!(response.meta.semantic_used);
    assert_eq!(response.meta.keyword_candidates, 0);
    assert_eq!(
        response.results.first().map(|r| r.record.part.as_str()),
        Some("Part 862")
    );

    let response = engine.search("labeling", 5, true).await.unwrap();
    assert_eq!(
        response.results.first().map(|r| r.record.part.as_str()),
        Some("Part 801")
    );

    let orchestrator = Orchestrator::new(
        Arc::new(engine),
        store.clone(),
        Arc::new(DisabledLlm),
        AgentConfig::default(),
        5,
    );
    let analysis = orchestrator.analyze("labeling", Some("devices")).await.unwrap();
    assert_eq!(analysis.summary_source, SummarySource::Raw);
    assert!(analysis
        .categorized_results
        .iter()
        .any(|c| c.chapter == "Chapter I" && c.subchapter == "Subchapter H"));
    assert_eq!(store.recent_searches(10).await.unwrap().len(), 1);

    let items = orchestrator
        .batch_search(&["labeling".to_string(), "".to_string()])
        .await;
    assert_eq!(items.len(), 2);
    assert!(items[0].analysis.is_some());
    assert!(items[1].error.is_some());
}

#[tokio::test]
async fn test_source_outage_degrades_but_keeps_corpus() {
    let store = Arc::new(InMemoryStore::new());
    let transport = Arc::new(SwitchableTransport::new());
    let service = fetch_service(transport.clone(), store.clone());

    refresh(&service, store.as_ref(), false).await.unwrap();
    assert_eq!(service.health().await.unwrap(), HealthStatus::Healthy);

    transport.take_down();
    let report = refresh(&service, store.as_ref(), false).await.unwrap();
    assert_eq!(report.source, FetchSource::Fallback);
    assert!(report.degraded);
    assert!(!report.committed);
    assert_eq!(store.get_all().await.unwrap().len(), 4);
    assert_eq!(service.health().await.unwrap(), HealthStatus::Degraded);

    // One change batch only: the outage recorded nothing.
    assert_eq!(store.recent_changes(0, 100).await.unwrap().len(), 4);

    let engine = HybridEngine::new(store.clone(), None, RetrievalConfig::default());
    let response = engine.search("labeling", 5, false).await.unwrap();
    assert_eq!(response.meta.corpus_source, CorpusSource::Fallback);
    assert!(response.meta.is_degraded());
}
