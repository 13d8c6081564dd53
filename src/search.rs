//! Hybrid retrieval: keyword matching fused with vector similarity.
//!
//! The keyword path counts how many of `description`, `part`, `chapter`
//! and `subchapter` contain any query term (case-insensitive substring).
//! The semantic path embeds the query and takes the top `K =
//! candidate_multiplier × limit` neighbours from the [`EmbeddingIndex`].
//!
//! Both candidate lists are min-max normalized to `[0, 1]` and combined per
//! record as `keyword_weight · k + semantic_weight · s`, where a record
//! missing from one list contributes `0` for that term. Results are ordered
//! by fused score desc, then `last_updated` desc, then id asc.
//!
//! A missing or broken index never fails a search: the engine falls back to
//! keyword ranking and says so in [`SearchMeta`].

use anyhow::Result;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::{Config, RetrievalConfig};
use crate::db;
use crate::embedding::{self, EmbeddingProvider};
use crate::error::Error;
use crate::fetch::{CachePolicy, CorpusSource, FetchAttemptState};
use crate::index::EmbeddingIndex;
use crate::models::{RegulationRecord, SearchHistoryEntry};
use crate::store::{RecordStore, SqliteStore};

/// One ranked result.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredRecord {
    pub record: RegulationRecord,
    pub score: f64,
    pub keyword_score: f64,
    pub semantic_score: f64,
}

/// How a search was actually carried out.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchMeta {
    pub semantic_requested: bool,
    pub semantic_used: bool,
    /// Why semantic retrieval was skipped, when it was requested.
    pub degraded_reason: Option<String>,
    pub keyword_candidates: usize,
    pub semantic_candidates: usize,
    /// Provenance of the corpus that was searched.
    pub corpus_source: CorpusSource,
}

impl SearchMeta {
    /// Semantic retrieval was skipped, or the corpus is fallback data.
    pub fn is_degraded(&self) -> bool {
        self.degraded_reason.is_some() || self.corpus_source == CorpusSource::Fallback
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchResponse {
    pub results: Vec<ScoredRecord>,
    pub meta: SearchMeta,
}

impl SearchResponse {
    pub fn ids(&self) -> Vec<i64> {
        self.results.iter().map(|r| r.record.id).collect()
    }
}

pub struct HybridEngine {
    store: Arc<dyn RecordStore>,
    index: Option<Arc<EmbeddingIndex>>,
    config: RetrievalConfig,
    cache: CachePolicy,
}

impl HybridEngine {
    pub fn new(
        store: Arc<dyn RecordStore>,
        index: Option<Arc<EmbeddingIndex>>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            index,
            config,
            cache: CachePolicy::default(),
        }
    }

    /// Cache window used to tell live from cached corpus provenance.
    pub fn with_cache_policy(mut self, cache: CachePolicy) -> Self {
        self.cache = cache;
        self
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn index(&self) -> Option<&Arc<EmbeddingIndex>> {
        self.index.as_ref()
    }

    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        use_semantic: bool,
    ) -> Result<SearchResponse> {
        let mut meta = SearchMeta {
            semantic_requested: use_semantic,
            corpus_source: self.corpus_source().await?,
            ..SearchMeta::default()
        };
        if query.trim().is_empty() || limit == 0 {
            return Ok(SearchResponse {
                results: Vec::new(),
                meta,
            });
        }

        let records = self.store.get_all().await?;

        let keyword = keyword_candidates(&records, query);
        meta.keyword_candidates = keyword.len();

        let semantic = if use_semantic {
            match self.semantic_candidates(query, limit).await {
                Ok(hits) => {
                    meta.semantic_used = true;
                    hits
                }
                Err(e) => {
                    debug!(error = %e, "semantic retrieval unavailable; keyword only");
                    meta.degraded_reason = Some(e.to_string());
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };
        meta.semantic_candidates = semantic.len();

        let (keyword_weight, semantic_weight) = if meta.semantic_used {
            (self.config.keyword_weight, self.config.semantic_weight)
        } else {
            (1.0, 0.0)
        };

        let by_id: HashMap<i64, &RegulationRecord> = records.iter().map(|r| (r.id, r)).collect();
        let results = fuse(
            &by_id,
            &keyword,
            &semantic,
            keyword_weight,
            semantic_weight,
            limit,
        );
        Ok(SearchResponse { results, meta })
    }

    /// Read from the persisted fetch state; never touches the network.
    async fn corpus_source(&self) -> Result<CorpusSource> {
        let Some(json) = self.store.load_fetch_state().await? else {
            return Ok(CorpusSource::Unfetched);
        };
        let state = FetchAttemptState::from_json(&json)?;
        Ok(CorpusSource::from_state(
            &state,
            &self.cache,
            chrono::Utc::now().timestamp(),
        ))
    }

    async fn semantic_candidates(&self, query: &str, limit: usize) -> Result<Vec<(i64, f64)>, Error> {
        let index = self.index.as_ref().ok_or_else(|| Error::IndexUnavailable {
            reason: "no embedding provider configured".to_string(),
        })?;

        let truncated: String = query.chars().take(self.config.max_query_chars).collect();
        let provider: &dyn EmbeddingProvider = index.provider();
        let vector = embedding::embed_query(provider, &truncated)
            .await
            .map_err(|e| Error::IndexUnavailable {
                reason: format!("query embedding failed: {}", e),
            })?;

        let k = self.config.candidate_multiplier.saturating_mul(limit);
        let hits = index.nearest(&vector, k, self.config.min_similarity)?;
        Ok(hits.into_iter().map(|(id, s)| (id, s as f64)).collect())
    }
}

/// Lowercased whitespace-separated terms.
pub fn query_terms(query: &str) -> Vec<String> {
    query
        .split_whitespace()
        .map(|t| t.to_lowercase())
        .collect()
}

/// Number of searchable fields containing any term.
pub fn keyword_score(record: &RegulationRecord, terms: &[String]) -> usize {
    [
        &record.description,
        &record.part,
        &record.chapter,
        &record.subchapter,
    ]
    .iter()
    .filter(|field| {
        let field = field.to_lowercase();
        terms.iter().any(|t| field.contains(t.as_str()))
    })
    .count()
}

fn keyword_candidates(records: &[RegulationRecord], query: &str) -> Vec<(i64, f64)> {
    let terms = query_terms(query);
    records
        .iter()
        .filter_map(|r| {
            let score = keyword_score(r, &terms);
            (score > 0).then_some((r.id, score as f64))
        })
        .collect()
}

/// Min-max normalize scores to `[0, 1]`; an all-equal list maps to `1.0`.
pub fn normalize_scores(candidates: &[(i64, f64)]) -> Vec<(i64, f64)> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let s_min = candidates
        .iter()
        .map(|(_, s)| *s)
        .fold(f64::INFINITY, f64::min);
    let s_max = candidates
        .iter()
        .map(|(_, s)| *s)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .iter()
        .map(|(id, s)| {
            let norm = if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (s - s_min) / (s_max - s_min)
            };
            (*id, norm)
        })
        .collect()
}

fn fuse(
    records: &HashMap<i64, &RegulationRecord>,
    keyword: &[(i64, f64)],
    semantic: &[(i64, f64)],
    keyword_weight: f64,
    semantic_weight: f64,
    limit: usize,
) -> Vec<ScoredRecord> {
    let kw: HashMap<i64, f64> = normalize_scores(keyword).into_iter().collect();
    let sem: HashMap<i64, f64> = normalize_scores(semantic).into_iter().collect();
    let ids: BTreeSet<i64> = kw.keys().chain(sem.keys()).copied().collect();

    let mut results: Vec<ScoredRecord> = ids
        .into_iter()
        .filter_map(|id| {
            // Vectors may outlive their record until the next re-index.
            let record = records.get(&id)?;
            let k = kw.get(&id).copied().unwrap_or(0.0);
            let s = sem.get(&id).copied().unwrap_or(0.0);
            Some(ScoredRecord {
                record: (*record).clone(),
                score: keyword_weight * k + semantic_weight * s,
                keyword_score: k,
                semantic_score: s,
            })
        })
        .collect();

    results.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then(b.record.last_updated.cmp(&a.record.last_updated))
            .then(a.record.id.cmp(&b.record.id))
    });
    results.truncate(limit);
    results
}

/// Open the SQLite store and, when embeddings are configured, an index
/// loaded from the stored vectors.
pub async fn open_engine(config: &Config) -> Result<(Arc<SqliteStore>, HybridEngine)> {
    let store = Arc::new(SqliteStore::new(db::connect(config).await?));
    let index = open_index(config, store.clone()).await;
    let engine = HybridEngine::new(store.clone(), index, config.retrieval.clone())
        .with_cache_policy(config.fetch.cache_policy());
    Ok((store, engine))
}

async fn open_index(config: &Config, store: Arc<SqliteStore>) -> Option<Arc<EmbeddingIndex>> {
    if !config.embedding.is_enabled() {
        return None;
    }
    let provider: Arc<dyn EmbeddingProvider> = match embedding::create_provider(&config.embedding) {
        Ok(p) => Arc::from(p),
        Err(e) => {
            warn!(error = %e, "embedding provider unavailable; keyword search only");
            return None;
        }
    };
    let index = Arc::new(EmbeddingIndex::new(
        store,
        provider,
        config.embedding.batch_size,
    ));
    if let Err(e) = index.load().await {
        warn!(error = %e, "failed to load embedding index");
    }
    Some(index)
}

/// CLI entry point for `cfr search`.
pub async fn run_search(
    config: &Config,
    query: &str,
    limit: Option<usize>,
    keyword_only: bool,
    explain: bool,
) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    let (store, engine) = open_engine(config).await?;
    let limit = limit.unwrap_or(config.retrieval.final_limit);
    let response = engine.search(query, limit, !keyword_only).await?;

    store
        .append_search(&SearchHistoryEntry {
            query: query.to_string(),
            result_count: response.results.len(),
            result_ids: response.ids(),
            timestamp: chrono::Utc::now().timestamp(),
        })
        .await?;

    if response.meta.corpus_source == CorpusSource::Fallback {
        println!("(corpus: bundled fallback data; live sources unavailable)");
    }
    if let Some(reason) = &response.meta.degraded_reason {
        println!("(keyword only: {})", reason);
    }
    if response.meta.is_degraded() {
        println!();
    }

    if response.results.is_empty() {
        println!("No results.");
        store.close().await;
        return Ok(());
    }

    for (i, result) in response.results.iter().enumerate() {
        let r = &result.record;
        let date = chrono::DateTime::from_timestamp(r.last_updated, 0)
            .map(|dt| dt.format("%Y-%m-%d").to_string())
            .unwrap_or_default();

        println!(
            "{}. [{:.2}] {} / {} / {}",
            i + 1,
            result.score,
            r.chapter,
            r.subchapter,
            r.part
        );
        println!("    {}", r.description);
        if !r.section_range.is_empty() {
            println!("    sections: {}", r.section_range);
        }
        println!("    status: {}   updated: {}", r.status, date);
        if !r.source_url.is_empty() {
            println!("    url: {}", r.source_url);
        }
        if explain {
            println!(
                "    explain: keyword={:.3} semantic={:.3}",
                result.keyword_score, result.semantic_score
            );
        }
        println!("    id: {}", r.id);
        println!();
    }

    store.close().await;
    Ok(())
}
