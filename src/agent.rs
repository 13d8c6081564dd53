//! Orchestration pipeline: retrieve → categorize → recommend → summarize.
//!
//! Each stage is a plain function over the previous stage's output; the
//! [`Orchestrator`] only sequences them and talks to the store and the LLM.
//! Batch mode runs every query independently with its own timeout and
//! annotates each result instead of failing the batch.
//!
//! The orchestrator also answers free-form questions from retrieved records
//! ([`Orchestrator::ask`]) and writes per-regulation summaries back to the
//! store ([`Orchestrator::summarize_regulation`]). Both fall back to the
//! records' own text when the LLM is unavailable.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{AgentConfig, Config};
use crate::error::Error;
use crate::llm::{self, LlmService};
use crate::models::{RegulationRecord, SearchHistoryEntry};
use crate::search::{self, query_terms, HybridEngine, ScoredRecord, SearchMeta, SearchResponse};
use crate::store::RecordStore;

/// Anything that can rank records for a query.
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, query: &str, limit: usize) -> Result<SearchResponse>;
}

#[async_trait]
impl Retriever for HybridEngine {
    async fn retrieve(&self, query: &str, limit: usize) -> Result<SearchResponse> {
        self.search(query, limit, self.index().is_some()).await
    }
}

/// Records sharing one `(chapter, subchapter)` key.
#[derive(Debug, Clone, Serialize)]
pub struct Category {
    pub chapter: String,
    pub subchapter: String,
    pub records: Vec<RegulationRecord>,
}

impl Category {
    pub fn label(&self) -> String {
        match (self.chapter.is_empty(), self.subchapter.is_empty()) {
            (false, false) => format!("{} - {}", self.chapter, self.subchapter),
            (false, true) => self.chapter.clone(),
            (true, false) => self.subchapter.clone(),
            (true, true) => "Uncategorized".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SummarySource {
    Llm,
    Raw,
}

impl SummarySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Llm => "llm",
            Self::Raw => "raw",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResult {
    pub query: String,
    pub summary: String,
    pub summary_source: SummarySource,
    pub categorized_results: Vec<Category>,
    pub recommendations: Vec<String>,
    pub results: Vec<ScoredRecord>,
    pub meta: SearchMeta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Success,
    Degraded,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchItem {
    pub query: String,
    pub status: ItemStatus,
    pub analysis: Option<AnalysisResult>,
    pub error: Option<String>,
}

/// Records cited alongside an answer.
const ANSWER_RELEVANT: usize = 5;

/// Fallback summaries keep this many characters of the description.
const RAW_SUMMARY_CHARS: usize = 200;

#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub question: String,
    pub answer: String,
    pub source: SummarySource,
    pub references: Vec<String>,
    pub relevant: Vec<RegulationRecord>,
    pub meta: SearchMeta,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegulationSummary {
    pub record: RegulationRecord,
    pub summary: String,
    pub source: SummarySource,
    /// Written to the record's `content_summary`.
    pub saved: bool,
}

pub struct Orchestrator {
    retriever: Arc<dyn Retriever>,
    store: Arc<dyn RecordStore>,
    llm: Arc<dyn LlmService>,
    config: AgentConfig,
    limit: usize,
}

impl Orchestrator {
    pub fn new(
        retriever: Arc<dyn Retriever>,
        store: Arc<dyn RecordStore>,
        llm: Arc<dyn LlmService>,
        config: AgentConfig,
        limit: usize,
    ) -> Self {
        Self {
            retriever,
            store,
            llm,
            config,
            limit,
        }
    }

    /// Run the full pipeline for one query and log it to the search history.
    ///
    /// Only malformed input is an error; a degraded retrieval or an
    /// unavailable LLM still yields a result.
    pub async fn analyze(&self, query: &str, context: Option<&str>) -> Result<AnalysisResult> {
        validate_query(query, self.config.max_query_chars)?;

        let augmented = augment_query(query, context);
        let response = self.retriever.retrieve(&augmented, self.limit).await?;
        let records: Vec<RegulationRecord> =
            response.results.iter().map(|r| r.record.clone()).collect();

        let categorized_results = categorize(&records);

        let history = self.store.recent_searches(self.config.history_window).await?;
        let ids: Vec<i64> = records.iter().map(|r| r.id).collect();
        let recommendations = recommend(query, &ids, &history, self.config.recommendations);

        let (summary, summary_source) = self.summarize(query, &records).await;

        self.store
            .append_search(&SearchHistoryEntry {
                query: query.to_string(),
                result_count: records.len(),
                result_ids: ids,
                timestamp: chrono::Utc::now().timestamp(),
            })
            .await?;

        Ok(AnalysisResult {
            query: query.to_string(),
            summary,
            summary_source,
            categorized_results,
            recommendations,
            results: response.results,
            meta: response.meta,
        })
    }

    async fn summarize(&self, query: &str, records: &[RegulationRecord]) -> (String, SummarySource) {
        if records.is_empty() {
            return (format!("No regulations found for '{}'", query), SummarySource::Raw);
        }
        match self.llm.summarize(query, records).await {
            Ok(summary) => (summary, SummarySource::Llm),
            Err(e) => {
                debug!(llm = self.llm.name(), error = %e, "summary unavailable; using raw descriptions");
                (llm::raw_summary(records), SummarySource::Raw)
            }
        }
    }

    /// Answer a question from retrieved records. Without an LLM the answer
    /// is the descriptions of the most relevant records.
    pub async fn ask(&self, question: &str) -> Result<Answer> {
        validate_query(question, self.config.max_query_chars)?;

        let response = self.retriever.retrieve(question.trim(), self.limit).await?;
        let records: Vec<RegulationRecord> =
            response.results.iter().map(|r| r.record.clone()).collect();
        let relevant: Vec<RegulationRecord> = records.iter().take(ANSWER_RELEVANT).cloned().collect();

        let (answer, references, source) = if records.is_empty() {
            (
                format!("No regulations found for '{}'", question.trim()),
                Vec::new(),
                SummarySource::Raw,
            )
        } else {
            match self.llm.answer(question, &records).await {
                Ok(reply) => {
                    let (answer, references) = llm::parse_answer(&reply);
                    (answer, references, SummarySource::Llm)
                }
                Err(e) => {
                    debug!(llm = self.llm.name(), error = %e, "answer unavailable; citing records");
                    (llm::raw_summary(&relevant), Vec::new(), SummarySource::Raw)
                }
            }
        };

        Ok(Answer {
            question: question.trim().to_string(),
            answer,
            source,
            references,
            relevant,
            meta: response.meta,
        })
    }

    /// Summarize one regulation and persist the result as its
    /// `content_summary`. A fallback summary is returned but never saved.
    pub async fn summarize_regulation(&self, id: i64) -> Result<RegulationSummary> {
        let Some(mut record) = self.store.get_by_id(id).await? else {
            return Err(Error::validation(format!("regulation not found: {}", id)).into());
        };

        match self.llm.summarize_record(&record).await {
            Ok(summary) => {
                record.content_summary = Some(summary.clone());
                self.store.upsert(std::slice::from_ref(&record)).await?;
                Ok(RegulationSummary {
                    record,
                    summary,
                    source: SummarySource::Llm,
                    saved: true,
                })
            }
            Err(e) => {
                debug!(llm = self.llm.name(), error = %e, "summary unavailable; using description");
                let summary = truncate(&record.description, RAW_SUMMARY_CHARS);
                Ok(RegulationSummary {
                    record,
                    summary,
                    source: SummarySource::Raw,
                    saved: false,
                })
            }
        }
    }

    /// Analyze each query independently. One result per input, in order.
    pub async fn batch_search(&self, queries: &[String]) -> Vec<BatchItem> {
        let timeout = Duration::from_secs(self.config.item_timeout_secs);
        let mut items = Vec::with_capacity(queries.len());

        for query in queries {
            let item = match tokio::time::timeout(timeout, self.analyze(query, None)).await {
                Ok(Ok(analysis)) => {
                    let status = if analysis.meta.is_degraded() {
                        ItemStatus::Degraded
                    } else {
                        ItemStatus::Success
                    };
                    BatchItem {
                        query: query.clone(),
                        status,
                        analysis: Some(analysis),
                        error: None,
                    }
                }
                Ok(Err(e)) => {
                    warn!(query = %query, error = %e, "batch item failed");
                    BatchItem {
                        query: query.clone(),
                        status: ItemStatus::Error,
                        analysis: None,
                        error: Some(e.to_string()),
                    }
                }
                Err(_) => {
                    warn!(query = %query, timeout_secs = timeout.as_secs(), "batch item timed out");
                    BatchItem {
                        query: query.clone(),
                        status: ItemStatus::Error,
                        analysis: None,
                        error: Some(format!("timed out after {}s", timeout.as_secs())),
                    }
                }
            };
            items.push(item);
        }
        items
    }
}

pub fn validate_query(query: &str, max_chars: usize) -> Result<(), Error> {
    if query.trim().is_empty() {
        return Err(Error::validation("query must not be empty"));
    }
    let len = query.chars().count();
    if len > max_chars {
        return Err(Error::validation(format!(
            "query is {} characters; the limit is {}",
            len, max_chars
        )));
    }
    Ok(())
}

/// Context is appended as extra search terms; it never replaces the query.
pub fn augment_query(query: &str, context: Option<&str>) -> String {
    match context.map(str::trim) {
        Some(ctx) if !ctx.is_empty() => format!("{} {}", query.trim(), ctx),
        _ => query.trim().to_string(),
    }
}

/// Group by `(chapter, subchapter)` in order of first appearance.
pub fn categorize(records: &[RegulationRecord]) -> Vec<Category> {
    let mut categories: Vec<Category> = Vec::new();
    let mut positions: HashMap<(String, String), usize> = HashMap::new();

    for record in records {
        let key = (record.chapter.clone(), record.subchapter.clone());
        match positions.get(&key) {
            Some(&i) => categories[i].records.push(record.clone()),
            None => {
                positions.insert(key, categories.len());
                categories.push(Category {
                    chapter: record.chapter.clone(),
                    subchapter: record.subchapter.clone(),
                    records: vec![record.clone()],
                });
            }
        }
    }
    categories
}

/// Terms from past queries whose results overlap `result_ids`.
///
/// Each past query contributes its overlap size to every one of its terms.
/// Terms of the current query, and past queries identical to it, are
/// skipped. Ties go to the alphabetically first term.
pub fn recommend(
    query: &str,
    result_ids: &[i64],
    history: &[SearchHistoryEntry],
    n: usize,
) -> Vec<String> {
    let current: HashSet<i64> = result_ids.iter().copied().collect();
    let own_terms: HashSet<String> = query_terms(query).into_iter().collect();
    let normalized_query = query.trim().to_lowercase();

    let mut weights: BTreeMap<String, usize> = BTreeMap::new();
    for entry in history {
        if entry.query.trim().to_lowercase() == normalized_query {
            continue;
        }
        let overlap = entry
            .result_ids
            .iter()
            .collect::<HashSet<_>>()
            .into_iter()
            .filter(|id| current.contains(id))
            .count();
        if overlap == 0 {
            continue;
        }
        let terms: HashSet<String> = query_terms(&entry.query).into_iter().collect();
        for term in terms {
            if own_terms.contains(&term) || term == normalized_query {
                continue;
            }
            *weights.entry(term).or_insert(0) += overlap;
        }
    }

    let mut ranked: Vec<(String, usize)> = weights.into_iter().collect();
    // BTreeMap order is alphabetical; a stable sort keeps it for ties.
    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    ranked.into_iter().take(n).map(|(term, _)| term).collect()
}

async fn open_orchestrator(config: &Config) -> Result<Orchestrator> {
    let (store, engine) = search::open_engine(config).await?;
    let llm: Arc<dyn LlmService> = match llm::create_llm(&config.llm) {
        Ok(service) => Arc::from(service),
        Err(e) => {
            warn!(error = %e, "LLM unavailable; summaries will use raw descriptions");
            Arc::new(llm::DisabledLlm)
        }
    };
    Ok(Orchestrator::new(
        Arc::new(engine),
        store,
        llm,
        config.agent.clone(),
        config.retrieval.final_limit,
    ))
}

/// CLI entry point for `cfr analyze`.
pub async fn run_analyze(config: &Config, query: &str, context: Option<&str>) -> Result<()> {
    let orchestrator = open_orchestrator(config).await?;
    let analysis = orchestrator.analyze(query, context).await?;
    print_analysis(&analysis);
    Ok(())
}

/// CLI entry point for `cfr batch`.
pub async fn run_batch(config: &Config, queries: &[String]) -> Result<()> {
    let orchestrator = open_orchestrator(config).await?;
    let items = orchestrator.batch_search(queries).await;

    for (i, item) in items.iter().enumerate() {
        let status = match item.status {
            ItemStatus::Success => "success",
            ItemStatus::Degraded => "degraded",
            ItemStatus::Error => "error",
        };
        println!("[{}] {} ({})", i + 1, item.query, status);
        match (&item.analysis, &item.error) {
            (Some(analysis), _) => {
                println!("    results: {}", analysis.results.len());
                println!("    corpus: {}", analysis.meta.corpus_source);
                for category in &analysis.categorized_results {
                    println!("    {} ({})", category.label(), category.records.len());
                }
            }
            (None, Some(error)) => println!("    error: {}", error),
            (None, None) => {}
        }
        println!();
    }
    Ok(())
}

/// CLI entry point for `cfr ask`.
pub async fn run_ask(config: &Config, question: &str) -> Result<()> {
    let orchestrator = open_orchestrator(config).await?;
    let answer = orchestrator.ask(question).await?;

    println!("Question: {}", answer.question);
    println!("Corpus:   {}", answer.meta.corpus_source);
    println!();
    println!("Answer ({}):", answer.source.as_str());
    println!("{}", answer.answer);
    if !answer.references.is_empty() {
        println!();
        println!("References:");
        for reference in &answer.references {
            println!("  - {}", reference);
        }
    }
    if !answer.relevant.is_empty() {
        println!();
        println!("Relevant regulations:");
        for (i, r) in answer.relevant.iter().enumerate() {
            println!(
                "  {}. {}: {} (id: {})",
                i + 1,
                r.part,
                truncate(&r.description, 80),
                r.id
            );
        }
    }
    Ok(())
}

/// CLI entry point for `cfr summarize`.
pub async fn run_summarize(config: &Config, id: i64) -> Result<()> {
    let orchestrator = open_orchestrator(config).await?;
    let result = orchestrator.summarize_regulation(id).await?;
    let r = &result.record;

    println!("Regulation {}: {} {}", r.id, r.chapter, r.part);
    println!();
    println!("Summary ({}):", result.source.as_str());
    println!("{}", result.summary);
    if result.saved {
        println!();
        println!("saved as content summary");
    }
    Ok(())
}

fn print_analysis(analysis: &AnalysisResult) {
    println!("Analysis for: '{}'", analysis.query);
    println!("{}", "=".repeat(60));
    println!("Total results: {}", analysis.results.len());
    println!("Categories:    {}", analysis.categorized_results.len());
    println!("Corpus:        {}", analysis.meta.corpus_source);
    if let Some(reason) = &analysis.meta.degraded_reason {
        println!("Retrieval:     keyword only ({})", reason);
    }
    println!();

    for category in &analysis.categorized_results {
        println!("{}:", category.label());
        for record in category.records.iter().take(3) {
            println!("  - {}: {}", record.part, truncate(&record.description, 100));
        }
        if category.records.len() > 3 {
            println!("  ... and {} more", category.records.len() - 3);
        }
    }
    println!();

    println!("Summary ({}):", analysis.summary_source.as_str());
    println!("{}", analysis.summary);

    if !analysis.recommendations.is_empty() {
        println!();
        println!("Related searches: {}", analysis.recommendations.join(", "));
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}
