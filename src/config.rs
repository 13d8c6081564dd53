use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::fetch::{CachePolicy, Endpoint, StrategyKind};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub agent: AgentConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetchConfig {
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default = "default_fetch_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_total_budget_secs")]
    pub total_budget_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            max_retries: default_fetch_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            timeout_secs: default_timeout_secs(),
            total_budget_secs: default_total_budget_secs(),
            user_agent: default_user_agent(),
            cache: CacheConfig::default(),
        }
    }
}

impl FetchConfig {
    /// Candidate endpoints in declared priority order.
    pub fn candidate_endpoints(&self) -> Vec<Endpoint> {
        self.endpoints
            .iter()
            .map(|e| Endpoint {
                url: e.url.clone(),
                strategies: e.strategies.clone(),
            })
            .collect()
    }

    pub fn cache_policy(&self) -> CachePolicy {
        CachePolicy {
            max_age: chrono::Duration::days(self.cache.max_age_days),
            revalidate_on_expiry: self.cache.revalidate_on_expiry,
        }
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn total_budget(&self) -> Duration {
        Duration::from_secs(self.total_budget_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EndpointConfig {
    pub url: String,
    #[serde(default = "default_strategies")]
    pub strategies: Vec<StrategyKind>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_max_age_days")]
    pub max_age_days: i64,
    #[serde(default = "default_true")]
    pub revalidate_on_expiry: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_age_days: default_max_age_days(),
            revalidate_on_expiry: true,
        }
    }
}

fn default_endpoints() -> Vec<EndpointConfig> {
    [
        "https://www.ecfr.gov/current/title-21",
        "https://www.ecfr.gov/current/title-21/chapter-I",
        "https://www.ecfr.gov/api/title/21",
        "https://www.ecfr.gov/api/v1/title/21",
    ]
    .iter()
    .map(|url| EndpointConfig {
        url: url.to_string(),
        strategies: default_strategies(),
    })
    .collect()
}

fn default_strategies() -> Vec<StrategyKind> {
    StrategyKind::ALL.to_vec()
}
fn default_fetch_retries() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_total_budget_secs() -> u64 {
    120
}
fn default_user_agent() -> String {
    concat!("cfr-harness/", env!("CARGO_PKG_VERSION")).to_string()
}
fn default_max_age_days() -> i64 {
    7
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_weight")]
    pub keyword_weight: f64,
    #[serde(default = "default_weight")]
    pub semantic_weight: f64,
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
    #[serde(default = "default_final_limit")]
    pub final_limit: usize,
    #[serde(default = "default_max_query_chars")]
    pub max_query_chars: usize,
    #[serde(default)]
    pub min_similarity: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            keyword_weight: default_weight(),
            semantic_weight: default_weight(),
            candidate_multiplier: default_candidate_multiplier(),
            final_limit: default_final_limit(),
            max_query_chars: default_max_query_chars(),
            min_similarity: 0.0,
        }
    }
}

fn default_weight() -> f64 {
    0.5
}
fn default_candidate_multiplier() -> usize {
    3
}
fn default_final_limit() -> usize {
    10
}
fn default_max_query_chars() -> usize {
    512
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
            url: None,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_llm_retries")]
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_llm_model(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_llm_retries(),
        }
    }
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_llm_retries() -> u32 {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    #[serde(default = "default_recommendations")]
    pub recommendations: usize,
    #[serde(default = "default_item_timeout_secs")]
    pub item_timeout_secs: u64,
    #[serde(default = "default_agent_query_chars")]
    pub max_query_chars: usize,
    #[serde(default = "default_history_window")]
    pub history_window: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            recommendations: default_recommendations(),
            item_timeout_secs: default_item_timeout_secs(),
            max_query_chars: default_agent_query_chars(),
            history_window: default_history_window(),
        }
    }
}

fn default_recommendations() -> usize {
    5
}
fn default_item_timeout_secs() -> u64 {
    30
}
fn default_agent_query_chars() -> usize {
    2000
}
fn default_history_window() -> usize {
    500
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Validate fetch
    if config.fetch.endpoints.is_empty() {
        anyhow::bail!("fetch.endpoints must list at least one endpoint");
    }
    for endpoint in &config.fetch.endpoints {
        if endpoint.strategies.is_empty() {
            anyhow::bail!("fetch.endpoints '{}' has no strategies", endpoint.url);
        }
    }
    if config.fetch.timeout_secs == 0 {
        anyhow::bail!("fetch.timeout_secs must be > 0");
    }
    if config.fetch.cache.max_age_days < 0 {
        anyhow::bail!("fetch.cache.max_age_days must be >= 0");
    }

    // Validate retrieval
    let r = &config.retrieval;
    if r.final_limit < 1 {
        anyhow::bail!("retrieval.final_limit must be >= 1");
    }
    if r.candidate_multiplier < 1 {
        anyhow::bail!("retrieval.candidate_multiplier must be >= 1");
    }
    if r.keyword_weight < 0.0 || r.semantic_weight < 0.0 {
        anyhow::bail!("retrieval weights must be >= 0.0");
    }
    if r.keyword_weight + r.semantic_weight <= 0.0 {
        anyhow::bail!("retrieval.keyword_weight and retrieval.semantic_weight cannot both be 0");
    }
    if r.max_query_chars == 0 {
        anyhow::bail!("retrieval.max_query_chars must be > 0");
    }

    // Validate embedding
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }
    if matches!(config.embedding.provider.as_str(), "openai" | "ollama") {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.llm.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown llm provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    if config.agent.max_query_chars == 0 {
        anyhow::bail!("agent.max_query_chars must be > 0");
    }

    Ok(())
}

impl Config {
    /// Configuration with defaults everywhere except the database path.
    pub fn with_db_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig { path: path.into() },
            fetch: FetchConfig::default(),
            retrieval: RetrievalConfig::default(),
            embedding: EmbeddingConfig::default(),
            llm: LlmConfig::default(),
            agent: AgentConfig::default(),
        }
    }
}
