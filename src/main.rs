//! # CFR Harness CLI (`cfr`)
//!
//! ## Usage
//!
//! ```bash
//! cfr --config ./config/cfr.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cfr init` | Create the SQLite database and schema |
//! | `cfr refresh` | Fetch Title 21, record changes, re-index |
//! | `cfr health` | Acquisition health from persisted state |
//! | `cfr search "<query>"` | Hybrid search |
//! | `cfr analyze "<query>"` | Search, categorize, recommend and summarize |
//! | `cfr batch <q>...` | Analyze several queries independently |
//! | `cfr ask "<question>"` | Answer a question from retrieved regulations |
//! | `cfr summarize <id>` | Summarize one regulation and save the summary |
//! | `cfr changes` | Recent change feed |
//! | `cfr get <id>` | One regulation and its history |
//! | `cfr embed pending` | Embed new or changed regulations |
//! | `cfr embed rebuild` | Drop and regenerate all embeddings |
//! | `cfr stats` | Corpus statistics |

use cfr_harness::{agent, changes, config, get, health, index, migrate, refresh, search, stats};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// CFR Harness: resilient eCFR Title 21 acquisition and hybrid retrieval.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/cfr.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "cfr",
    about = "CFR Harness: eCFR Title 21 acquisition, change tracking and hybrid search",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/cfr.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Fetch regulations through the endpoint fallback chain.
    ///
    /// Classifies records, diffs them against the stored corpus, commits
    /// the result and the change feed in one transaction, then re-indexes
    /// embeddings when a provider is configured.
    Refresh {
        /// Fetch and diff without writing anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Show acquisition health. Performs no network I/O.
    Health,

    /// Search regulations.
    Search {
        /// The search query string.
        query: String,

        /// Maximum number of results to return.
        #[arg(long)]
        limit: Option<usize>,

        /// Skip semantic retrieval even when an index exists.
        #[arg(long)]
        keyword_only: bool,

        /// Print per-path scores for each result.
        #[arg(long)]
        explain: bool,
    },

    /// Multi-step analysis: retrieve, categorize, recommend, summarize.
    Analyze {
        query: String,

        /// Extra search terms appended to the query.
        #[arg(long)]
        context: Option<String>,
    },

    /// Analyze several queries; one failure does not stop the others.
    Batch {
        #[arg(required = true)]
        queries: Vec<String>,
    },

    /// Answer a question, citing the regulations it came from.
    Ask { question: String },

    /// Summarize one regulation and store it as its content summary.
    Summarize { id: i64 },

    /// Show the change feed.
    Changes {
        /// Look-back window in days.
        #[arg(long, default_value_t = 7)]
        days: i64,

        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Show one regulation by id.
    Get { id: i64 },

    /// Manage embedding vectors.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Corpus statistics.
    Stats,
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Embed regulations that are new or whose text changed.
    Pending,
    /// Delete and regenerate all embeddings.
    Rebuild,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Refresh { dry_run } => {
            refresh::run_refresh(&cfg, dry_run).await?;
        }
        Commands::Health => {
            health::run_health(&cfg).await?;
        }
        Commands::Search {
            query,
            limit,
            keyword_only,
            explain,
        } => {
            search::run_search(&cfg, &query, limit, keyword_only, explain).await?;
        }
        Commands::Analyze { query, context } => {
            agent::run_analyze(&cfg, &query, context.as_deref()).await?;
        }
        Commands::Batch { queries } => {
            agent::run_batch(&cfg, &queries).await?;
        }
        Commands::Ask { question } => {
            agent::run_ask(&cfg, &question).await?;
        }
        Commands::Summarize { id } => {
            agent::run_summarize(&cfg, id).await?;
        }
        Commands::Changes { days, limit } => {
            changes::run_changes(&cfg, days, limit).await?;
        }
        Commands::Get { id } => {
            get::run_get(&cfg, id).await?;
        }
        Commands::Embed { action } => match action {
            EmbedAction::Pending => index::run_embed_pending(&cfg).await?,
            EmbedAction::Rebuild => index::run_embed_rebuild(&cfg).await?,
        },
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
