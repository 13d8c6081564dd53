//! # CFR Harness
//!
//! Resilient acquisition of eCFR Title 21 regulations with hybrid keyword +
//! semantic retrieval and a small agent workflow on top.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────┐   ┌───────────────┐
//! │ Fetch        │──▶│ Classify +   │──▶│  SQLite  │──▶│ Embedding     │
//! │ Resolver     │   │ Change diff  │   │  store   │   │ index         │
//! └──────────────┘   └──────────────┘   └────┬─────┘   └──────┬────────┘
//!   endpoints ×                              │                │
//!   strategies,                              ▼                ▼
//!   fallback data                      ┌─────────────────────────────┐
//!                                      │ Hybrid retrieval → Agent    │
//!                                      └─────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! cfr init                       # create database
//! cfr refresh                    # fetch Title 21 (falls back to bundled data)
//! cfr health                     # acquisition health, no network
//! cfr search "medical device labeling"
//! cfr analyze "food additives" --context "color additives"
//! cfr changes --days 7
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy |
//! | [`store`] | Record store trait, SQLite and in-memory backends |
//! | [`fetch`] | Endpoint fallback chain, parse strategies, health |
//! | [`classify`] | Status classification |
//! | [`changes`] | Change detection and feed |
//! | [`refresh`] | Fetch → diff → commit pipeline |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Hash-gated embedding index |
//! | [`search`] | Hybrid keyword + semantic retrieval |
//! | [`llm`] | Summary generation |
//! | [`agent`] | Analyze, batch, ask and summarize workflows |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |

pub mod agent;
pub mod changes;
pub mod classify;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod fetch;
pub mod get;
pub mod health;
pub mod index;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod refresh;
pub mod search;
pub mod stats;
pub mod store;
