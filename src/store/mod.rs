//! Storage abstraction for the harness.
//!
//! The [`RecordStore`] trait defines every durable operation the core
//! needs: regulation records, embedding entries, fetch-state revisions, the
//! search history and the change feed. Two backends implement it:
//!
//! - [`SqliteStore`](sqlite::SqliteStore): the production store.
//! - [`InMemoryStore`](memory::InMemoryStore): for tests and ephemeral runs.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{ChangeRecord, EmbeddingEntry, RegulationRecord, SearchHistoryEntry};

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

/// Abstract storage backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`get_all`](RecordStore::get_all) | Every regulation, ordered by id |
/// | [`get_by_id`](RecordStore::get_by_id) | One regulation |
/// | [`upsert`](RecordStore::upsert) | Full-record replacement of a batch, all-or-nothing |
/// | [`commit_refresh`](RecordStore::commit_refresh) | Upserts, removals and change records in one transaction |
/// | [`embeddings`](RecordStore::embeddings) | Stored embedding entries |
/// | [`upsert_embeddings`](RecordStore::upsert_embeddings) | Persist re-embedded entries |
/// | [`replace_embeddings`](RecordStore::replace_embeddings) | Swap the whole embedding table in one write |
/// | [`load_fetch_state`](RecordStore::load_fetch_state) | Latest fetch-state revision (raw JSON) |
/// | [`save_fetch_state`](RecordStore::save_fetch_state) | Append a fetch-state revision |
/// | [`append_search`](RecordStore::append_search) | Log a search |
/// | [`recent_searches`](RecordStore::recent_searches) | Newest-first search history |
/// | [`recent_changes`](RecordStore::recent_changes) | Newest-first change feed |
/// | [`changes_for`](RecordStore::changes_for) | Change history of one regulation |
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_all(&self) -> Result<Vec<RegulationRecord>>;

    async fn get_by_id(&self, id: i64) -> Result<Option<RegulationRecord>>;

    /// Replace the given records. Either all rows are written or none.
    async fn upsert(&self, records: &[RegulationRecord]) -> Result<()>;

    /// Apply one refresh batch atomically: upsert `records`, delete
    /// `removed_ids` (and their embeddings) and append `changes`.
    async fn commit_refresh(
        &self,
        records: &[RegulationRecord],
        removed_ids: &[i64],
        changes: &[ChangeRecord],
    ) -> Result<()>;

    async fn embeddings(&self) -> Result<Vec<EmbeddingEntry>>;

    async fn upsert_embeddings(&self, entries: &[EmbeddingEntry]) -> Result<()>;

    /// Replace every stored embedding with `entries`. Either the old set or
    /// the new set is visible, never an empty table in between.
    async fn replace_embeddings(&self, entries: &[EmbeddingEntry]) -> Result<()>;

    /// Latest persisted fetch state, as written by [`save_fetch_state`](RecordStore::save_fetch_state).
    async fn load_fetch_state(&self) -> Result<Option<String>>;

    async fn save_fetch_state(&self, state_json: &str) -> Result<()>;

    async fn append_search(&self, entry: &SearchHistoryEntry) -> Result<()>;

    async fn recent_searches(&self, limit: usize) -> Result<Vec<SearchHistoryEntry>>;

    /// Changes detected at or after `since`, newest first.
    async fn recent_changes(&self, since: i64, limit: usize) -> Result<Vec<ChangeRecord>>;

    /// Every change recorded for `record_id`, newest first.
    async fn changes_for(&self, record_id: i64) -> Result<Vec<ChangeRecord>>;
}
