//! In-memory [`RecordStore`] implementation for tests and ephemeral runs.
//!
//! All tables live in one struct behind a single `RwLock`, so every
//! operation is atomic with respect to the others.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::models::{ChangeRecord, EmbeddingEntry, RegulationRecord, SearchHistoryEntry};

use super::RecordStore;

#[derive(Default)]
struct Tables {
    regulations: BTreeMap<i64, RegulationRecord>,
    embeddings: BTreeMap<i64, EmbeddingEntry>,
    fetch_state: Vec<String>,
    searches: Vec<SearchHistoryEntry>,
    changes: Vec<ChangeRecord>,
}

/// In-memory store.
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with `records`.
    pub fn with_records(records: Vec<RegulationRecord>) -> Self {
        let store = Self::new();
        if let Ok(mut t) = store.tables.write() {
            t.regulations = records.into_iter().map(|r| (r.id, r)).collect();
        }
        store
    }

    /// Number of fetch-state revisions written so far.
    pub fn fetch_state_revisions(&self) -> usize {
        self.tables.read().map(|t| t.fetch_state.len()).unwrap_or(0)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn get_all(&self) -> Result<Vec<RegulationRecord>> {
        Ok(self.read()?.regulations.values().cloned().collect())
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<RegulationRecord>> {
        Ok(self.read()?.regulations.get(&id).cloned())
    }

    async fn upsert(&self, records: &[RegulationRecord]) -> Result<()> {
        let mut t = self.write()?;
        for r in records {
            t.regulations.insert(r.id, r.clone());
        }
        Ok(())
    }

    async fn commit_refresh(
        &self,
        records: &[RegulationRecord],
        removed_ids: &[i64],
        changes: &[ChangeRecord],
    ) -> Result<()> {
        let mut t = self.write()?;
        for r in records {
            t.regulations.insert(r.id, r.clone());
        }
        for id in removed_ids {
            t.regulations.remove(id);
            t.embeddings.remove(id);
        }
        t.changes.extend(changes.iter().cloned());
        Ok(())
    }

    async fn embeddings(&self) -> Result<Vec<EmbeddingEntry>> {
        Ok(self.read()?.embeddings.values().cloned().collect())
    }

    async fn upsert_embeddings(&self, entries: &[EmbeddingEntry]) -> Result<()> {
        let mut t = self.write()?;
        for e in entries {
            t.embeddings.insert(e.record_id, e.clone());
        }
        Ok(())
    }

    async fn replace_embeddings(&self, entries: &[EmbeddingEntry]) -> Result<()> {
        self.write()?.embeddings = entries.iter().map(|e| (e.record_id, e.clone())).collect();
        Ok(())
    }

    async fn load_fetch_state(&self) -> Result<Option<String>> {
        Ok(self.read()?.fetch_state.last().cloned())
    }

    async fn save_fetch_state(&self, state_json: &str) -> Result<()> {
        self.write()?.fetch_state.push(state_json.to_string());
        Ok(())
    }

    async fn append_search(&self, entry: &SearchHistoryEntry) -> Result<()> {
        self.write()?.searches.push(entry.clone());
        Ok(())
    }

    async fn recent_searches(&self, limit: usize) -> Result<Vec<SearchHistoryEntry>> {
        Ok(self
            .read()?
            .searches
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn recent_changes(&self, since: i64, limit: usize) -> Result<Vec<ChangeRecord>> {
        Ok(self
            .read()?
            .changes
            .iter()
            .rev()
            .filter(|c| c.detected_at >= since)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn changes_for(&self, record_id: i64) -> Result<Vec<ChangeRecord>> {
        Ok(self
            .read()?
            .changes
            .iter()
            .rev()
            .filter(|c| c.record_id == record_id)
            .cloned()
            .collect())
    }
}
