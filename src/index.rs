//! Embedding index over regulation records.
//!
//! Vectors are persisted through the [`RecordStore`] and served from an
//! in-memory snapshot. A re-index builds a complete new snapshot and then
//! swaps it in, so concurrent searches always see either the old or the new
//! index, never a mix. Re-indexes are serialized with each other.
//!
//! Each vector carries the SHA-256 of the text it was computed from
//! ([`RegulationRecord::searchable_text`]); records whose text hash and model
//! are unchanged are never sent to the provider again.

use anyhow::{bail, Result};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::db;
use crate::embedding::{self, cosine_similarity, EmbeddingProvider};
use crate::error::Error;
use crate::models::{EmbeddingEntry, RegulationRecord};
use crate::store::{RecordStore, SqliteStore};

/// Immutable view of the index at one point in time.
#[derive(Debug, Default)]
pub struct IndexSnapshot {
    pub model: String,
    entries: Vec<(i64, Vec<f32>)>,
}

impl IndexSnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Outcome of one re-index pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReindexReport {
    pub total: usize,
    pub embedded: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct EmbeddingIndex {
    store: Arc<dyn RecordStore>,
    provider: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
    snapshot: RwLock<Arc<IndexSnapshot>>,
    reindex_lock: tokio::sync::Mutex<()>,
}

impl EmbeddingIndex {
    pub fn new(
        store: Arc<dyn RecordStore>,
        provider: Arc<dyn EmbeddingProvider>,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            provider,
            batch_size: batch_size.max(1),
            snapshot: RwLock::new(Arc::new(IndexSnapshot::default())),
            reindex_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn provider(&self) -> &dyn EmbeddingProvider {
        self.provider.as_ref()
    }

    /// Current snapshot. Cheap: clones an `Arc`.
    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        match self.snapshot.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Publish a snapshot built from whatever vectors the store already holds.
    pub async fn load(&self) -> Result<usize> {
        let records = self.store.get_all().await?;
        let snapshot = self.build_snapshot(&records).await?;
        let count = snapshot.len();
        self.publish(snapshot);
        Ok(count)
    }

    /// Embed every record whose text hash or model changed, then publish a
    /// fresh snapshot.
    pub async fn reindex(&self) -> Result<ReindexReport> {
        let _guard = self.reindex_lock.lock().await;

        let records = self.store.get_all().await?;
        let model = self.provider.model_name().to_string();
        let existing: HashMap<i64, EmbeddingEntry> = self
            .store
            .embeddings()
            .await?
            .into_iter()
            .map(|e| (e.record_id, e))
            .collect();

        let mut report = ReindexReport {
            total: records.len(),
            ..ReindexReport::default()
        };

        let mut pending: Vec<(i64, String, String)> = Vec::new();
        for record in &records {
            let text = record.searchable_text();
            let hash = text_hash(&text);
            match existing.get(&record.id) {
                Some(e) if e.source_text_hash == hash && e.model == model => report.skipped += 1,
                _ => pending.push((record.id, text, hash)),
            }
        }

        for batch in pending.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|(_, text, _)| text.clone()).collect();
            match self.provider.embed(&texts).await {
                Ok(vectors) if vectors.len() == batch.len() => {
                    let entries: Vec<EmbeddingEntry> = batch
                        .iter()
                        .zip(vectors)
                        .map(|((id, _, hash), vector)| EmbeddingEntry {
                            record_id: *id,
                            model: model.clone(),
                            vector,
                            source_text_hash: hash.clone(),
                        })
                        .collect();
                    self.store.upsert_embeddings(&entries).await?;
                    report.embedded += entries.len();
                }
                Ok(vectors) => {
                    warn!(
                        expected = batch.len(),
                        got = vectors.len(),
                        "embedding batch returned wrong number of vectors"
                    );
                    report.failed += batch.len();
                }
                Err(e) => {
                    warn!(error = %e, batch = batch.len(), "embedding batch failed");
                    report.failed += batch.len();
                }
            }
        }

        let snapshot = self.build_snapshot(&records).await?;
        self.publish(snapshot);
        Ok(report)
    }

    /// Re-embed the whole corpus regardless of stored hashes.
    ///
    /// The new vectors are staged in memory and written in one replacement,
    /// then published. Searches keep using the previous snapshot until then,
    /// and a failed batch leaves both the stored vectors and the snapshot
    /// untouched.
    pub async fn rebuild(&self) -> Result<ReindexReport> {
        let _guard = self.reindex_lock.lock().await;

        let records = self.store.get_all().await?;
        let model = self.provider.model_name().to_string();

        let mut staged: Vec<EmbeddingEntry> = Vec::with_capacity(records.len());
        for batch in records.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|r| r.searchable_text()).collect();
            let vectors = self.provider.embed(&texts).await?;
            if vectors.len() != batch.len() {
                bail!(
                    "embedding batch returned {} vectors for {} texts",
                    vectors.len(),
                    batch.len()
                );
            }
            staged.extend(batch.iter().zip(&texts).zip(vectors).map(
                |((record, text), vector)| EmbeddingEntry {
                    record_id: record.id,
                    model: model.clone(),
                    vector,
                    source_text_hash: text_hash(text),
                },
            ));
        }

        self.store.replace_embeddings(&staged).await?;
        let snapshot = self.build_snapshot(&records).await?;
        self.publish(snapshot);

        Ok(ReindexReport {
            total: records.len(),
            embedded: staged.len(),
            ..ReindexReport::default()
        })
    }

    /// Run [`reindex`](Self::reindex) on a background task.
    pub fn spawn_reindex(self: &Arc<Self>) -> JoinHandle<()> {
        let index = Arc::clone(self);
        tokio::spawn(async move {
            match index.reindex().await {
                Ok(report) => info!(
                    total = report.total,
                    embedded = report.embedded,
                    skipped = report.skipped,
                    failed = report.failed,
                    "background re-index finished"
                ),
                Err(e) => warn!(error = %e, "background re-index failed"),
            }
        })
    }

    /// Top-`k` records by cosine similarity, keeping only scores strictly
    /// above `min_similarity`. Ties go to the lower id.
    pub fn nearest(
        &self,
        query: &[f32],
        k: usize,
        min_similarity: f32,
    ) -> Result<Vec<(i64, f32)>, Error> {
        let snapshot = self.snapshot();
        if snapshot.is_empty() {
            return Err(Error::IndexUnavailable {
                reason: "no vectors have been indexed".to_string(),
            });
        }
        if let Some((_, first)) = snapshot.entries.first() {
            if first.len() != query.len() {
                return Err(Error::IndexUnavailable {
                    reason: format!(
                        "query has {} dims but index holds {}",
                        query.len(),
                        first.len()
                    ),
                });
            }
        }

        let mut scored: Vec<(i64, f32)> = snapshot
            .entries
            .iter()
            .map(|(id, vector)| (*id, cosine_similarity(query, vector)))
            .filter(|(_, score)| *score > min_similarity)
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);
        Ok(scored)
    }

    async fn build_snapshot(&self, records: &[RegulationRecord]) -> Result<IndexSnapshot> {
        let model = self.provider.model_name().to_string();
        let live: HashSet<i64> = records.iter().map(|r| r.id).collect();
        let mut entries: Vec<(i64, Vec<f32>)> = self
            .store
            .embeddings()
            .await?
            .into_iter()
            .filter(|e| e.model == model && live.contains(&e.record_id) && !e.vector.is_empty())
            .map(|e| (e.record_id, e.vector))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        Ok(IndexSnapshot { model, entries })
    }

    fn publish(&self, snapshot: IndexSnapshot) {
        let snapshot = Arc::new(snapshot);
        match self.snapshot.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }
}

/// SHA-256 hex digest of the text an embedding was computed from.
pub fn text_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Embed records that are missing vectors or have stale hashes.
pub async fn run_embed_pending(config: &Config) -> Result<()> {
    let (index, store) = open_index(config).await?;
    let report = index.reindex().await?;

    println!("embed pending");
    println!("  records: {}", report.total);
    println!("  up to date: {}", report.skipped);
    println!("  embedded: {}", report.embedded);
    println!("  failed: {}", report.failed);

    store.close().await;
    Ok(())
}

/// Regenerate every vector and replace the stored set.
pub async fn run_embed_rebuild(config: &Config) -> Result<()> {
    let (index, store) = open_index(config).await?;
    let report = index.rebuild().await?;

    println!("embed rebuild");
    println!("  records: {}", report.total);
    println!("  embedded: {}", report.embedded);
    println!("  failed: {}", report.failed);

    store.close().await;
    Ok(())
}

async fn open_index(config: &Config) -> Result<(EmbeddingIndex, Arc<SqliteStore>)> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }
    let provider: Arc<dyn EmbeddingProvider> =
        Arc::from(embedding::create_provider(&config.embedding)?);
    let store = Arc::new(SqliteStore::new(db::connect(config).await?));
    let index = EmbeddingIndex::new(store.clone(), provider, config.embedding.batch_size);
    Ok((index, store))
}
