//! SQLite-backed [`RecordStore`] implementation.
//!
//! Maps each store operation onto the schema created by
//! [`migrate::apply_schema`](crate::migrate::apply_schema). Batch writes run
//! inside a transaction so a crash never leaves a half-applied refresh.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::models::{ChangeRecord, EmbeddingEntry, RegulationRecord, SearchHistoryEntry};

use super::RecordStore;

/// SQLite implementation of the [`RecordStore`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

const REGULATION_COLUMNS: &str = "id, title, chapter, subchapter, part, section_range, description, \
     source_url, status, content_summary, last_updated, created_at";

fn row_to_record(row: &SqliteRow) -> Result<RegulationRecord> {
    let status: String = row.get("status");
    Ok(RegulationRecord {
        id: row.get("id"),
        title: row.get("title"),
        chapter: row.get("chapter"),
        subchapter: row.get("subchapter"),
        part: row.get("part"),
        section_range: row.get("section_range"),
        description: row.get("description"),
        source_url: row.get("source_url"),
        status: status.parse()?,
        content_summary: row.get("content_summary"),
        last_updated: row.get("last_updated"),
        created_at: row.get("created_at"),
    })
}

const CHANGE_COLUMNS: &str =
    "record_id, change_kind, changed_fields, previous_snapshot, new_snapshot, detected_at";

fn row_to_change(row: &SqliteRow) -> Result<ChangeRecord> {
    let kind: String = row.get("change_kind");
    let fields: String = row.get("changed_fields");
    let previous: Option<String> = row.get("previous_snapshot");
    let new: Option<String> = row.get("new_snapshot");
    Ok(ChangeRecord {
        record_id: row.get("record_id"),
        kind: kind.parse()?,
        changed_fields: serde_json::from_str(&fields)?,
        previous_snapshot: previous.as_deref().map(serde_json::from_str).transpose()?,
        new_snapshot: new.as_deref().map(serde_json::from_str).transpose()?,
        detected_at: row.get("detected_at"),
    })
}

async fn insert_embedding_in_tx(
    tx: &mut Transaction<'_, Sqlite>,
    e: &EmbeddingEntry,
    now: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO embeddings (record_id, model, dims, source_text_hash, vector, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(record_id) DO UPDATE SET
            model = excluded.model,
            dims = excluded.dims,
            source_text_hash = excluded.source_text_hash,
            vector = excluded.vector,
            created_at = excluded.created_at
        "#,
    )
    .bind(e.record_id)
    .bind(&e.model)
    .bind(e.vector.len() as i64)
    .bind(&e.source_text_hash)
    .bind(vec_to_blob(&e.vector))
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn upsert_in_tx(tx: &mut Transaction<'_, Sqlite>, r: &RegulationRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO regulations (id, title, chapter, subchapter, part, section_range,
                                 description, source_url, status, content_summary,
                                 last_updated, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            title = excluded.title,
            chapter = excluded.chapter,
            subchapter = excluded.subchapter,
            part = excluded.part,
            section_range = excluded.section_range,
            description = excluded.description,
            source_url = excluded.source_url,
            status = excluded.status,
            content_summary = excluded.content_summary,
            last_updated = excluded.last_updated,
            created_at = excluded.created_at
        "#,
    )
    .bind(r.id)
    .bind(&r.title)
    .bind(&r.chapter)
    .bind(&r.subchapter)
    .bind(&r.part)
    .bind(&r.section_range)
    .bind(&r.description)
    .bind(&r.source_url)
    .bind(r.status.as_str())
    .bind(&r.content_summary)
    .bind(r.last_updated)
    .bind(r.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn get_all(&self) -> Result<Vec<RegulationRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM regulations ORDER BY id",
            REGULATION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_record).collect()
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<RegulationRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM regulations WHERE id = ?",
            REGULATION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn upsert(&self, records: &[RegulationRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for r in records {
            upsert_in_tx(&mut tx, r).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn commit_refresh(
        &self,
        records: &[RegulationRecord],
        removed_ids: &[i64],
        changes: &[ChangeRecord],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for r in records {
            upsert_in_tx(&mut tx, r).await?;
        }

        for id in removed_ids {
            sqlx::query("DELETE FROM embeddings WHERE record_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM regulations WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        for c in changes {
            let previous = c
                .previous_snapshot
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            let new = c
                .new_snapshot
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            sqlx::query(
                r#"
                INSERT INTO regulation_changes
                    (record_id, change_kind, changed_fields, previous_snapshot, new_snapshot, detected_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(c.record_id)
            .bind(c.kind.as_str())
            .bind(serde_json::to_string(&c.changed_fields)?)
            .bind(previous)
            .bind(new)
            .bind(c.detected_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn embeddings(&self) -> Result<Vec<EmbeddingEntry>> {
        let rows =
            sqlx::query("SELECT record_id, model, source_text_hash, vector FROM embeddings")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("vector");
                EmbeddingEntry {
                    record_id: row.get("record_id"),
                    model: row.get("model"),
                    vector: blob_to_vec(&blob),
                    source_text_hash: row.get("source_text_hash"),
                }
            })
            .collect())
    }

    async fn upsert_embeddings(&self, entries: &[EmbeddingEntry]) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        for e in entries {
            insert_embedding_in_tx(&mut tx, e, now).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn replace_embeddings(&self, entries: &[EmbeddingEntry]) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM embeddings")
            .execute(&mut *tx)
            .await?;
        for e in entries {
            insert_embedding_in_tx(&mut tx, e, now).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn load_fetch_state(&self) -> Result<Option<String>> {
        let json: Option<String> = sqlx::query_scalar(
            "SELECT state_json FROM fetch_state ORDER BY revision DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(json)
    }

    async fn save_fetch_state(&self, state_json: &str) -> Result<()> {
        sqlx::query("INSERT INTO fetch_state (state_json, saved_at) VALUES (?, ?)")
            .bind(state_json)
            .bind(chrono::Utc::now().timestamp())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn append_search(&self, entry: &SearchHistoryEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO search_history (query, result_count, result_ids, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&entry.query)
        .bind(entry.result_count as i64)
        .bind(serde_json::to_string(&entry.result_ids)?)
        .bind(entry.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_searches(&self, limit: usize) -> Result<Vec<SearchHistoryEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT query, result_count, result_ids, created_at
            FROM search_history
            ORDER BY created_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let ids_json: String = row.get("result_ids");
                let count: i64 = row.get("result_count");
                Ok(SearchHistoryEntry {
                    query: row.get("query"),
                    result_count: count.max(0) as usize,
                    result_ids: serde_json::from_str(&ids_json)
                        .with_context(|| "malformed search_history.result_ids")?,
                    timestamp: row.get("created_at"),
                })
            })
            .collect()
    }

    async fn recent_changes(&self, since: i64, limit: usize) -> Result<Vec<ChangeRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM regulation_changes WHERE detected_at >= ? \
             ORDER BY detected_at DESC, id DESC LIMIT ?",
            CHANGE_COLUMNS
        ))
        .bind(since)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_change).collect()
    }

    async fn changes_for(&self, record_id: i64) -> Result<Vec<ChangeRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM regulation_changes WHERE record_id = ? \
             ORDER BY detected_at DESC, id DESC",
            CHANGE_COLUMNS
        ))
        .bind(record_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_change).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::apply_schema;
    use crate::models::{ChangeKind, RegulationStatus};

    async fn open() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::connect_path(&dir.path().join("t.sqlite"))
            .await
            .unwrap();
        apply_schema(&pool).await.unwrap();
        (dir, SqliteStore::new(pool))
    }

    fn record(part: &str, desc: &str) -> RegulationRecord {
        RegulationRecord::new("Title 21", "Chapter I", "Subchapter H", part, "", desc, "", 100)
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let (_dir, store) = open().await;
        let mut r = record("Part 801", "Labeling");
        r.status = RegulationStatus::Allowed;
        store.upsert(&[r.clone()]).await.unwrap();

        let loaded = store.get_by_id(r.id).await.unwrap().unwrap();
        assert_eq!(loaded, r);

        r.description = "Labeling requirements".into();
        store.upsert(&[r.clone()]).await.unwrap();
        let all = store.get_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].description, "Labeling requirements");
    }

    #[tokio::test]
    async fn test_commit_refresh_removes_and_logs() {
        let (_dir, store) = open().await;
        let keep = record("Part 801", "Labeling");
        let gone = record("Part 802", "Gone");
        store.upsert(&[keep.clone(), gone.clone()]).await.unwrap();
        store
            .upsert_embeddings(&[EmbeddingEntry {
                record_id: gone.id,
                model: "m".into(),
                vector: vec![1.0, 0.0],
                source_text_hash: "h".into(),
            }])
            .await
            .unwrap();

        let change = ChangeRecord {
            record_id: gone.id,
            kind: ChangeKind::Removed,
            changed_fields: vec![],
            previous_snapshot: Some(gone.clone()),
            new_snapshot: None,
            detected_at: 200,
        };
        store
            .commit_refresh(&[keep.clone()], &[gone.id], &[change.clone()])
            .await
            .unwrap();

        assert!(store.get_by_id(gone.id).await.unwrap().is_none());
        assert!(store.embeddings().await.unwrap().is_empty());
        let changes = store.recent_changes(0, 10).await.unwrap();
        assert_eq!(changes, vec![change]);
    }

    #[tokio::test]
    async fn test_changes_for_one_record() {
        let (_dir, store) = open().await;
        let a = record("Part 801", "Labeling");
        let b = record("Part 803", "Reporting");
        let change = |r: &RegulationRecord, kind, at| ChangeRecord {
            record_id: r.id,
            kind,
            changed_fields: vec![],
            previous_snapshot: None,
            new_snapshot: Some(r.clone()),
            detected_at: at,
        };
        store
            .commit_refresh(
                &[a.clone(), b.clone()],
                &[],
                &[
                    change(&a, ChangeKind::Added, 100),
                    change(&b, ChangeKind::Added, 100),
                    change(&a, ChangeKind::Updated, 200),
                ],
            )
            .await
            .unwrap();

        let history = store.changes_for(a.id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].kind, ChangeKind::Updated);
        assert!(history.iter().all(|c| c.record_id == a.id));
        assert!(store.changes_for(42).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replace_embeddings_swaps_whole_table() {
        let (_dir, store) = open().await;
        let a = record("Part 801", "Labeling");
        let b = record("Part 803", "Reporting");
        store.upsert(&[a.clone(), b.clone()]).await.unwrap();
        let entry = |id, model: &str| EmbeddingEntry {
            record_id: id,
            model: model.into(),
            vector: vec![1.0, 0.0],
            source_text_hash: "h".into(),
        };
        store
            .upsert_embeddings(&[entry(a.id, "old"), entry(b.id, "old")])
            .await
            .unwrap();
        store.replace_embeddings(&[entry(b.id, "new")]).await.unwrap();

        let stored = store.embeddings().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].record_id, b.id);
        assert_eq!(stored[0].model, "new");
    }

    #[tokio::test]
    async fn test_fetch_state_latest_revision_wins() {
        let (_dir, store) = open().await;
        assert!(store.load_fetch_state().await.unwrap().is_none());
        store.save_fetch_state("{\"v\":1}").await.unwrap();
        store.save_fetch_state("{\"v\":2}").await.unwrap();
        assert_eq!(
            store.load_fetch_state().await.unwrap().as_deref(),
            Some("{\"v\":2}")
        );
    }

    #[tokio::test]
    async fn test_search_history_roundtrip() {
        let (_dir, store) = open().await;
        for (i, q) in ["medical devices", "food labeling"].iter().enumerate() {
            store
                .append_search(&SearchHistoryEntry {
                    query: q.to_string(),
                    result_count: 2,
                    result_ids: vec![1, 2],
                    timestamp: 10 + i as i64,
                })
                .await
                .unwrap();
        }
        let recent = store.recent_searches(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].query, "food labeling");
        assert_eq!(recent[1].result_ids, vec![1, 2]);
    }
}
