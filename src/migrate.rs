use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Idempotent.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    // Regulation records, one row per id (full-record replacement on refresh)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS regulations (
            id INTEGER PRIMARY KEY,
            title TEXT NOT NULL DEFAULT '',
            chapter TEXT NOT NULL DEFAULT '',
            subchapter TEXT NOT NULL DEFAULT '',
            part TEXT NOT NULL DEFAULT '',
            section_range TEXT NOT NULL DEFAULT '',
            description TEXT NOT NULL DEFAULT '',
            source_url TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'UNKNOWN',
            content_summary TEXT,
            last_updated INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One embedding per regulation, gated by the hash of its source text
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embeddings (
            record_id INTEGER PRIMARY KEY,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            source_text_hash TEXT NOT NULL,
            vector BLOB NOT NULL,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (record_id) REFERENCES regulations(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Fetch state revisions; the newest row is the live state
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS fetch_state (
            revision INTEGER PRIMARY KEY AUTOINCREMENT,
            state_json TEXT NOT NULL,
            saved_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS search_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            query TEXT NOT NULL,
            result_count INTEGER NOT NULL,
            result_ids TEXT NOT NULL DEFAULT '[]',
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS regulation_changes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            record_id INTEGER NOT NULL,
            change_kind TEXT NOT NULL,
            changed_fields TEXT NOT NULL DEFAULT '[]',
            previous_snapshot TEXT,
            new_snapshot TEXT,
            detected_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_regulations_chapter ON regulations(chapter, subchapter)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_changes_detected ON regulation_changes(detected_at DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_changes_record ON regulation_changes(record_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_search_history_created ON search_history(created_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
