//! Corpus statistics.
//!
//! A quick summary of what is stored: regulation counts by chapter and
//! status, embedding coverage, search and change volume, and when the corpus
//! was last refreshed. Used by `cfr stats`.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::db;

/// Per-chapter breakdown.
struct ChapterStats {
    chapter: String,
    regulations: i64,
    embedded: i64,
    last_updated: Option<i64>,
}

pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM regulations")
        .fetch_one(&pool)
        .await?;
    let chapters: i64 = sqlx::query_scalar(
        "SELECT COUNT(DISTINCT chapter) FROM regulations WHERE chapter != ''",
    )
    .fetch_one(&pool)
    .await?;
    let embedded: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM embeddings e JOIN regulations r ON r.id = e.record_id",
    )
    .fetch_one(&pool)
    .await?;
    let searches: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM search_history")
        .fetch_one(&pool)
        .await?;
    let changes: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM regulation_changes")
        .fetch_one(&pool)
        .await?;
    let last_change: Option<i64> =
        sqlx::query_scalar("SELECT MAX(detected_at) FROM regulation_changes")
            .fetch_one(&pool)
            .await?;

    let status_rows = sqlx::query(
        "SELECT status, COUNT(*) AS n FROM regulations GROUP BY status ORDER BY status",
    )
    .fetch_all(&pool)
    .await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("CFR Harness: Corpus Stats");
    println!("==========================");
    println!();
    println!("  Database:     {}", config.db.path.display());
    println!("  Size:         {}", format_bytes(db_size));
    println!();
    println!("  Regulations:  {}", total);
    println!("  Chapters:     {}", chapters);
    println!(
        "  Embedded:     {} / {} ({}%)",
        embedded,
        total,
        if total > 0 { (embedded * 100) / total } else { 0 }
    );
    println!("  Searches:     {}", searches);
    println!(
        "  Changes:      {}{}",
        changes,
        match last_change {
            Some(ts) => format!(" (last {})", format_ts_relative(ts)),
            None => String::new(),
        }
    );

    if !status_rows.is_empty() {
        println!();
        println!("  By status:");
        for row in &status_rows {
            let status: String = row.get("status");
            let n: i64 = row.get("n");
            println!("    {:<12} {:>6}", status, n);
        }
    }

    let chapter_rows = sqlx::query(
        r#"
        SELECT
            r.chapter,
            COUNT(r.id) AS regulations,
            COUNT(e.record_id) AS embedded,
            MAX(r.last_updated) AS last_updated
        FROM regulations r
        LEFT JOIN embeddings e ON e.record_id = r.id
        GROUP BY r.chapter
        ORDER BY regulations DESC, r.chapter ASC
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let chapter_stats: Vec<ChapterStats> = chapter_rows
        .iter()
        .map(|row| ChapterStats {
            chapter: row.get("chapter"),
            regulations: row.get("regulations"),
            embedded: row.get("embedded"),
            last_updated: row.get("last_updated"),
        })
        .collect();

    if !chapter_stats.is_empty() {
        println!();
        println!("  By chapter:");
        println!(
            "  {:<24} {:>6} {:>10}   {}",
            "CHAPTER", "REGS", "EMBEDDED", "LAST UPDATED"
        );
        println!("  {}", "-".repeat(64));
        for s in &chapter_stats {
            let label = if s.chapter.is_empty() {
                "(none)"
            } else {
                s.chapter.as_str()
            };
            let updated = match s.last_updated {
                Some(ts) => format_ts_relative(ts),
                None => "never".to_string(),
            };
            println!(
                "  {:<24} {:>6} {:>10}   {}",
                label, s.regulations, s.embedded, updated
            );
        }
    }

    println!();
    pool.close().await;
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Relative time ("3 hours ago"), falling back to a date past 30 days.
pub(crate) fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }
    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_format_ts_relative() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 7200), "2 hours ago");
        assert_eq!(format_ts_relative(now - 86400), "1 day ago");
    }
}
