//! Archive statistics.
//!
//! A quick summary of what has been cleaned, what is waiting for review, and
//! where items sit in the pipeline. Used by `atlas stats`.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::ledger::Ledger;
use crate::review::ReviewQueue;

#[derive(Debug, Serialize)]
pub struct TypeStats {
    pub content_type: String,
    pub files: i64,
    pub ads_removed: i64,
    pub chars_removed: i64,
    pub avg_quality: f64,
    pub last_cleaned: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct Stats {
    pub db_path: String,
    pub db_bytes: u64,
    pub files_cleaned: i64,
    pub ads_removed: i64,
    pub chars_removed: i64,
    pub needs_reclean: i64,
    pub by_type: Vec<TypeStats>,
    pub review: BTreeMap<String, i64>,
    pub false_positives: i64,
    pub transitions: i64,
    /// Stage label to number of items currently there.
    pub stages: BTreeMap<String, i64>,
}

pub async fn collect(pool: &SqlitePool, config: &Config) -> Result<Stats> {
    let totals = sqlx::query(
        r#"
        SELECT COUNT(*) AS files,
               COALESCE(SUM(ads_removed), 0) AS ads,
               COALESCE(SUM(chars_removed), 0) AS chars,
               COALESCE(SUM(needs_reclean), 0) AS stale
        FROM cleaning_records
        "#,
    )
    .fetch_one(pool)
    .await?;

    let type_rows = sqlx::query(
        r#"
        SELECT content_type,
               COUNT(*) AS files,
               COALESCE(SUM(ads_removed), 0) AS ads,
               COALESCE(SUM(chars_removed), 0) AS chars,
               COALESCE(AVG(quality_score), 0) AS quality,
               MAX(cleaned_at) AS last_cleaned
        FROM cleaning_records
        GROUP BY content_type
        ORDER BY files DESC
        "#,
    )
    .fetch_all(pool)
    .await?;

    let by_type = type_rows
        .iter()
        .map(|row| TypeStats {
            content_type: row.get("content_type"),
            files: row.get("files"),
            ads_removed: row.get("ads"),
            chars_removed: row.get("chars"),
            avg_quality: row.get("quality"),
            last_cleaned: row.get("last_cleaned"),
        })
        .collect();

    let review = ReviewQueue::new(pool.clone(), config.storage.changes_dir.clone())
        .counts_by_status()
        .await?;

    let false_positives: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM false_positives")
        .fetch_one(pool)
        .await?;
    let transitions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM transactions")
        .fetch_one(pool)
        .await?;

    let ledger = Ledger::new(pool.clone(), &config.ledger);
    let stages = ledger
        .stage_distribution(None)
        .await?
        .into_iter()
        .map(|(stage, n)| (stage.to_string(), n))
        .collect();

    Ok(Stats {
        db_path: config.db.path.display().to_string(),
        db_bytes: std::fs::metadata(&config.db.path)
            .map(|m| m.len())
            .unwrap_or(0),
        files_cleaned: totals.get("files"),
        ads_removed: totals.get("ads"),
        chars_removed: totals.get("chars"),
        needs_reclean: totals.get("stale"),
        by_type,
        review,
        false_positives,
        transitions,
        stages,
    })
}

/// Print stats as a table, or as JSON with `json`.
pub fn print_stats(stats: &Stats, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(stats)?);
        return Ok(());
    }

    println!("Atlas - Archive Stats");
    println!("=====================");
    println!();
    println!("  Database:      {}", stats.db_path);
    println!("  Size:          {}", format_bytes(stats.db_bytes));
    println!();
    println!("  Files cleaned: {}", stats.files_cleaned);
    println!("  Ads removed:   {}", stats.ads_removed);
    println!("  Chars removed: {}", stats.chars_removed);
    println!("  Need reclean:  {}", stats.needs_reclean);

    if !stats.by_type.is_empty() {
        println!();
        println!("  By type:");
        println!(
            "  {:<12} {:>6} {:>6} {:>10} {:>8}   {}",
            "TYPE", "FILES", "ADS", "CHARS", "QUALITY", "LAST CLEAN"
        );
        println!("  {}", "-".repeat(64));
        for t in &stats.by_type {
            let last = match t.last_cleaned {
                Some(ts) => format_ts_relative(ts),
                None => "never".to_string(),
            };
            println!(
                "  {:<12} {:>6} {:>6} {:>10} {:>8.2}   {}",
                t.content_type, t.files, t.ads_removed, t.chars_removed, t.avg_quality, last
            );
        }
    }

    println!();
    println!("  Review queue:");
    for status in ["pending", "confirmed", "false_positive"] {
        println!(
            "    {:<16} {}",
            status,
            stats.review.get(status).copied().unwrap_or(0)
        );
    }
    println!("  False positives: {}", stats.false_positives);

    println!();
    println!("  Ledger transitions: {}", stats.transitions);
    if !stats.stages.is_empty() {
        println!("  Items by current stage:");
        for (stage, n) in &stats.stages {
            println!("    {:<28} {}", stage, n);
        }
    }
    println!();
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

/// Relative time for recent timestamps ("3 hours ago"), ISO otherwise.
pub fn format_ts_relative(ts: i64) -> String {
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

pub fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
