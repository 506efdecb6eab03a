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
    // Append-only stage transitions
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            content_id TEXT NOT NULL,
            stage INTEGER NOT NULL,
            previous_stage INTEGER,
            action TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            duration_ms INTEGER,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            success INTEGER NOT NULL DEFAULT 1,
            project_id TEXT NOT NULL DEFAULT 'default',
            batch_id TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One row per cleaned original
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cleaning_records (
            content_id TEXT PRIMARY KEY,
            original_path TEXT NOT NULL UNIQUE,
            clean_path TEXT NOT NULL,
            original_hash TEXT NOT NULL,
            clean_hash TEXT NOT NULL,
            content_type TEXT NOT NULL,
            ads_removed INTEGER NOT NULL DEFAULT 0,
            chars_removed INTEGER NOT NULL DEFAULT 0,
            percent_removed REAL NOT NULL DEFAULT 0,
            quality_score REAL NOT NULL DEFAULT 0,
            cleaned_at INTEGER NOT NULL,
            cleaner_version TEXT NOT NULL,
            removals_json TEXT NOT NULL DEFAULT '[]',
            needs_reclean INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS review_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            content_id TEXT NOT NULL,
            removal_index INTEGER NOT NULL,
            pattern TEXT NOT NULL,
            confidence REAL NOT NULL,
            text_preview TEXT NOT NULL,
            text_hash TEXT NOT NULL DEFAULT '',
            detected_at INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            reviewed_at INTEGER,
            notes TEXT,
            UNIQUE(content_id, removal_index)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Databases created before review rows carried the removed text's hash
    let text_hash_cols: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM pragma_table_info('review_queue') WHERE name = 'text_hash'",
    )
    .fetch_one(pool)
    .await?;
    if text_hash_cols == 0 {
        sqlx::query("ALTER TABLE review_queue ADD COLUMN text_hash TEXT NOT NULL DEFAULT ''")
            .execute(pool)
            .await?;
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS false_positives (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            content_id TEXT NOT NULL,
            removal_index INTEGER NOT NULL,
            pattern TEXT NOT NULL,
            full_text TEXT NOT NULL,
            reason TEXT NOT NULL,
            marked_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_transactions_content ON transactions(content_id, timestamp DESC, id DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_transactions_timestamp ON transactions(timestamp DESC)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_review_queue_status ON review_queue(status)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_cleaning_records_type ON cleaning_records(content_type)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
