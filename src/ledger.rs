//! Append-only transaction ledger.
//!
//! Every stage transition of every content item is one immutable row in the
//! `transactions` table. Nothing else stores "current state": the current
//! stage, metrics and distributions are all derived by querying the log.
//!
//! The ledger does not validate transitions (the coordinator owns that) and
//! does not retry. Storage errors propagate to the caller because losing the
//! audit trail silently is worse than failing loudly.
//!
//! Rows are never updated. [`Ledger::purge_older_than`] is the only
//! deletion path.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::config::LedgerConfig;
use crate::stage::Stage;

/// A transition about to be appended. Built with chained setters:
///
/// ```rust
/// use atlas::ledger::NewTransition;
/// use atlas::stage::Stage;
///
/// let t = NewTransition::new("ep-42", Stage::CONTENT_QUEUED, "queued for fetch")
///     .previous(Stage::CONTENT_RECEIVED)
///     .duration_ms(12);
/// assert!(t.success);
/// ```
#[derive(Debug, Clone)]
pub struct NewTransition {
    pub content_id: String,
    pub stage: Stage,
    pub action: String,
    pub previous_stage: Option<Stage>,
    pub duration_ms: Option<i64>,
    pub metadata: Value,
    pub success: bool,
    pub project_id: Option<String>,
    pub batch_id: Option<String>,
}

impl NewTransition {
    pub fn new(content_id: impl Into<String>, stage: Stage, action: impl Into<String>) -> Self {
        Self {
            content_id: content_id.into(),
            stage,
            action: action.into(),
            previous_stage: None,
            duration_ms: None,
            metadata: json!({}),
            success: true,
            project_id: None,
            batch_id: None,
        }
    }

    pub fn previous(mut self, stage: Stage) -> Self {
        self.previous_stage = Some(stage);
        self
    }

    pub fn duration_ms(mut self, ms: i64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn failed(mut self) -> Self {
        self.success = false;
        self
    }

    pub fn project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn batch(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }
}

/// One stored ledger row.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionRecord {
    pub id: i64,
    pub content_id: String,
    pub stage: Stage,
    pub previous_stage: Option<Stage>,
    pub action: String,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: Option<i64>,
    pub metadata: Value,
    pub success: bool,
    pub project_id: String,
    pub batch_id: Option<String>,
}

/// Per-item summary derived from its history.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ContentMetrics {
    pub total_steps: usize,
    pub successful_steps: usize,
    pub success_rate: f64,
    pub total_duration_ms: i64,
    pub avg_duration_ms: f64,
    pub first_action: String,
    pub last_action: String,
}

impl ContentMetrics {
    pub fn from_history(history: &[TransitionRecord]) -> Option<Self> {
        let first = history.first()?;
        let last = history.last()?;
        let total_steps = history.len();
        let successful_steps = history.iter().filter(|r| r.success).count();
        let durations: Vec<i64> = history.iter().filter_map(|r| r.duration_ms).collect();
        let total_duration_ms: i64 = durations.iter().sum();
        let avg_duration_ms = if durations.is_empty() {
            0.0
        } else {
            total_duration_ms as f64 / durations.len() as f64
        };

        Some(Self {
            total_steps,
            successful_steps,
            success_rate: successful_steps as f64 / total_steps as f64,
            total_duration_ms,
            avg_duration_ms,
            first_action: first.action.clone(),
            last_action: last.action.clone(),
        })
    }
}

const SELECT_COLUMNS: &str = "id, content_id, stage, previous_stage, action, timestamp, \
     duration_ms, metadata_json, success, project_id, batch_id";

/// Latest row per content_id, ties on timestamp broken by insertion order.
const LATEST_PER_CONTENT: &str = r#"
    t.id = (
        SELECT t2.id FROM transactions t2
        WHERE t2.content_id = t.content_id
        ORDER BY t2.timestamp DESC, t2.id DESC
        LIMIT 1
    )
"#;

/// SQLite-backed ledger handle. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Ledger {
    pool: SqlitePool,
    default_project: String,
    recent_limit: i64,
}

impl Ledger {
    pub fn new(pool: SqlitePool, config: &LedgerConfig) -> Self {
        Self {
            pool,
            default_project: config.default_project.clone(),
            recent_limit: config.recent_limit,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Append one transition. Returns the new row id.
    pub async fn record(&self, t: &NewTransition) -> Result<i64> {
        let now = Utc::now().timestamp_millis();
        let project = t
            .project_id
            .clone()
            .unwrap_or_else(|| self.default_project.clone());
        let metadata_json = serde_json::to_string(&t.metadata)?;

        let result = sqlx::query(
            r#"
            INSERT INTO transactions (content_id, stage, previous_stage, action, timestamp,
                                      duration_ms, metadata_json, success, project_id, batch_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&t.content_id)
        .bind(t.stage.code() as i64)
        .bind(t.previous_stage.map(|s| s.code() as i64))
        .bind(&t.action)
        .bind(now)
        .bind(t.duration_ms)
        .bind(&metadata_json)
        .bind(t.success)
        .bind(&project)
        .bind(&t.batch_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to record transition for '{}'", t.content_id))?;

        let id = result.last_insert_rowid();
        debug!(
            content_id = %t.content_id,
            stage = t.stage.code(),
            success = t.success,
            id,
            "ledger append"
        );
        Ok(id)
    }

    /// Stage of the most recent record, or `None` for an unseen item.
    pub async fn current_stage(&self, content_id: &str) -> Result<Option<Stage>> {
        let code: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT stage FROM transactions
            WHERE content_id = ?
            ORDER BY timestamp DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(content_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match code {
            Some(c) => Some(Stage::from_code(c)?),
            None => None,
        })
    }

    /// Full history in chronological order.
    pub async fn history(&self, content_id: &str) -> Result<Vec<TransitionRecord>> {
        let sql = format!(
            "SELECT {} FROM transactions WHERE content_id = ? ORDER BY timestamp ASC, id ASC",
            SELECT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(content_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(record_from_row).collect()
    }

    /// Records from the last `window_minutes`, newest first, capped at the
    /// configured limit.
    pub async fn recent_activity(
        &self,
        window_minutes: i64,
        project_id: Option<&str>,
    ) -> Result<Vec<TransitionRecord>> {
        let cutoff = Utc::now().timestamp_millis() - window_minutes.max(0) * 60_000;
        let sql = format!(
            r#"
            SELECT {} FROM transactions
            WHERE timestamp >= ? AND (? IS NULL OR project_id = ?)
            ORDER BY timestamp DESC, id DESC
            LIMIT ?
            "#,
            SELECT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(cutoff)
            .bind(project_id)
            .bind(project_id)
            .bind(self.recent_limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(record_from_row).collect()
    }

    /// Number of distinct items currently at each stage.
    pub async fn stage_distribution(&self, project_id: Option<&str>) -> Result<BTreeMap<Stage, i64>> {
        let sql = format!(
            r#"
            SELECT t.stage AS stage, COUNT(DISTINCT t.content_id) AS items
            FROM transactions t
            WHERE {} AND (? IS NULL OR t.project_id = ?)
            GROUP BY t.stage
            "#,
            LATEST_PER_CONTENT
        );
        let rows = sqlx::query(&sql)
            .bind(project_id)
            .bind(project_id)
            .fetch_all(&self.pool)
            .await?;

        let mut dist = BTreeMap::new();
        for row in &rows {
            let stage = Stage::from_code(row.get::<i64, _>("stage"))?;
            dist.insert(stage, row.get::<i64, _>("items"));
        }
        Ok(dist)
    }

    pub async fn metrics(&self, content_id: &str) -> Result<Option<ContentMetrics>> {
        let history = self.history(content_id).await?;
        Ok(ContentMetrics::from_history(&history))
    }

    /// Delete records older than `days`. Returns the number of rows removed.
    pub async fn purge_older_than(&self, days: i64) -> Result<u64> {
        let cutoff = Utc::now().timestamp_millis() - days.max(0) * 86_400_000;
        let result = sqlx::query("DELETE FROM transactions WHERE timestamp < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Items whose latest record sits at `stage`, oldest first.
    pub async fn content_ids_at_stage(&self, stage: Stage, limit: i64) -> Result<Vec<String>> {
        let sql = format!(
            r#"
            SELECT t.content_id FROM transactions t
            WHERE {} AND t.stage = ?
            ORDER BY t.timestamp ASC
            LIMIT ?
            "#,
            LATEST_PER_CONTENT
        );
        let ids: Vec<String> = sqlx::query_scalar(&sql)
            .bind(stage.code() as i64)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    /// Another item that recorded `content_hash` and has since reached a
    /// terminal stage.
    pub async fn terminal_holder_of_hash(
        &self,
        content_hash: &str,
        excluding: &str,
    ) -> Result<Option<String>> {
        let candidates: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT content_id FROM transactions
            WHERE json_extract(metadata_json, '$.content_hash') = ?
              AND content_id != ?
            "#,
        )
        .bind(content_hash)
        .bind(excluding)
        .fetch_all(&self.pool)
        .await?;

        for id in candidates {
            if let Some(stage) = self.current_stage(&id).await? {
                if stage.is_terminal() {
                    return Ok(Some(id));
                }
            }
        }
        Ok(None)
    }

    /// Newest value recorded under `metadata.<key>` for an item.
    pub async fn latest_metadata_value(&self, content_id: &str, key: &str) -> Result<Option<Value>> {
        let path = format!("$.{}", key);
        let raw: Option<String> = sqlx::query_scalar(
            r#"
            SELECT metadata_json FROM transactions
            WHERE content_id = ? AND json_type(metadata_json, ?) IS NOT NULL
            ORDER BY timestamp DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(content_id)
        .bind(&path)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match raw {
            Some(s) => serde_json::from_str::<Value>(&s)?.get(key).cloned(),
            None => None,
        })
    }
}

fn record_from_row(row: &SqliteRow) -> Result<TransitionRecord> {
    let ts_ms: i64 = row.get("timestamp");
    let timestamp = DateTime::from_timestamp_millis(ts_ms)
        .with_context(|| format!("invalid ledger timestamp {}", ts_ms))?;
    let previous_stage = match row.get::<Option<i64>, _>("previous_stage") {
        Some(code) => Some(Stage::from_code(code)?),
        None => None,
    };
    let metadata_json: String = row.get("metadata_json");

    Ok(TransitionRecord {
        id: row.get("id"),
        content_id: row.get("content_id"),
        stage: Stage::from_code(row.get::<i64, _>("stage"))?,
        previous_stage,
        action: row.get("action"),
        timestamp,
        duration_ms: row.get("duration_ms"),
        metadata: serde_json::from_str(&metadata_json).unwrap_or_else(|_| json!({})),
        success: row.get("success"),
        project_id: row.get("project_id"),
        batch_id: row.get("batch_id"),
    })
}
