//! Human review of medium-confidence removals, false-positive capture, and
//! the weekly report.
//!
//! Nothing here rewrites detector patterns. The report lists suggestions;
//! acting on them is a manual pattern change followed by a targeted
//! re-clean (see [`crate::versioned::VersionedCleaner::find_affected`]).

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::ads::{preview, Tier};
use crate::audit::{self, RemovalEntry};
use crate::error::AtlasError;
use crate::models::{FalsePositive, ReviewItem, ReviewStatus};

const PREVIEW_CHARS: usize = 200;
const REPORT_SAMPLES: usize = 5;
const REPORT_PENDING: usize = 10;

#[derive(Debug, Clone)]
pub struct ReviewQueue {
    pool: SqlitePool,
    changes_dir: PathBuf,
}

impl ReviewQueue {
    pub fn new(pool: SqlitePool, changes_dir: impl Into<PathBuf>) -> Self {
        Self {
            pool,
            changes_dir: changes_dir.into(),
        }
    }

    /// Rebuild the queue for `content_id` from the removals of a fresh clean.
    ///
    /// Removal indexes restart at 0 on every clean, so reviewed rows are
    /// matched to the new removals by the hash of their text. A decision
    /// follows its text to the new index; one whose text is gone is dropped
    /// (the `false_positives` log keeps it). Every medium-tier removal left
    /// without a decision is queued as pending. Returns the pending count.
    pub async fn enqueue(&self, content_id: &str, removals: &[RemovalEntry]) -> Result<usize> {
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let reviewed = sqlx::query(
            r#"
            SELECT removal_index, text_hash, detected_at, status, reviewed_at, notes
            FROM review_queue
            WHERE content_id = ? AND status != 'pending'
            ORDER BY removal_index ASC
            "#,
        )
        .bind(content_id)
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM review_queue WHERE content_id = ?")
            .bind(content_id)
            .execute(&mut *tx)
            .await?;

        let hashes: Vec<String> = removals.iter().map(RemovalEntry::text_hash).collect();
        let mut claimed = vec![false; removals.len()];

        for row in &reviewed {
            let old_index: i64 = row.get("removal_index");
            let hash: String = row.get("text_hash");
            // Same place first, then anywhere the text moved to.
            let target = usize::try_from(old_index)
                .ok()
                .filter(|&i| i < removals.len() && !claimed[i] && hashes[i] == hash)
                .or_else(|| (0..removals.len()).find(|&i| !claimed[i] && hashes[i] == hash));

            let Some(i) = target else {
                let status: String = row.get("status");
                info!(content_id, old_index, %status, "review decision dropped; removed text changed");
                continue;
            };
            claimed[i] = true;

            let entry = &removals[i];
            sqlx::query(
                r#"
                INSERT INTO review_queue (content_id, removal_index, pattern, confidence,
                                          text_preview, text_hash, detected_at, status,
                                          reviewed_at, notes)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(content_id)
            .bind(entry.index as i64)
            .bind(&entry.matched_pattern)
            .bind(entry.confidence)
            .bind(preview(&entry.text, PREVIEW_CHARS))
            .bind(&hashes[i])
            .bind(row.get::<i64, _>("detected_at"))
            .bind(row.get::<String, _>("status"))
            .bind(row.get::<Option<i64>, _>("reviewed_at"))
            .bind(row.get::<Option<String>, _>("notes"))
            .execute(&mut *tx)
            .await?;
        }

        let mut queued = 0;
        for (i, entry) in removals.iter().enumerate() {
            if entry.tier != Tier::Medium || claimed[i] {
                continue;
            }
            sqlx::query(
                r#"
                INSERT INTO review_queue (content_id, removal_index, pattern, confidence,
                                          text_preview, text_hash, detected_at, status)
                VALUES (?, ?, ?, ?, ?, ?, ?, 'pending')
                "#,
            )
            .bind(content_id)
            .bind(entry.index as i64)
            .bind(&entry.matched_pattern)
            .bind(entry.confidence)
            .bind(preview(&entry.text, PREVIEW_CHARS))
            .bind(&hashes[i])
            .bind(now)
            .execute(&mut *tx)
            .await?;
            queued += 1;
        }

        tx.commit().await?;
        Ok(queued)
    }

    /// Items, oldest first, optionally filtered by status.
    pub async fn list(&self, status: Option<ReviewStatus>, limit: i64) -> Result<Vec<ReviewItem>> {
        let status = status.map(|s| s.as_str());
        let rows = sqlx::query(
            r#"
            SELECT content_id, removal_index, pattern, confidence, text_preview,
                   detected_at, status, reviewed_at, notes
            FROM review_queue
            WHERE (? IS NULL OR status = ?)
            ORDER BY detected_at ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(status)
        .bind(status)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<ReviewItem> {
                let status: String = row.get("status");
                Ok(ReviewItem {
                    content_id: row.get("content_id"),
                    removal_index: row.get("removal_index"),
                    pattern: row.get("pattern"),
                    confidence: row.get("confidence"),
                    text_preview: row.get("text_preview"),
                    detected_at: row.get("detected_at"),
                    status: status.parse()?,
                    reviewed_at: row.get("reviewed_at"),
                    notes: row.get("notes"),
                })
            })
            .collect()
    }

    pub async fn counts_by_status(&self) -> Result<BTreeMap<String, i64>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM review_queue GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|r| (r.get::<String, _>("status"), r.get::<i64, _>("n")))
            .collect())
    }

    /// Record that removal `index` of `content_id` was not an ad. The full
    /// removed text comes from the removal record, not the truncated preview.
    pub async fn mark_false_positive(
        &self,
        content_id: &str,
        removal_index: usize,
        reason: &str,
    ) -> Result<FalsePositive> {
        let record = audit::read_record(&self.changes_dir, content_id)?;
        let entry = record.entry(removal_index)?;
        let now = Utc::now().timestamp();

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO false_positives (content_id, removal_index, pattern, full_text, reason, marked_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(content_id)
        .bind(removal_index as i64)
        .bind(&entry.matched_pattern)
        .bind(&entry.text)
        .bind(reason)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        // High-tier removals never hit the queue; give them a row so the
        // decision shows up alongside the rest.
        sqlx::query(
            r#"
            INSERT INTO review_queue (content_id, removal_index, pattern, confidence,
                                      text_preview, text_hash, detected_at, status,
                                      reviewed_at, notes)
            VALUES (?, ?, ?, ?, ?, ?, ?, 'false_positive', ?, ?)
            ON CONFLICT(content_id, removal_index) DO UPDATE SET
                status = 'false_positive',
                text_hash = excluded.text_hash,
                reviewed_at = excluded.reviewed_at,
                notes = excluded.notes
            "#,
        )
        .bind(content_id)
        .bind(removal_index as i64)
        .bind(&entry.matched_pattern)
        .bind(entry.confidence)
        .bind(preview(&entry.text, PREVIEW_CHARS))
        .bind(entry.text_hash())
        .bind(now)
        .bind(now)
        .bind(reason)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        info!(content_id, removal_index, pattern = %entry.matched_pattern, "marked false positive");

        Ok(FalsePositive {
            content_id: content_id.to_string(),
            removal_index: removal_index as i64,
            pattern: entry.matched_pattern.clone(),
            full_text: entry.text.clone(),
            reason: reason.to_string(),
            marked_at: now,
        })
    }

    /// Confirm a queued removal was a real ad.
    pub async fn confirm(
        &self,
        content_id: &str,
        removal_index: usize,
        notes: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE review_queue
            SET status = 'confirmed', reviewed_at = ?, notes = COALESCE(?, notes)
            WHERE content_id = ? AND removal_index = ?
            "#,
        )
        .bind(Utc::now().timestamp())
        .bind(notes)
        .bind(content_id)
        .bind(removal_index as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AtlasError::ReviewItemMissing {
                content_id: content_id.to_string(),
                index: removal_index,
            }
            .into());
        }
        Ok(())
    }

    pub async fn false_positives_since(&self, since: i64) -> Result<Vec<FalsePositive>> {
        let rows = sqlx::query(
            r#"
            SELECT content_id, removal_index, pattern, full_text, reason, marked_at
            FROM false_positives
            WHERE marked_at >= ?
            ORDER BY marked_at ASC, id ASC
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| FalsePositive {
                content_id: row.get("content_id"),
                removal_index: row.get("removal_index"),
                pattern: row.get("pattern"),
                full_text: row.get("full_text"),
                reason: row.get("reason"),
                marked_at: row.get("marked_at"),
            })
            .collect())
    }

    /// Markdown summary of the `days` ending at `now`. Read-only.
    pub async fn generate_weekly_report(&self, now: DateTime<Utc>, days: i64) -> Result<String> {
        let since = now - Duration::days(days.max(1));
        let records = audit::records_between(&self.changes_dir, since, now)?;
        let pending = self.list(Some(ReviewStatus::Pending), i64::MAX).await?;
        let false_positives = self.false_positives_since(since.timestamp()).await?;

        let mut tiers: BTreeMap<Tier, usize> = BTreeMap::new();
        let mut chars_removed = 0usize;
        let mut high: Vec<(&str, &RemovalEntry)> = Vec::new();
        for record in &records {
            chars_removed += record.chars_removed;
            for entry in &record.removals {
                *tiers.entry(entry.tier).or_default() += 1;
                if entry.tier == Tier::High {
                    high.push((record.content_id.as_str(), entry));
                }
            }
        }
        high.sort_by(|a, b| b.1.confidence.total_cmp(&a.1.confidence));
        let total_ads: usize = tiers.values().sum();

        let mut out = String::new();
        writeln!(out, "# Atlas Weekly Cleaning Report")?;
        writeln!(out)?;
        writeln!(
            out,
            "Period: {} to {}",
            since.format("%Y-%m-%d"),
            now.format("%Y-%m-%d")
        )?;
        writeln!(out)?;

        writeln!(out, "## Summary")?;
        writeln!(out)?;
        writeln!(out, "- Files processed: {}", records.len())?;
        writeln!(out, "- Ads removed: {}", total_ads)?;
        writeln!(out, "- Characters removed: {}", chars_removed)?;
        for tier in [Tier::High, Tier::Medium, Tier::Low] {
            writeln!(
                out,
                "- {} confidence: {}",
                tier.as_str(),
                tiers.get(&tier).copied().unwrap_or(0)
            )?;
        }
        writeln!(out)?;

        writeln!(out, "## Sample High-Confidence Removals")?;
        writeln!(out)?;
        if high.is_empty() {
            writeln!(out, "None.")?;
        }
        for (content_id, entry) in high.iter().take(REPORT_SAMPLES) {
            writeln!(
                out,
                "- `{}` #{} ({}, {:.2}): {}",
                content_id,
                entry.index,
                entry.matched_pattern,
                entry.confidence,
                preview(&entry.text, 120)
            )?;
        }
        writeln!(out)?;

        writeln!(out, "## Pending Review ({})", pending.len())?;
        writeln!(out)?;
        for item in pending.iter().take(REPORT_PENDING) {
            writeln!(
                out,
                "- `{}` #{} ({}, {:.2}): {}",
                item.content_id,
                item.removal_index,
                item.pattern,
                item.confidence,
                preview(&item.text_preview, 120)
            )?;
        }
        if pending.len() > REPORT_PENDING {
            writeln!(out, "- ... and {} more", pending.len() - REPORT_PENDING)?;
        }
        writeln!(out)?;

        writeln!(out, "## False Positives ({})", false_positives.len())?;
        writeln!(out)?;
        for fp in &false_positives {
            writeln!(
                out,
                "- `{}` #{} ({}): {}",
                fp.content_id, fp.removal_index, fp.pattern, fp.reason
            )?;
        }
        writeln!(out)?;

        writeln!(out, "## Suggested Negative Patterns")?;
        writeln!(out)?;
        let mut by_pattern: BTreeMap<&str, Vec<&FalsePositive>> = BTreeMap::new();
        for fp in &false_positives {
            by_pattern.entry(fp.pattern.as_str()).or_default().push(fp);
        }
        if by_pattern.is_empty() {
            writeln!(out, "No false positives reported in this period.")?;
        }
        for (pattern, hits) in &by_pattern {
            writeln!(
                out,
                "### `{}` ({} false positive{})",
                pattern,
                hits.len(),
                if hits.len() == 1 { "" } else { "s" }
            )?;
            writeln!(out)?;
            for fp in hits.iter().take(3) {
                writeln!(out, "> {}", preview(&fp.full_text, 160))?;
                writeln!(out)?;
            }
            writeln!(
                out,
                "Consider a negative pattern covering the context above, then re-clean affected content."
            )?;
            writeln!(out)?;
        }

        Ok(out)
    }

    /// Write the report to `{dir}/weekly-YYYY-MM-DD.md`.
    pub async fn write_weekly_report(
        &self,
        dir: &Path,
        now: DateTime<Utc>,
        days: i64,
    ) -> Result<PathBuf> {
        let report = self.generate_weekly_report(now, days).await?;
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create reports directory: {}", dir.display()))?;
        let path = dir.join(format!("weekly-{}.md", now.format("%Y-%m-%d")));
        std::fs::write(&path, report)
            .with_context(|| format!("Failed to write report: {}", path.display()))?;
        info!(path = %path.display(), "weekly report written");
        Ok(path)
    }
}
