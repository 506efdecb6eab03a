//! Versioned, non-destructive cleaning of files on disk.
//!
//! Originals are only ever read. Each clean writes three things:
//!
//! - the cleaned copy at `{clean_dir}/{content_type}/{content_id}.{ext}`
//! - the removal record at `{changes_dir}/{content_id}.json`
//! - the `cleaning_records` row keyed by content id
//!
//! and replaces the item's pending review entries. Re-cleaning an unchanged
//! original is skipped unless forced or flagged with `needs_reclean`.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::RegexBuilder;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::ads::patterns::brand_pattern;
use crate::audit::{self, RemovalEntry, RemovalRecord};
use crate::clean::{ContentCleaner, CLEANER_VERSION};
use crate::config::{Config, StorageConfig};
use crate::error::AtlasError;
use crate::models::{CleaningRecord, ContentType};
use crate::progress::{BatchProgressEvent, BatchProgressReporter};
use crate::review::ReviewQueue;

/// Outcome counts of a multi-file run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchSummary {
    pub processed: usize,
    pub skipped: usize,
    pub errors: usize,
    pub ads_removed: usize,
    pub chars_removed: usize,
}

impl BatchSummary {
    fn add(&mut self, outcome: Result<Option<CleaningRecord>>, path: &str) {
        match outcome {
            Ok(Some(record)) => {
                self.processed += 1;
                self.ads_removed += record.ads_removed as usize;
                self.chars_removed += record.chars_removed as usize;
            }
            Ok(None) => self.skipped += 1,
            Err(e) => {
                warn!(path, error = %e, "clean failed");
                self.errors += 1;
            }
        }
    }
}

const SELECT_COLUMNS: &str = "content_id, original_path, clean_path, original_hash, clean_hash, \
     content_type, ads_removed, chars_removed, percent_removed, quality_score, cleaned_at, \
     cleaner_version, removals_json, needs_reclean";

#[derive(Debug, Clone)]
pub struct VersionedCleaner {
    pool: SqlitePool,
    cleaner: ContentCleaner,
    review: ReviewQueue,
    storage: StorageConfig,
}

impl VersionedCleaner {
    pub fn new(pool: SqlitePool, config: &Config) -> Self {
        Self {
            review: ReviewQueue::new(pool.clone(), config.storage.changes_dir.clone()),
            cleaner: ContentCleaner::new(&config.detector),
            storage: config.storage.clone(),
            pool,
        }
    }

    /// Same store and storage layout, different cleaner (e.g. a CLI
    /// confidence override).
    pub fn with_cleaner(mut self, cleaner: ContentCleaner) -> Self {
        self.cleaner = cleaner;
        self
    }

    pub fn cleaner(&self) -> &ContentCleaner {
        &self.cleaner
    }

    pub fn review(&self) -> &ReviewQueue {
        &self.review
    }

    /// Clean one original. `Ok(None)` means nothing to do: a record with the
    /// same hash exists and is not flagged for re-cleaning.
    pub async fn clean_file(
        &self,
        original_path: &Path,
        content_type: ContentType,
        force: bool,
    ) -> Result<Option<CleaningRecord>> {
        let original = fs::canonicalize(original_path)
            .with_context(|| format!("Failed to resolve {}", original_path.display()))?;
        let original_str = original.to_string_lossy().to_string();

        let bytes = fs::read(&original)
            .with_context(|| format!("Failed to read {}", original.display()))?;
        let original_hash = sha256_hex(&bytes);

        let existing = self.get_by_path(&original_str).await?;
        if let Some(prev) = &existing {
            if !force && !prev.needs_reclean && prev.original_hash == original_hash {
                debug!(content_id = %prev.content_id, "unchanged, skipping");
                return Ok(None);
            }
        }

        let content_id = resolve_content_id(existing.as_ref(), content_type, &original_str);
        let clean_path = self.clean_path_for(&content_id, content_type, &original);
        if clean_path == original
            || fs::canonicalize(&clean_path).ok().as_deref() == Some(original.as_path())
        {
            return Err(AtlasError::WouldOverwriteOriginal(original).into());
        }

        let text = String::from_utf8_lossy(&bytes);
        let result = self.cleaner.clean(&text, content_type);

        if let Some(parent) = clean_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(&clean_path, &result.cleaned_text)
            .with_context(|| format!("Failed to write {}", clean_path.display()))?;
        let clean_hash = sha256_hex(result.cleaned_text.as_bytes());

        let detector = self.cleaner.detector();
        let removals: Vec<RemovalEntry> = result
            .detections
            .iter()
            .enumerate()
            .map(|(i, d)| RemovalEntry::from_detection(i, d, detector.tier(d)))
            .collect();

        let cleaned_at = Utc::now();
        let clean_path_str = clean_path.to_string_lossy().to_string();
        audit::write_record(
            &self.storage.changes_dir,
            &RemovalRecord {
                content_id: content_id.clone(),
                original_path: original_str.clone(),
                clean_path: clean_path_str.clone(),
                content_type,
                original_hash: original_hash.clone(),
                clean_hash: clean_hash.clone(),
                cleaner_version: CLEANER_VERSION.to_string(),
                cleaned_at,
                ads_removed: result.ads_removed,
                chars_removed: result.chars_removed,
                percent_removed: result.percent_removed,
                quality_score: result.quality_score,
                removals: removals.clone(),
            },
        )?;

        let record = CleaningRecord {
            content_id: content_id.clone(),
            original_path: original_str,
            clean_path: clean_path_str,
            original_hash,
            clean_hash,
            content_type,
            ads_removed: result.ads_removed as i64,
            chars_removed: result.chars_removed as i64,
            percent_removed: result.percent_removed,
            quality_score: result.quality_score,
            cleaned_at: cleaned_at.timestamp(),
            cleaner_version: CLEANER_VERSION.to_string(),
            removals_json: serde_json::to_string(&removals)?,
            needs_reclean: false,
        };
        self.upsert(&record).await?;
        let queued = self.review.enqueue(&content_id, &removals).await?;

        info!(
            content_id = %record.content_id,
            ads = record.ads_removed,
            chars = record.chars_removed,
            queued,
            "cleaned"
        );
        Ok(Some(record))
    }

    /// Clean every matching file under `root`. Per-file failures are
    /// counted and the run continues. With `dry_run` nothing is written;
    /// `processed` then counts files that would be cleaned.
    pub async fn batch_clean(
        &self,
        root: &Path,
        content_type: ContentType,
        force: bool,
        dry_run: bool,
        progress: &dyn BatchProgressReporter,
    ) -> Result<BatchSummary> {
        if !root.is_dir() {
            bail!("Batch root is not a directory: {}", root.display());
        }
        progress.report(BatchProgressEvent::Discovering {
            root: root.display().to_string(),
        });
        let files = self.discover(root)?;
        let total = files.len() as u64;

        let mut summary = BatchSummary::default();
        for (i, path) in files.iter().enumerate() {
            let display = path.display().to_string();
            let outcome = if dry_run {
                self.preview_file(path, content_type, force).await
            } else {
                self.clean_file(path, content_type, force).await
            };
            summary.add(outcome, &display);
            progress.report(BatchProgressEvent::Cleaning {
                n: i as u64 + 1,
                total,
                path: display,
            });
        }

        progress.report(BatchProgressEvent::Done {
            processed: summary.processed as u64,
            skipped: summary.skipped as u64,
            errors: summary.errors as u64,
        });
        Ok(summary)
    }

    /// Would-be record for a dry run, with the id and clean path a real
    /// [`clean_file`](Self::clean_file) would use. Nothing touches disk or
    /// the database.
    pub async fn preview_file(
        &self,
        path: &Path,
        content_type: ContentType,
        force: bool,
    ) -> Result<Option<CleaningRecord>> {
        let original = fs::canonicalize(path)
            .with_context(|| format!("Failed to resolve {}", path.display()))?;
        let original_str = original.to_string_lossy().to_string();
        let bytes = fs::read(&original)
            .with_context(|| format!("Failed to read {}", original.display()))?;
        let original_hash = sha256_hex(&bytes);

        let existing = self.get_by_path(&original_str).await?;
        if let Some(prev) = &existing {
            if !force && !prev.needs_reclean && prev.original_hash == original_hash {
                return Ok(None);
            }
        }

        let result = self.cleaner.clean(&String::from_utf8_lossy(&bytes), content_type);
        let content_id = resolve_content_id(existing.as_ref(), content_type, &original_str);
        Ok(Some(CleaningRecord {
            clean_path: self
                .clean_path_for(&content_id, content_type, &original)
                .to_string_lossy()
                .to_string(),
            content_id,
            original_path: original_str,
            original_hash,
            clean_hash: sha256_hex(result.cleaned_text.as_bytes()),
            content_type,
            ads_removed: result.ads_removed as i64,
            chars_removed: result.chars_removed as i64,
            percent_removed: result.percent_removed,
            quality_score: result.quality_score,
            cleaned_at: Utc::now().timestamp(),
            cleaner_version: CLEANER_VERSION.to_string(),
            removals_json: "[]".to_string(),
            needs_reclean: false,
        }))
    }

    /// Flag records whose original changed on disk. Returns their ids.
    pub async fn detect_changes(&self) -> Result<Vec<String>> {
        let mut changed = Vec::new();
        for record in self.list(None).await? {
            if record.needs_reclean {
                continue;
            }
            let bytes = match fs::read(&record.original_path) {
                Ok(b) => b,
                Err(e) => {
                    warn!(path = %record.original_path, error = %e, "original unreadable");
                    continue;
                }
            };
            if sha256_hex(&bytes) != record.original_hash {
                self.set_needs_reclean(&record.content_id).await?;
                changed.push(record.content_id);
            }
        }
        Ok(changed)
    }

    /// Flag every record (or every record of one type) for re-cleaning,
    /// typically after a pattern change.
    pub async fn invalidate(&self, content_type: Option<ContentType>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE cleaning_records SET needs_reclean = 1 WHERE (? IS NULL OR content_type = ?)",
        )
        .bind(content_type.map(|t| t.as_str()))
        .bind(content_type.map(|t| t.as_str()))
        .execute(&self.pool)
        .await?;
        info!(flagged = result.rows_affected(), "invalidated cleaning records");
        Ok(result.rows_affected())
    }

    pub async fn reclean_pending(&self, progress: &dyn BatchProgressReporter) -> Result<BatchSummary> {
        let pending: Vec<CleaningRecord> = self
            .list(None)
            .await?
            .into_iter()
            .filter(|r| r.needs_reclean)
            .collect();
        self.reclean_records(&pending, false, progress).await
    }

    /// Content whose removal records cut text naming any of `advertisers`.
    pub async fn find_affected(&self, advertisers: &[String]) -> Result<Vec<String>> {
        let mut matchers = Vec::new();
        for name in advertisers {
            let pattern = brand_pattern(&name.to_lowercase());
            matchers.push(
                RegexBuilder::new(&pattern)
                    .case_insensitive(true)
                    .build()
                    .with_context(|| format!("Invalid advertiser name: {}", name))?,
            );
        }

        let mut affected = BTreeSet::new();
        for record in audit::list_records(&self.storage.changes_dir)? {
            let hit = record
                .removals
                .iter()
                .any(|r| matchers.iter().any(|m| m.is_match(&r.text)));
            if hit {
                affected.insert(record.content_id);
            }
        }
        Ok(affected.into_iter().collect())
    }

    /// Force a re-clean of specific items. Unknown ids count as errors.
    pub async fn reclean(
        &self,
        content_ids: &[String],
        progress: &dyn BatchProgressReporter,
    ) -> Result<BatchSummary> {
        let mut records = Vec::new();
        let mut missing = 0;
        for id in content_ids {
            match self.get(id).await? {
                Some(r) => records.push(r),
                None => {
                    warn!(content_id = %id, "no cleaning record");
                    missing += 1;
                }
            }
        }
        let mut summary = self.reclean_records(&records, true, progress).await?;
        summary.errors += missing;
        Ok(summary)
    }

    async fn reclean_records(
        &self,
        records: &[CleaningRecord],
        force: bool,
        progress: &dyn BatchProgressReporter,
    ) -> Result<BatchSummary> {
        let total = records.len() as u64;
        let mut summary = BatchSummary::default();
        for (i, record) in records.iter().enumerate() {
            let outcome = self
                .clean_file(Path::new(&record.original_path), record.content_type, force)
                .await;
            summary.add(outcome, &record.original_path);
            progress.report(BatchProgressEvent::Cleaning {
                n: i as u64 + 1,
                total,
                path: record.original_path.clone(),
            });
        }
        progress.report(BatchProgressEvent::Done {
            processed: summary.processed as u64,
            skipped: summary.skipped as u64,
            errors: summary.errors as u64,
        });
        Ok(summary)
    }

    pub async fn get(&self, content_id: &str) -> Result<Option<CleaningRecord>> {
        let sql = format!("SELECT {} FROM cleaning_records WHERE content_id = ?", SELECT_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(content_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    /// Record for an original file, if it has been cleaned.
    pub async fn get_by_original(&self, original_path: &Path) -> Result<Option<CleaningRecord>> {
        let original = fs::canonicalize(original_path)
            .with_context(|| format!("Failed to resolve {}", original_path.display()))?;
        self.get_by_path(&original.to_string_lossy()).await
    }

    async fn get_by_path(&self, original_path: &str) -> Result<Option<CleaningRecord>> {
        let sql = format!(
            "SELECT {} FROM cleaning_records WHERE original_path = ?",
            SELECT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(original_path)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    pub async fn list(&self, content_type: Option<ContentType>) -> Result<Vec<CleaningRecord>> {
        let sql = format!(
            "SELECT {} FROM cleaning_records WHERE (? IS NULL OR content_type = ?) ORDER BY cleaned_at ASC, content_id ASC",
            SELECT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(content_type.map(|t| t.as_str()))
            .bind(content_type.map(|t| t.as_str()))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn upsert(&self, r: &CleaningRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cleaning_records (content_id, original_path, clean_path, original_hash,
                                          clean_hash, content_type, ads_removed, chars_removed,
                                          percent_removed, quality_score, cleaned_at,
                                          cleaner_version, removals_json, needs_reclean)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(content_id) DO UPDATE SET
                original_path = excluded.original_path,
                clean_path = excluded.clean_path,
                original_hash = excluded.original_hash,
                clean_hash = excluded.clean_hash,
                content_type = excluded.content_type,
                ads_removed = excluded.ads_removed,
                chars_removed = excluded.chars_removed,
                percent_removed = excluded.percent_removed,
                quality_score = excluded.quality_score,
                cleaned_at = excluded.cleaned_at,
                cleaner_version = excluded.cleaner_version,
                removals_json = excluded.removals_json,
                needs_reclean = excluded.needs_reclean
            "#,
        )
        .bind(&r.content_id)
        .bind(&r.original_path)
        .bind(&r.clean_path)
        .bind(&r.original_hash)
        .bind(&r.clean_hash)
        .bind(r.content_type.as_str())
        .bind(r.ads_removed)
        .bind(r.chars_removed)
        .bind(r.percent_removed)
        .bind(r.quality_score)
        .bind(r.cleaned_at)
        .bind(&r.cleaner_version)
        .bind(&r.removals_json)
        .bind(r.needs_reclean)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to save cleaning record '{}'", r.content_id))?;
        Ok(())
    }

    async fn set_needs_reclean(&self, content_id: &str) -> Result<()> {
        sqlx::query("UPDATE cleaning_records SET needs_reclean = 1 WHERE content_id = ?")
            .bind(content_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn clean_path_for(&self, content_id: &str, content_type: ContentType, original: &Path) -> PathBuf {
        let ext = original
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("txt");
        self.storage
            .clean_dir
            .join(content_type.as_str())
            .join(format!("{}.{}", content_id, ext))
    }

    /// Matching files under `root`, sorted. Atlas's own output directories
    /// are never inputs.
    fn discover(&self, root: &Path) -> Result<Vec<PathBuf>> {
        let include = build_globset(&self.storage.include_globs)?;
        let mut excludes = vec!["**/.git/**".to_string()];
        excludes.extend(self.storage.exclude_globs.clone());
        let exclude = build_globset(&excludes)?;

        let outputs: Vec<PathBuf> = [&self.storage.clean_dir, &self.storage.changes_dir]
            .iter()
            .filter_map(|d| fs::canonicalize(d).ok())
            .collect();

        let mut files = Vec::new();
        for entry in WalkDir::new(root) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(path);
            let rel_str = relative.to_string_lossy().to_string();
            if exclude.is_match(&rel_str) || !include.is_match(&rel_str) {
                continue;
            }
            if let Ok(canonical) = fs::canonicalize(path) {
                if outputs.iter().any(|o| canonical.starts_with(o)) {
                    continue;
                }
            }
            files.push(path.to_path_buf());
        }
        files.sort();
        Ok(files)
    }
}

/// An original keeps its first id for life, even if later cleaned as
/// another type.
fn resolve_content_id(
    existing: Option<&CleaningRecord>,
    content_type: ContentType,
    original_path: &str,
) -> String {
    match existing {
        Some(prev) => prev.content_id.clone(),
        None => derive_content_id(content_type, original_path),
    }
}

/// `{content_type}-{first 12 hex of sha256(path)}`. Stable for a path.
pub fn derive_content_id(content_type: ContentType, original_path: &str) -> String {
    let digest = sha256_hex(original_path.as_bytes());
    format!("{}-{}", content_type.as_str(), &digest[..12])
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

fn record_from_row(row: &SqliteRow) -> Result<CleaningRecord> {
    let content_type: String = row.get("content_type");
    Ok(CleaningRecord {
        content_id: row.get("content_id"),
        original_path: row.get("original_path"),
        clean_path: row.get("clean_path"),
        original_hash: row.get("original_hash"),
        clean_hash: row.get("clean_hash"),
        content_type: content_type.parse()?,
        ads_removed: row.get("ads_removed"),
        chars_removed: row.get("chars_removed"),
        percent_removed: row.get("percent_removed"),
        quality_score: row.get("quality_score"),
        cleaned_at: row.get("cleaned_at"),
        cleaner_version: row.get("cleaner_version"),
        removals_json: row.get("removals_json"),
        needs_reclean: row.get("needs_reclean"),
    })
}
