//! Per-content removal records.
//!
//! Every clean writes `{changes_dir}/{content_id}.json` listing each removed
//! span with the exact text that was cut. These files are the audit trail
//! and the source data for weekly reports and false-positive lookups.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::ads::{AdDetection, DetectionMethod, Tier};
use crate::error::AtlasError;
use crate::models::ContentType;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemovalEntry {
    pub index: usize,
    pub start: usize,
    pub end: usize,
    pub method: DetectionMethod,
    pub confidence: f64,
    pub tier: Tier,
    pub matched_pattern: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Value,
}

impl RemovalEntry {
    pub fn from_detection(index: usize, detection: &AdDetection, tier: Tier) -> Self {
        Self {
            index,
            start: detection.start,
            end: detection.end,
            method: detection.method,
            confidence: detection.confidence,
            tier,
            matched_pattern: detection.matched_pattern.clone(),
            text: detection.text.clone(),
            metadata: detection.metadata.clone(),
        }
    }

    /// Identifies the removed text across re-cleans, where indexes shift.
    pub fn text_hash(&self) -> String {
        crate::versioned::sha256_hex(self.text.as_bytes())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemovalRecord {
    pub content_id: String,
    pub original_path: String,
    pub clean_path: String,
    pub content_type: ContentType,
    pub original_hash: String,
    pub clean_hash: String,
    pub cleaner_version: String,
    pub cleaned_at: DateTime<Utc>,
    pub ads_removed: usize,
    pub chars_removed: usize,
    pub percent_removed: f64,
    pub quality_score: f64,
    pub removals: Vec<RemovalEntry>,
}

impl RemovalRecord {
    pub fn entry(&self, index: usize) -> Result<&RemovalEntry, AtlasError> {
        self.removals
            .get(index)
            .ok_or_else(|| AtlasError::RemovalIndexOutOfRange {
                content_id: self.content_id.clone(),
                index,
                count: self.removals.len(),
            })
    }
}

pub fn record_path(changes_dir: &Path, content_id: &str) -> PathBuf {
    changes_dir.join(format!("{}.json", content_id))
}

/// Write (or replace) the record for its content id. Returns the file path.
pub fn write_record(changes_dir: &Path, record: &RemovalRecord) -> Result<PathBuf> {
    fs::create_dir_all(changes_dir).with_context(|| {
        format!("Failed to create changes directory: {}", changes_dir.display())
    })?;
    let path = record_path(changes_dir, &record.content_id);
    let json = serde_json::to_string_pretty(record)?;
    fs::write(&path, json)
        .with_context(|| format!("Failed to write removal record: {}", path.display()))?;
    Ok(path)
}

pub fn read_record(changes_dir: &Path, content_id: &str) -> Result<RemovalRecord> {
    let path = record_path(changes_dir, content_id);
    if !path.exists() {
        return Err(AtlasError::RemovalRecordMissing(content_id.to_string()).into());
    }
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read removal record: {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse removal record: {}", path.display()))
}

/// All readable records, oldest first. Unparseable files are logged and
/// skipped so one corrupt record does not hide the rest.
pub fn list_records(changes_dir: &Path) -> Result<Vec<RemovalRecord>> {
    if !changes_dir.exists() {
        return Ok(Vec::new());
    }

    let mut records = Vec::new();
    for entry in fs::read_dir(changes_dir)
        .with_context(|| format!("Failed to list {}", changes_dir.display()))?
    {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let parsed = fs::read_to_string(&path)
            .map_err(anyhow::Error::from)
            .and_then(|raw| serde_json::from_str::<RemovalRecord>(&raw).map_err(Into::into));
        match parsed {
            Ok(record) => records.push(record),
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable removal record"),
        }
    }

    records.sort_by(|a, b| {
        a.cleaned_at
            .cmp(&b.cleaned_at)
            .then_with(|| a.content_id.cmp(&b.content_id))
    });
    Ok(records)
}

/// Records cleaned in `[since, until]`.
pub fn records_between(
    changes_dir: &Path,
    since: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Result<Vec<RemovalRecord>> {
    Ok(list_records(changes_dir)?
        .into_iter()
        .filter(|r| r.cleaned_at >= since && r.cleaned_at <= until)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn record(id: &str, at: DateTime<Utc>) -> RemovalRecord {
        RemovalRecord {
            content_id: id.to_string(),
            original_path: format!("/in/{}.txt", id),
            clean_path: format!("/out/{}.txt", id),
            content_type: ContentType::Podcast,
            original_hash: "aa".into(),
            clean_hash: "bb".into(),
            cleaner_version: "test".into(),
            cleaned_at: at,
            ads_removed: 1,
            chars_removed: 12,
            percent_removed: 3.0,
            quality_score: 0.5,
            removals: vec![RemovalEntry {
                index: 0,
                start: 4,
                end: 16,
                method: DetectionMethod::Keyword,
                confidence: 0.92,
                tier: Tier::High,
                matched_pattern: "promo code".into(),
                text: "use promo code".into(),
                metadata: Value::Null,
            }],
        }
    }

    #[test]
    fn write_then_read_by_id() {
        let dir = TempDir::new().unwrap();
        let now = Utc::now();
        write_record(dir.path(), &record("podcast-abc", now)).unwrap();

        let back = read_record(dir.path(), "podcast-abc").unwrap();
        assert_eq!(back.removals.len(), 1);
        assert_eq!(back.entry(0).unwrap().text, "use promo code");
        assert!(back.entry(3).is_err());
    }

    #[test]
    fn missing_record_is_a_typed_error() {
        let dir = TempDir::new().unwrap();
        let err = read_record(dir.path(), "nope").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AtlasError>(),
            Some(AtlasError::RemovalRecordMissing(_))
        ));
    }

    #[test]
    fn window_filter_and_corrupt_files() {
        let dir = TempDir::new().unwrap();
        let now = Utc::now();
        write_record(dir.path(), &record("old", now - Duration::days(30))).unwrap();
        write_record(dir.path(), &record("new", now - Duration::days(1))).unwrap();
        fs::write(dir.path().join("broken.json"), "{not json").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        assert_eq!(list_records(dir.path()).unwrap().len(), 2);
        let recent = records_between(dir.path(), now - Duration::days(7), now).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].content_id, "new");
    }
}
