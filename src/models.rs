//! Core data models shared by the cleaner, review queue and CLI.
//!
//! Ledger rows live in [`crate::ledger`]; ad detections in [`crate::ads`].

use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::AtlasError;

/// Kind of content being cleaned. Drives which detectors run and how the
/// quality score is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Podcast,
    Youtube,
    Article,
    Newsletter,
    Unknown,
}

impl ContentType {
    pub const ALL: [ContentType; 5] = [
        ContentType::Podcast,
        ContentType::Youtube,
        ContentType::Article,
        ContentType::Newsletter,
        ContentType::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ContentType::Podcast => "podcast",
            ContentType::Youtube => "youtube",
            ContentType::Article => "article",
            ContentType::Newsletter => "newsletter",
            ContentType::Unknown => "unknown",
        }
    }

    /// Spoken-word transcripts, where ad reads cluster at fixed positions.
    pub fn is_spoken(self) -> bool {
        matches!(self, ContentType::Podcast | ContentType::Youtube)
    }

    /// Written content that uses markdown-style section headers.
    pub fn has_sections(self) -> bool {
        matches!(self, ContentType::Article | ContentType::Newsletter)
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = AtlasError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ContentType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| AtlasError::UnknownContentType(s.to_string()))
    }
}

/// Persisted result of cleaning one original file.
#[derive(Debug, Clone, Serialize)]
pub struct CleaningRecord {
    pub content_id: String,
    pub original_path: String,
    pub clean_path: String,
    pub original_hash: String,
    pub clean_hash: String,
    pub content_type: ContentType,
    pub ads_removed: i64,
    pub chars_removed: i64,
    pub percent_removed: f64,
    pub quality_score: f64,
    /// Unix seconds.
    pub cleaned_at: i64,
    pub cleaner_version: String,
    pub removals_json: String,
    pub needs_reclean: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Confirmed,
    FalsePositive,
}

impl ReviewStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReviewStatus::Pending => "pending",
            ReviewStatus::Confirmed => "confirmed",
            ReviewStatus::FalsePositive => "false_positive",
        }
    }
}

impl FromStr for ReviewStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ReviewStatus::Pending),
            "confirmed" => Ok(ReviewStatus::Confirmed),
            "false_positive" => Ok(ReviewStatus::FalsePositive),
            other => anyhow::bail!("unknown review status: '{}'", other),
        }
    }
}

/// A medium-confidence removal awaiting a human decision.
#[derive(Debug, Clone, Serialize)]
pub struct ReviewItem {
    pub content_id: String,
    pub removal_index: i64,
    pub pattern: String,
    pub confidence: f64,
    pub text_preview: String,
    pub detected_at: i64,
    pub status: ReviewStatus,
    pub reviewed_at: Option<i64>,
    pub notes: Option<String>,
}

/// A removal a reviewer judged not to be an ad.
#[derive(Debug, Clone, Serialize)]
pub struct FalsePositive {
    pub content_id: String,
    pub removal_index: i64,
    pub pattern: String,
    pub full_text: String,
    pub reason: String,
    pub marked_at: i64,
}
