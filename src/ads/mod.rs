//! Ad and sponsor segment detection.
//!
//! [`AdDetector`] runs several independent detectors over a text, merges
//! nearby hits into spans, scores them, and strips them. See
//! [`detector`] for the scoring pipeline and [`patterns`] for the lexicon.

pub mod detector;
pub mod patterns;

pub use detector::AdDetector;

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which detector produced a span.
///
/// `Position` and `Llm` are accepted when reading removal records written by
/// other tools; the built-in detectors never emit them as a primary method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    Keyword,
    Advertiser,
    UrlPattern,
    SectionHeader,
    Position,
    Llm,
}

impl DetectionMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            DetectionMethod::Keyword => "keyword",
            DetectionMethod::Advertiser => "advertiser",
            DetectionMethod::UrlPattern => "url_pattern",
            DetectionMethod::SectionHeader => "section_header",
            DetectionMethod::Position => "position",
            DetectionMethod::Llm => "llm",
        }
    }
}

impl fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Confidence bucket deciding what happens to a detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Below the review threshold. Not queued for review.
    Low,
    /// Queued for human review.
    Medium,
    /// Removed without review.
    High,
}

impl Tier {
    pub const DEFAULT_AUTO_REMOVE: f64 = 0.9;
    pub const DEFAULT_REVIEW: f64 = 0.7;

    pub fn classify(confidence: f64, auto_remove: f64, review: f64) -> Tier {
        if confidence >= auto_remove {
            Tier::High
        } else if confidence >= review {
            Tier::Medium
        } else {
            Tier::Low
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::High => "high",
            Tier::Medium => "medium",
            Tier::Low => "low",
        }
    }
}

/// A scored ad span.
///
/// `start`/`end` are byte offsets into the *original* text and always fall
/// on UTF-8 character boundaries, with `end > start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdDetection {
    pub start: usize,
    pub end: usize,
    /// Exact text of `original[start..end]`.
    pub text: String,
    pub method: DetectionMethod,
    pub confidence: f64,
    pub matched_pattern: String,
    #[serde(default)]
    pub metadata: Value,
}

impl AdDetection {
    /// Tier under the default thresholds.
    pub fn tier(&self) -> Tier {
        Tier::classify(self.confidence, Tier::DEFAULT_AUTO_REMOVE, Tier::DEFAULT_REVIEW)
    }

    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }

    /// First `max_chars` characters, with an ellipsis when truncated.
    pub fn preview(&self, max_chars: usize) -> String {
        preview(&self.text, max_chars)
    }
}

pub(crate) fn preview(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(max_chars).collect();
        format!("{}…", cut.trim_end())
    }
}

/// Output of [`AdDetector::strip`].
#[derive(Debug, Clone, Serialize)]
pub struct StripResult {
    pub cleaned_text: String,
    pub detections: Vec<AdDetection>,
    pub chars_removed: usize,
    pub percent_removed: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_boundaries() {
        assert_eq!(Tier::classify(0.95, 0.9, 0.7), Tier::High);
        assert_eq!(Tier::classify(0.9, 0.9, 0.7), Tier::High);
        assert_eq!(Tier::classify(0.89, 0.9, 0.7), Tier::Medium);
        assert_eq!(Tier::classify(0.7, 0.9, 0.7), Tier::Medium);
        assert_eq!(Tier::classify(0.69, 0.9, 0.7), Tier::Low);
    }

    #[test]
    fn preview_truncates_on_char_boundaries() {
        let long = "é".repeat(30);
        let p = preview(&long, 10);
        assert_eq!(p.chars().count(), 11);
        assert!(p.ends_with('…'));
        assert_eq!(preview("  short  ", 10), "short");
    }

    #[test]
    fn method_serializes_snake_case() {
        let json = serde_json::to_string(&DetectionMethod::UrlPattern).unwrap();
        assert_eq!(json, "\"url_pattern\"");
    }
}
