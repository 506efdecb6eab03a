//! Cleaning orchestrator: ad stripping, whitespace normalization and a
//! heuristic quality score.
//!
//! Detection always runs on the raw input so detection offsets stay valid
//! against the original text. Normalization happens afterwards, on the
//! stripped output only.

use std::collections::HashSet;
use std::sync::LazyLock;
use std::time::Instant;

use regex::Regex;
use serde::Serialize;

use crate::ads::{AdDetection, AdDetector};
use crate::config::DetectorConfig;
use crate::models::ContentType;

/// Version stamped on every cleaning record. Bump when detector behaviour
/// changes in a way that should trigger re-cleaning.
pub const CLEANER_VERSION: &str = "atlas-clean/3";

static BLANK_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("Invalid blank run regex"));

static SENTENCE_SPLIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.!?]+(?:\s+|$)").expect("Invalid sentence split regex"));

static PARAGRAPH_SPLIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*\n").expect("Invalid paragraph split regex"));

// "HOST:", "[00:12:31] Jane Doe:", "Q:", ">> " and similar speaker turns.
static DIALOGUE_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^[ \t]*(?:\[?\(?\d{1,2}:\d{2}(?::\d{2})?\)?\]?[ \t]*)?(?:[A-Z][\w.'-]*(?: [A-Z][\w.'-]*){0,3}:|>>)[ \t]",
    )
    .expect("Invalid dialogue marker regex")
});

/// Component scores averaged into [`CleaningResult::quality_score`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QualityBreakdown {
    pub length: f64,
    pub structure: f64,
    pub diversity: f64,
    /// Only present for content types with a specific check.
    pub content_type: Option<f64>,
}

impl QualityBreakdown {
    pub fn overall(&self) -> f64 {
        let mut parts = vec![self.length, self.structure, self.diversity];
        parts.extend(self.content_type);
        parts.iter().sum::<f64>() / parts.len() as f64
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CleaningResult {
    pub cleaned_text: String,
    pub detections: Vec<AdDetection>,
    pub ads_removed: usize,
    pub chars_removed: usize,
    pub percent_removed: f64,
    pub word_count: usize,
    pub quality_score: f64,
    pub quality: QualityBreakdown,
    pub processing_ms: u64,
}

/// Wraps an [`AdDetector`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ContentCleaner {
    detector: AdDetector,
}

impl ContentCleaner {
    pub fn new(config: &DetectorConfig) -> Self {
        Self {
            detector: AdDetector::new(config),
        }
    }

    pub fn with_detector(detector: AdDetector) -> Self {
        Self { detector }
    }

    pub fn detector(&self) -> &AdDetector {
        &self.detector
    }

    pub fn clean(&self, text: &str, content_type: ContentType) -> CleaningResult {
        let started = Instant::now();

        let stripped = self.detector.strip(text, content_type);
        let cleaned_text = normalize_whitespace(&stripped.cleaned_text);
        let quality = quality_breakdown(&cleaned_text, content_type);

        CleaningResult {
            word_count: word_count(&cleaned_text),
            quality_score: quality.overall(),
            quality,
            ads_removed: stripped.detections.len(),
            chars_removed: stripped.chars_removed,
            percent_removed: stripped.percent_removed,
            detections: stripped.detections,
            cleaned_text,
            processing_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// CRLF to LF, trailing whitespace trimmed per line, runs of blank lines
/// collapsed to one, outer whitespace trimmed.
pub fn normalize_whitespace(text: &str) -> String {
    let unix = text.replace("\r\n", "\n").replace('\r', "\n");
    let trimmed_lines: Vec<&str> = unix.lines().map(str::trim_end).collect();
    let joined = trimmed_lines.join("\n");
    BLANK_RUN.replace_all(&joined, "\n\n").trim().to_string()
}

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Mean of the component scores, in [0, 1].
pub fn quality_score(text: &str, content_type: ContentType) -> f64 {
    quality_breakdown(text, content_type).overall()
}

pub fn quality_breakdown(text: &str, content_type: ContentType) -> QualityBreakdown {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return QualityBreakdown {
            length: 0.0,
            structure: 0.0,
            diversity: 0.0,
            content_type: match content_type {
                ContentType::Podcast | ContentType::Article => Some(0.0),
                _ => None,
            },
        };
    }

    let length = (words.len() as f64 / 1000.0).min(1.0);

    let sentence_lengths: Vec<usize> = SENTENCE_SPLIT
        .split(text)
        .map(word_count)
        .filter(|n| *n > 0)
        .collect();
    let avg_sentence = if sentence_lengths.is_empty() {
        words.len() as f64
    } else {
        sentence_lengths.iter().sum::<usize>() as f64 / sentence_lengths.len() as f64
    };
    let structure = if (10.0..=25.0).contains(&avg_sentence) {
        1.0
    } else if (5.0..10.0).contains(&avg_sentence) || (25.0..=40.0).contains(&avg_sentence) {
        0.7
    } else {
        0.4
    };

    let unique: HashSet<String> = words
        .iter()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect();
    let diversity = (unique.len() as f64 / words.len() as f64 * 2.0).min(1.0);

    let content_type = match content_type {
        ContentType::Podcast => Some(if DIALOGUE_MARKER.is_match(text) { 1.0 } else { 0.5 }),
        ContentType::Article => {
            let paragraphs = PARAGRAPH_SPLIT
                .split(text)
                .filter(|p| !p.trim().is_empty())
                .count();
            Some(if paragraphs >= 3 { 1.0 } else { 0.5 })
        }
        _ => None,
    };

    QualityBreakdown {
        length,
        structure,
        diversity,
        content_type,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_line_endings_and_blank_runs() {
        let raw = "  Title  \r\n\r\n\r\n\r\nBody line   \r\nNext\t\n\n\n\nEnd  \n";
        assert_eq!(normalize_whitespace(raw), "Title\n\nBody line\nNext\n\nEnd");
    }

    #[test]
    fn clean_removes_ads_and_reports_counts() {
        let cleaner = ContentCleaner::new(&DetectorConfig::default());
        let text = "Welcome back. Brought to you by NordVPN, use code SAVE20 at nordvpn.com/promo for 70% off. Now, today's topic...";
        let result = cleaner.clean(text, ContentType::Podcast);
        assert_eq!(result.cleaned_text, "Welcome back. Now, today's topic...");
        assert_eq!(result.ads_removed, 1);
        assert_eq!(result.word_count, 5);
        assert!(result.chars_removed > 70);
        assert!((0.0..=1.0).contains(&result.quality_score));
    }

    #[test]
    fn empty_text_scores_zero() {
        assert_eq!(quality_score("", ContentType::Unknown), 0.0);
        let q = quality_breakdown("   ", ContentType::Article);
        assert_eq!(q.content_type, Some(0.0));
    }

    #[test]
    fn structure_prefers_medium_sentences() {
        let medium = "The quick brown fox jumps over the lazy dog near the river bank today. ".repeat(5);
        let short = "Go now. Stop. Run fast. ".repeat(5);
        assert_eq!(quality_breakdown(&medium, ContentType::Unknown).structure, 1.0);
        assert_eq!(quality_breakdown(&short, ContentType::Unknown).structure, 0.4);
    }

    #[test]
    fn repetition_lowers_diversity() {
        let repeated = "word ".repeat(100);
        let q = quality_breakdown(&repeated, ContentType::Unknown);
        assert!(q.diversity < 0.05);
        let varied = "every single token here is entirely distinct from all others";
        assert_eq!(quality_breakdown(varied, ContentType::Unknown).diversity, 1.0);
    }

    #[test]
    fn content_type_checks() {
        let transcript = "HOST: Welcome to the show.\nGUEST: Thanks for having me.";
        assert_eq!(
            quality_breakdown(transcript, ContentType::Podcast).content_type,
            Some(1.0)
        );
        let prose = "No speakers are marked anywhere in this paragraph.";
        assert_eq!(
            quality_breakdown(prose, ContentType::Podcast).content_type,
            Some(0.5)
        );

        let article = "First paragraph.\n\nSecond paragraph.\n\nThird paragraph.";
        assert_eq!(
            quality_breakdown(article, ContentType::Article).content_type,
            Some(1.0)
        );
        assert_eq!(quality_breakdown(article, ContentType::Newsletter).content_type, None);
    }

    #[test]
    fn overall_is_mean_of_present_components() {
        let q = QualityBreakdown {
            length: 0.2,
            structure: 1.0,
            diversity: 0.6,
            content_type: None,
        };
        assert!((q.overall() - 0.6).abs() < 1e-9);
        let q = QualityBreakdown {
            content_type: Some(1.0),
            ..q
        };
        assert!((q.overall() - 0.7).abs() < 1e-9);
    }
}
