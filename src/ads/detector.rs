//! Multi-signal ad detector.
//!
//! # Pipeline
//!
//! ```text
//! keyword ─┐
//! brand ───┤   positional    merge      compound     negative     filter
//! url ─────┼──▶ boost ─────▶ spans ───▶ boost ─────▶ penalty ───▶ conf/len
//! section ─┘  (spoken only)  (≤ gap)   (≥2 signals)  (×penalty)
//! ```
//!
//! Each detector proposes spans with a base confidence. Trigger matches are
//! grown to the enclosing sentence or paragraph so the whole ad read is
//! captured. Overlapping or nearly adjacent spans merge into one, keeping
//! the highest confidence. A merged span that independently contains two or
//! more of {sponsor keyword, advertiser, tracking URL} is boosted; a span
//! matching a negative pattern is penalized.
//!
//! All offsets are byte offsets into the original text.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::json;
use tracing::debug;

use super::patterns::{self, PatternSet};
use super::{AdDetection, DetectionMethod, StripResult, Tier};
use crate::config::DetectorConfig;
use crate::models::ContentType;

const KEYWORD_CONFIDENCE: f64 = 0.85;
const ADVERTISER_CONFIDENCE: f64 = 0.80;
const URL_CONFIDENCE: f64 = 0.70;
const SECTION_CONFIDENCE: f64 = 0.90;

// Sentence end before a match: terminator plus the whitespace after it.
static BACK_BOUNDARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:\n[ \t\r]*\n|[.!?]+["')\]]*\s+)"#).expect("Invalid back boundary regex")
});

// Sentence end after a match. Trailing spaces are consumed, a newline is not.
static SENTENCE_END: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"[.!?]+["')\]]*(?:[ \t]+|\r?\n|$)"#).expect("Invalid sentence end regex")
});

static BLANK_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\r?\n[ \t\r]*\n").expect("Invalid blank line regex"));

static MULTI_NEWLINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("Invalid newline regex"));

/// A single detector's proposal before merging.
#[derive(Debug, Clone)]
struct Hit {
    start: usize,
    end: usize,
    method: DetectionMethod,
    confidence: f64,
    pattern: String,
    position: Option<&'static str>,
}

/// Union of overlapping hits.
#[derive(Debug)]
struct Span {
    start: usize,
    end: usize,
    confidence: f64,
    method: DetectionMethod,
    pattern: String,
    methods: BTreeSet<DetectionMethod>,
    patterns: Vec<String>,
    position: Option<&'static str>,
    hits: usize,
}

impl Span {
    fn from_hit(hit: Hit) -> Self {
        let mut methods = BTreeSet::new();
        methods.insert(hit.method);
        Self {
            start: hit.start,
            end: hit.end,
            confidence: hit.confidence,
            method: hit.method,
            pattern: hit.pattern.clone(),
            methods,
            patterns: vec![hit.pattern],
            position: hit.position,
            hits: 1,
        }
    }

    fn absorb(&mut self, hit: Hit) {
        self.end = self.end.max(hit.end);
        if hit.confidence > self.confidence {
            self.confidence = hit.confidence;
            self.method = hit.method;
            self.pattern = hit.pattern.clone();
        }
        self.methods.insert(hit.method);
        if !self.patterns.contains(&hit.pattern) {
            self.patterns.push(hit.pattern);
        }
        self.position = self.position.or(hit.position);
        self.hits += 1;
    }
}

/// Detects and strips ad segments. Construct once and share.
#[derive(Debug, Clone)]
pub struct AdDetector {
    config: DetectorConfig,
    patterns: PatternSet,
}

impl AdDetector {
    pub fn new(config: &DetectorConfig) -> Self {
        Self {
            config: config.clone(),
            patterns: PatternSet::from_config(config),
        }
    }

    /// Same detector with a different acceptance threshold.
    pub fn with_min_confidence(mut self, min_confidence: f64) -> Self {
        self.config.min_confidence = min_confidence.clamp(0.0, 1.0);
        self
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn tier(&self, detection: &AdDetection) -> Tier {
        Tier::classify(
            detection.confidence,
            self.config.auto_remove_threshold,
            self.config.review_threshold,
        )
    }

    /// Detections confident enough to remove without review.
    pub fn auto_remove<'a>(&self, detections: &'a [AdDetection]) -> Vec<&'a AdDetection> {
        detections
            .iter()
            .filter(|d| self.tier(d) == Tier::High)
            .collect()
    }

    /// Detections a human should look at.
    pub fn review_queue<'a>(&self, detections: &'a [AdDetection]) -> Vec<&'a AdDetection> {
        detections
            .iter()
            .filter(|d| self.tier(d) == Tier::Medium)
            .collect()
    }

    /// Find ad segments, sorted by offset and non-overlapping.
    pub fn detect(&self, text: &str, content_type: ContentType) -> Vec<AdDetection> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let mut hits = Vec::new();
        self.keyword_hits(text, &mut hits);
        self.advertiser_hits(text, &mut hits);
        self.url_hits(text, &mut hits);
        if content_type.has_sections() {
            self.section_hits(text, &mut hits);
        }
        if content_type.is_spoken() {
            self.apply_position(text.len(), &mut hits);
        }

        debug!(hits = hits.len(), %content_type, "raw ad hits");

        merge(hits, self.config.merge_gap)
            .into_iter()
            .filter_map(|span| self.score(text, span))
            .collect()
    }

    /// Remove every accepted detection. Offsets in the returned detections
    /// refer to `text`, not to the cleaned output.
    pub fn strip(&self, text: &str, content_type: ContentType) -> StripResult {
        let detections = self.detect(text, content_type);

        let mut cleaned = text.to_string();
        let mut chars_removed = 0usize;
        for d in detections.iter().rev() {
            chars_removed += d.char_len();
            cleaned.replace_range(d.start..d.end, "");
        }
        let cleaned_text = MULTI_NEWLINE.replace_all(&cleaned, "\n\n").trim().to_string();

        let total_chars = text.chars().count();
        let percent_removed = if total_chars == 0 {
            0.0
        } else {
            chars_removed as f64 / total_chars as f64 * 100.0
        };

        StripResult {
            cleaned_text,
            detections,
            chars_removed,
            percent_removed,
        }
    }

    fn keyword_hits(&self, text: &str, hits: &mut Vec<Hit>) {
        for p in &self.patterns.keywords {
            for m in p.regex.find_iter(text) {
                let (start, end) =
                    expand_to_boundaries(text, m.start(), m.end(), self.config.expand_window);
                hits.push(Hit {
                    start,
                    end,
                    method: DetectionMethod::Keyword,
                    confidence: KEYWORD_CONFIDENCE,
                    pattern: p.name.clone(),
                    position: None,
                });
            }
        }
    }

    /// Brand mentions only count with ad-context words nearby, so a brand
    /// used as an ordinary word never scores on its own.
    fn advertiser_hits(&self, text: &str, hits: &mut Vec<Hit>) {
        let radius = self.config.advertiser_context_window;
        for p in &self.patterns.advertisers {
            for m in p.regex.find_iter(text) {
                let lo = floor_boundary(text, m.start().saturating_sub(radius));
                let hi = floor_boundary(text, (m.end() + radius).min(text.len()));
                if !patterns::ad_context().is_match(&text[lo..hi]) {
                    continue;
                }
                let (start, end) =
                    expand_to_boundaries(text, m.start(), m.end(), self.config.expand_window);
                hits.push(Hit {
                    start,
                    end,
                    method: DetectionMethod::Advertiser,
                    confidence: ADVERTISER_CONFIDENCE,
                    pattern: p.name.clone(),
                    position: None,
                });
            }
        }
    }

    fn url_hits(&self, text: &str, hits: &mut Vec<Hit>) {
        for p in &self.patterns.urls {
            for m in p.regex.find_iter(text) {
                let (start, end) =
                    expand_to_boundaries(text, m.start(), m.end(), self.config.expand_window);
                hits.push(Hit {
                    start,
                    end,
                    method: DetectionMethod::UrlPattern,
                    confidence: URL_CONFIDENCE,
                    pattern: p.name.clone(),
                    position: None,
                });
            }
        }
    }

    /// A sponsor header claims everything up to the next header or rule.
    fn section_hits(&self, text: &str, hits: &mut Vec<Hit>) {
        for m in patterns::section_header().find_iter(text) {
            let body = &text[m.end()..];
            let mut end = match patterns::section_end().find(body) {
                Some(next) => m.end() + next.start(),
                None => text.len(),
            };
            end = end.min(floor_boundary(
                text,
                (m.start() + self.config.section_window).min(text.len()),
            ));
            if end <= m.start() {
                continue;
            }
            hits.push(Hit {
                start: m.start(),
                end,
                method: DetectionMethod::SectionHeader,
                confidence: SECTION_CONFIDENCE,
                pattern: "section_header".to_string(),
                position: None,
            });
        }
    }

    /// Ad reads cluster at the start, the middle, and the end of episodes.
    fn apply_position(&self, len: usize, hits: &mut [Hit]) {
        if len == 0 {
            return;
        }
        let len = len as f64;
        for hit in hits.iter_mut() {
            let start = hit.start as f64 / len;
            let end = hit.end as f64 / len;
            let (factor, label) = if start < 0.10 {
                (self.config.preroll_boost, "preroll")
            } else if (0.40..=0.60).contains(&start) {
                (self.config.midroll_boost, "midroll")
            } else if end >= 0.90 {
                (self.config.postroll_boost, "postroll")
            } else {
                continue;
            };
            hit.confidence = (hit.confidence * factor).min(1.0);
            hit.position = Some(label);
        }
    }

    /// Compound boost, negative penalty, then acceptance filters.
    fn score(&self, text: &str, span: Span) -> Option<AdDetection> {
        let slice = &text[span.start..span.end];
        let cfg = &self.config;

        let signals = [
            self.patterns.has_keyword(slice),
            self.patterns.has_advertiser(slice),
            self.patterns.has_tracking_url(slice),
        ]
        .iter()
        .filter(|s| **s)
        .count();

        let mut confidence = span.confidence;
        let compound = signals >= 2 && confidence < cfg.compound_cap;
        if compound {
            confidence = (confidence * cfg.compound_boost).min(cfg.compound_cap);
        }

        let negatives = self.patterns.negative_hits(slice);
        if !negatives.is_empty() {
            confidence *= cfg.false_positive_penalty;
        }
        let confidence = confidence.clamp(0.0, 1.0);

        // Two independent signals are enough evidence for a short read.
        let chars = slice.chars().count();
        let too_short = chars < cfg.min_segment_chars && signals < 2;
        if confidence < cfg.min_confidence || too_short || chars > cfg.max_segment_chars {
            debug!(
                start = span.start,
                end = span.end,
                confidence,
                chars,
                ?negatives,
                "dropping ad candidate"
            );
            return None;
        }

        let methods: Vec<&str> = span.methods.iter().map(|m| m.as_str()).collect();
        Some(AdDetection {
            start: span.start,
            end: span.end,
            text: slice.to_string(),
            method: span.method,
            confidence,
            matched_pattern: span.pattern,
            metadata: json!({
                "base_confidence": span.confidence,
                "methods": methods,
                "patterns": span.patterns,
                "merged_hits": span.hits,
                "signals": signals,
                "compound_boost": compound,
                "negative_patterns": negatives,
                "position": span.position,
            }),
        })
    }
}

/// Sort by start and fold hits that overlap or sit within `gap` bytes.
fn merge(mut hits: Vec<Hit>, gap: usize) -> Vec<Span> {
    hits.sort_by(|a, b| a.start.cmp(&b.start).then(b.end.cmp(&a.end)));

    let mut spans: Vec<Span> = Vec::new();
    for hit in hits {
        match spans.last_mut() {
            Some(current) if hit.start <= current.end + gap => current.absorb(hit),
            _ => spans.push(Span::from_hit(hit)),
        }
    }
    spans
}

/// Grow `[start, end)` back to the previous sentence or paragraph boundary
/// and forward to the next one, looking at most `window` bytes each way.
fn expand_to_boundaries(text: &str, start: usize, end: usize, window: usize) -> (usize, usize) {
    let lo = floor_boundary(text, start.saturating_sub(window));
    let back = &text[lo..start];
    let new_start = match BACK_BOUNDARY.find_iter(back).last() {
        Some(m) => lo + m.end(),
        None if lo == 0 => 0,
        // No boundary in reach: start at the first word inside the window.
        None => back
            .char_indices()
            .find(|(_, c)| c.is_whitespace())
            .map(|(i, c)| lo + i + c.len_utf8())
            .unwrap_or(start),
    };

    let hi = floor_boundary(text, (end + window).min(text.len()));
    let fwd = &text[end..hi];
    let sentence = SENTENCE_END.find(fwd).map(|m| {
        let mut stop = end + m.end();
        while stop > end && matches!(text.as_bytes()[stop - 1], b'\n' | b'\r') {
            stop -= 1;
        }
        stop
    });
    let paragraph = BLANK_LINE.find(fwd).map(|m| end + m.start());
    let new_end = match (sentence, paragraph) {
        (Some(s), Some(p)) => s.min(p),
        (Some(s), None) => s,
        (None, Some(p)) => p,
        (None, None) if hi == text.len() => hi,
        (None, None) => fwd
            .rfind(char::is_whitespace)
            .map(|i| end + i)
            .unwrap_or(hi),
    };

    (new_start.min(start), new_end.max(end))
}

/// Largest char boundary `<= idx`.
fn floor_boundary(text: &str, mut idx: usize) -> usize {
    idx = idx.min(text.len());
    while !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}
