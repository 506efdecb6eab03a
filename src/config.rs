//! TOML configuration.
//!
//! One [`Config`] is loaded at process start and passed by reference to the
//! ledger, detector, cleaner and coordinator. There is no global state.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Where derived artifacts live. Originals are never written.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_clean_dir")]
    pub clean_dir: PathBuf,
    #[serde(default = "default_changes_dir")]
    pub changes_dir: PathBuf,
    #[serde(default = "default_reports_dir")]
    pub reports_dir: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            clean_dir: default_clean_dir(),
            changes_dir: default_changes_dir(),
            reports_dir: default_reports_dir(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
        }
    }
}

fn default_clean_dir() -> PathBuf {
    PathBuf::from("./data/clean")
}
fn default_changes_dir() -> PathBuf {
    PathBuf::from("./data/changes")
}
fn default_reports_dir() -> PathBuf {
    PathBuf::from("./data/reports")
}
fn default_include_globs() -> Vec<String> {
    vec![
        "**/*.md".to_string(),
        "**/*.txt".to_string(),
        "**/*.html".to_string(),
    ]
}

/// Tunables for the ad detection engine.
///
/// The boost and penalty multipliers were chosen empirically and are
/// exposed here so they can be tuned without a code change.
#[derive(Debug, Deserialize, Clone)]
pub struct DetectorConfig {
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_min_segment_chars")]
    pub min_segment_chars: usize,
    #[serde(default = "default_max_segment_chars")]
    pub max_segment_chars: usize,
    /// How far a trigger match may grow toward sentence/paragraph boundaries.
    #[serde(default = "default_expand_window")]
    pub expand_window: usize,
    /// Radius searched for ad-context words around an advertiser mention.
    #[serde(default = "default_advertiser_context_window")]
    pub advertiser_context_window: usize,
    #[serde(default = "default_section_window")]
    pub section_window: usize,
    #[serde(default = "default_merge_gap")]
    pub merge_gap: usize,
    #[serde(default = "default_auto_remove_threshold")]
    pub auto_remove_threshold: f64,
    #[serde(default = "default_review_threshold")]
    pub review_threshold: f64,
    #[serde(default = "default_compound_boost")]
    pub compound_boost: f64,
    #[serde(default = "default_compound_cap")]
    pub compound_cap: f64,
    #[serde(default = "default_false_positive_penalty")]
    pub false_positive_penalty: f64,
    #[serde(default = "default_preroll_boost")]
    pub preroll_boost: f64,
    #[serde(default = "default_midroll_boost")]
    pub midroll_boost: f64,
    #[serde(default = "default_postroll_boost")]
    pub postroll_boost: f64,
    #[serde(default)]
    pub extra_keywords: Vec<String>,
    #[serde(default)]
    pub extra_advertisers: Vec<String>,
    #[serde(default)]
    pub extra_url_patterns: Vec<String>,
    #[serde(default)]
    pub extra_negative_patterns: Vec<String>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            min_segment_chars: default_min_segment_chars(),
            max_segment_chars: default_max_segment_chars(),
            expand_window: default_expand_window(),
            advertiser_context_window: default_advertiser_context_window(),
            section_window: default_section_window(),
            merge_gap: default_merge_gap(),
            auto_remove_threshold: default_auto_remove_threshold(),
            review_threshold: default_review_threshold(),
            compound_boost: default_compound_boost(),
            compound_cap: default_compound_cap(),
            false_positive_penalty: default_false_positive_penalty(),
            preroll_boost: default_preroll_boost(),
            midroll_boost: default_midroll_boost(),
            postroll_boost: default_postroll_boost(),
            extra_keywords: Vec::new(),
            extra_advertisers: Vec::new(),
            extra_url_patterns: Vec::new(),
            extra_negative_patterns: Vec::new(),
        }
    }
}

fn default_min_confidence() -> f64 {
    0.6
}
fn default_min_segment_chars() -> usize {
    50
}
fn default_max_segment_chars() -> usize {
    3000
}
fn default_expand_window() -> usize {
    500
}
fn default_advertiser_context_window() -> usize {
    200
}
fn default_section_window() -> usize {
    2000
}
fn default_merge_gap() -> usize {
    50
}
fn default_auto_remove_threshold() -> f64 {
    0.9
}
fn default_review_threshold() -> f64 {
    0.7
}
fn default_compound_boost() -> f64 {
    1.25
}
fn default_compound_cap() -> f64 {
    0.98
}
fn default_false_positive_penalty() -> f64 {
    0.4
}
fn default_preroll_boost() -> f64 {
    1.15
}
fn default_midroll_boost() -> f64 {
    1.10
}
fn default_postroll_boost() -> f64 {
    1.10
}

#[derive(Debug, Deserialize, Clone)]
pub struct LedgerConfig {
    /// Upper bound on rows returned by `recent_activity`.
    #[serde(default = "default_recent_limit")]
    pub recent_limit: i64,
    #[serde(default = "default_project")]
    pub default_project: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            recent_limit: default_recent_limit(),
            default_project: default_project(),
        }
    }
}

fn default_recent_limit() -> i64 {
    1000
}
fn default_project() -> String {
    "default".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_min_words")]
    pub min_words: usize,
    #[serde(default = "default_min_quality")]
    pub min_quality: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_words: default_min_words(),
            min_quality: default_min_quality(),
        }
    }
}

fn default_min_words() -> usize {
    20
}
fn default_min_quality() -> f64 {
    0.3
}

impl Config {
    /// Defaults rooted at `root`, used by tests and by commands that run
    /// without a config file.
    pub fn minimal(root: &Path) -> Self {
        let data = root.join("data");
        Self {
            db: DbConfig {
                path: data.join("atlas.sqlite"),
            },
            storage: StorageConfig {
                clean_dir: data.join("clean"),
                changes_dir: data.join("changes"),
                reports_dir: data.join("reports"),
                ..StorageConfig::default()
            },
            detector: DetectorConfig::default(),
            ledger: LedgerConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    let d = &config.detector;

    for (name, value) in [
        ("detector.min_confidence", d.min_confidence),
        ("detector.auto_remove_threshold", d.auto_remove_threshold),
        ("detector.review_threshold", d.review_threshold),
        ("detector.compound_cap", d.compound_cap),
        ("detector.false_positive_penalty", d.false_positive_penalty),
        ("pipeline.min_quality", config.pipeline.min_quality),
    ] {
        if !(0.0..=1.0).contains(&value) {
            anyhow::bail!("{} must be in [0.0, 1.0]", name);
        }
    }

    if d.review_threshold > d.auto_remove_threshold {
        anyhow::bail!("detector.review_threshold must be <= detector.auto_remove_threshold");
    }

    if d.min_segment_chars >= d.max_segment_chars {
        anyhow::bail!("detector.min_segment_chars must be < detector.max_segment_chars");
    }

    for (name, value) in [
        ("detector.compound_boost", d.compound_boost),
        ("detector.preroll_boost", d.preroll_boost),
        ("detector.midroll_boost", d.midroll_boost),
        ("detector.postroll_boost", d.postroll_boost),
    ] {
        if value < 1.0 {
            anyhow::bail!("{} must be >= 1.0", name);
        }
    }

    if config.ledger.recent_limit < 1 {
        anyhow::bail!("ledger.recent_limit must be >= 1");
    }

    Ok(())
}
