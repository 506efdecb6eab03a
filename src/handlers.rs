//! Built-in phase handlers.
//!
//! | Handler | Stages | Flow |
//! |---------|--------|------|
//! | `acquisition` | 100–199 | received → queued → acquired → validation |
//! | `validation` | 200–299 | word count, content hash, duplicate check |
//! | `processing` | 300–399 | versioned clean of the source file |
//! | `enhancement` | 400–499 | quality gate |
//! | `finalization` | 500–589 | indexed → completed / archived |
//!
//! Context keys read: `source_path`, `text`, `content_type`, `force`,
//! `quality_score`, `archive`.

use std::ops::RangeInclusive;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::json;

use crate::clean::ContentCleaner;
use crate::coordinator::{HandlerOutcome, HandlerRegistry, PhaseHandler, StageContext};
use crate::config::PipelineConfig;
use crate::error::AtlasError;
use crate::ledger::Ledger;
use crate::models::ContentType;
use crate::stage::{
    AcquisitionStage, EnhancementStage, FinalizationStage, Phase, ProcessingStage, Stage,
    ValidationStage,
};
use crate::versioned::{sha256_hex, VersionedCleaner};

/// Registry with all five built-in handlers.
pub fn builtin_registry(
    ledger: &Ledger,
    cleaner: &VersionedCleaner,
    pipeline: &PipelineConfig,
) -> Result<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(AcquisitionHandler))?;
    registry.register(Arc::new(ValidationHandler {
        ledger: ledger.clone(),
        min_words: pipeline.min_words,
    }))?;
    registry.register(Arc::new(ProcessingHandler {
        cleaner: cleaner.clone(),
    }))?;
    registry.register(Arc::new(EnhancementHandler {
        ledger: ledger.clone(),
        min_quality: pipeline.min_quality,
    }))?;
    registry.register(Arc::new(FinalizationHandler))?;
    Ok(registry)
}

/// Inline `text` wins over `source_path`.
fn source_text(ctx: &StageContext) -> Result<String, AtlasError> {
    if let Some(text) = ctx.str("text") {
        if !text.trim().is_empty() {
            return Ok(text.to_string());
        }
    }
    match ctx.str("source_path") {
        Some(path) => std::fs::read_to_string(path)
            .map_err(|e| AtlasError::Unavailable(format!("{}: {}", path, e))),
        None => Err(AtlasError::Unavailable(
            "no source_path or text in context".to_string(),
        )),
    }
}

fn unexpected(handler: &str, stage: Stage) -> anyhow::Error {
    anyhow!("{} handler has no transition for stage {}", handler, stage)
}

pub struct AcquisitionHandler;

#[async_trait]
impl PhaseHandler for AcquisitionHandler {
    fn name(&self) -> &str {
        "acquisition"
    }

    fn phase(&self) -> Phase {
        Phase::Acquisition
    }

    async fn process(
        &self,
        _content_id: &str,
        current: Stage,
        ctx: &StageContext,
    ) -> Result<HandlerOutcome> {
        let Stage::Acquisition(stage) = current else {
            return Err(unexpected(self.name(), current));
        };
        Ok(match stage {
            AcquisitionStage::ContentReceived => {
                HandlerOutcome::advanced(Stage::CONTENT_QUEUED, "content queued")
            }
            AcquisitionStage::ContentQueued
            | AcquisitionStage::FetchStarted
            | AcquisitionStage::AcquisitionFailed => match source_text(ctx) {
                Ok(text) => HandlerOutcome::advanced(Stage::ACQUIRED, "content acquired")
                    .with_metadata(json!({ "bytes": text.len() })),
                Err(e) => HandlerOutcome::failed(Stage::ACQUISITION_FAILED, e.to_string()),
            },
            AcquisitionStage::Acquired => {
                HandlerOutcome::advanced(Stage::VALIDATION_STARTED, "validation started")
            }
        })
    }
}

pub struct ValidationHandler {
    ledger: Ledger,
    min_words: usize,
}

#[async_trait]
impl PhaseHandler for ValidationHandler {
    fn name(&self) -> &str {
        "validation"
    }

    fn phase(&self) -> Phase {
        Phase::Validation
    }

    async fn process(
        &self,
        content_id: &str,
        current: Stage,
        ctx: &StageContext,
    ) -> Result<HandlerOutcome> {
        let Stage::Validation(stage) = current else {
            return Err(unexpected(self.name(), current));
        };
        if stage == ValidationStage::Validated {
            return Ok(HandlerOutcome::advanced(
                Stage::PROCESSING_STARTED,
                "processing started",
            ));
        }

        let text = match source_text(ctx) {
            Ok(t) => t,
            Err(e) => return Ok(HandlerOutcome::failed(Stage::VALIDATION_FAILED, e.to_string())),
        };
        let words = text.split_whitespace().count();
        if words < self.min_words {
            return Ok(HandlerOutcome::failed(
                Stage::VALIDATION_FAILED,
                format!("too short: {} words (minimum {})", words, self.min_words),
            )
            .with_metadata(json!({ "word_count": words })));
        }

        let content_hash = sha256_hex(text.as_bytes());
        if let Some(original) = self
            .ledger
            .terminal_holder_of_hash(&content_hash, content_id)
            .await?
        {
            return Ok(HandlerOutcome::advanced(
                Stage::DUPLICATE,
                format!("duplicate of {}", original),
            )
            .with_metadata(json!({ "content_hash": content_hash, "duplicate_of": original })));
        }

        Ok(HandlerOutcome::advanced(Stage::VALIDATED, "validated")
            .with_metadata(json!({ "content_hash": content_hash, "word_count": words })))
    }
}

pub struct ProcessingHandler {
    cleaner: VersionedCleaner,
}

impl ProcessingHandler {
    /// No file to version: clean in memory and report the metrics only.
    fn clean_inline(cleaner: &ContentCleaner, text: &str, content_type: ContentType) -> HandlerOutcome {
        let result = cleaner.clean(text, content_type);
        HandlerOutcome::advanced(
            Stage::PROCESSED,
            format!("cleaned inline: {} ads removed", result.ads_removed),
        )
        .with_metadata(json!({
            "ads_removed": result.ads_removed,
            "chars_removed": result.chars_removed,
            "quality_score": result.quality_score,
        }))
    }
}

#[async_trait]
impl PhaseHandler for ProcessingHandler {
    fn name(&self) -> &str {
        "processing"
    }

    fn phase(&self) -> Phase {
        Phase::Processing
    }

    async fn process(
        &self,
        _content_id: &str,
        current: Stage,
        ctx: &StageContext,
    ) -> Result<HandlerOutcome> {
        let Stage::Processing(stage) = current else {
            return Err(unexpected(self.name(), current));
        };
        if stage == ProcessingStage::Processed {
            return Ok(HandlerOutcome::advanced(
                Stage::ENHANCEMENT_STARTED,
                "enhancement started",
            ));
        }

        let content_type = match ctx.str("content_type") {
            Some(s) => s.parse::<ContentType>()?,
            None => ContentType::Unknown,
        };

        let Some(path) = ctx.str("source_path") else {
            return Ok(match ctx.str("text") {
                Some(text) => Self::clean_inline(self.cleaner.cleaner(), text, content_type),
                None => HandlerOutcome::failed(
                    Stage::PROCESSING_FAILED,
                    AtlasError::Unavailable("no source_path in context".to_string()).to_string(),
                ),
            });
        };

        let path = Path::new(path);
        match self.cleaner.clean_file(path, content_type, ctx.flag("force")).await {
            Ok(Some(record)) => Ok(HandlerOutcome::advanced(
                Stage::PROCESSED,
                format!("cleaned: {} ads removed", record.ads_removed),
            )
            .with_metadata(json!({
                "clean_path": record.clean_path,
                "cleaning_id": record.content_id,
                "ads_removed": record.ads_removed,
                "chars_removed": record.chars_removed,
                "quality_score": record.quality_score,
            }))),
            Ok(None) => {
                let existing = self.cleaner.get_by_original(path).await?;
                Ok(HandlerOutcome::advanced(Stage::PROCESSED, "already clean").with_metadata(
                    json!({
                        "unchanged": true,
                        "clean_path": existing.as_ref().map(|r| r.clean_path.clone()),
                        "quality_score": existing.as_ref().map(|r| r.quality_score),
                    }),
                ))
            }
            Err(e) => Ok(HandlerOutcome::failed(
                Stage::PROCESSING_FAILED,
                format!("{:#}", e),
            )),
        }
    }
}

pub struct EnhancementHandler {
    ledger: Ledger,
    min_quality: f64,
}

#[async_trait]
impl PhaseHandler for EnhancementHandler {
    fn name(&self) -> &str {
        "enhancement"
    }

    fn phase(&self) -> Phase {
        Phase::Enhancement
    }

    async fn process(
        &self,
        content_id: &str,
        current: Stage,
        ctx: &StageContext,
    ) -> Result<HandlerOutcome> {
        let Stage::Enhancement(stage) = current else {
            return Err(unexpected(self.name(), current));
        };
        if stage == EnhancementStage::Enhanced {
            return Ok(HandlerOutcome::advanced(
                Stage::FINALIZATION_STARTED,
                "finalization started",
            ));
        }

        let quality = match ctx.f64("quality_score") {
            Some(q) => Some(q),
            None => self
                .ledger
                .latest_metadata_value(content_id, "quality_score")
                .await?
                .and_then(|v| v.as_f64()),
        };
        let Some(quality) = quality else {
            return Ok(HandlerOutcome::failed(
                Stage::ENHANCEMENT_FAILED,
                "no quality score available",
            ));
        };

        let metadata = json!({ "quality_score": quality, "min_quality": self.min_quality });
        if quality < self.min_quality {
            return Ok(
                HandlerOutcome::failed(Stage::ENHANCEMENT_FAILED, "quality too low")
                    .with_metadata(metadata),
            );
        }
        Ok(HandlerOutcome::advanced(Stage::ENHANCED, "enhanced").with_metadata(metadata))
    }
}

pub struct FinalizationHandler;

#[async_trait]
impl PhaseHandler for FinalizationHandler {
    fn name(&self) -> &str {
        "finalization"
    }

    fn phase(&self) -> Phase {
        Phase::Finalization
    }

    /// Terminal stages 590–599 have no handler.
    fn stages(&self) -> RangeInclusive<u16> {
        500..=589
    }

    async fn process(
        &self,
        _content_id: &str,
        current: Stage,
        ctx: &StageContext,
    ) -> Result<HandlerOutcome> {
        match current {
            Stage::Finalization(FinalizationStage::FinalizationStarted) => {
                Ok(HandlerOutcome::advanced(Stage::INDEXED, "indexed"))
            }
            Stage::Finalization(FinalizationStage::Indexed) if ctx.flag("archive") => {
                Ok(HandlerOutcome::advanced(Stage::ARCHIVED, "archived"))
            }
            Stage::Finalization(FinalizationStage::Indexed) => {
                Ok(HandlerOutcome::advanced(Stage::COMPLETED, "completed"))
            }
            other => Err(unexpected(self.name(), other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquisition_requires_a_source() {
        let h = AcquisitionHandler;
        let empty = StageContext::new();
        let out = h.process("c", Stage::CONTENT_QUEUED, &empty).await.unwrap();
        assert!(matches!(
            out,
            HandlerOutcome::Failed { error_stage, .. } if error_stage == Stage::ACQUISITION_FAILED
        ));

        let ctx = StageContext::new().with("text", "hello there");
        let out = h.process("c", Stage::CONTENT_QUEUED, &ctx).await.unwrap();
        assert!(matches!(
            out,
            HandlerOutcome::Advanced { next_stage, .. } if next_stage == Stage::ACQUIRED
        ));
    }

    #[tokio::test]
    async fn finalization_honours_archive_flag() {
        let h = FinalizationHandler;
        let archive = StageContext::new().with("archive", true);
        let out = h.process("c", Stage::INDEXED, &archive).await.unwrap();
        assert_eq!(out, HandlerOutcome::advanced(Stage::ARCHIVED, "archived"));
        let out = h.process("c", Stage::INDEXED, &StageContext::new()).await.unwrap();
        assert_eq!(out, HandlerOutcome::advanced(Stage::COMPLETED, "completed"));
        assert!(!h.stages().contains(&Stage::COMPLETED.code()));
    }

    #[test]
    fn inline_text_wins_over_path() {
        let ctx = StageContext::new()
            .with("text", "inline body")
            .with("source_path", "/definitely/missing");
        assert_eq!(source_text(&ctx).unwrap(), "inline body");
        let ctx = StageContext::new().with("source_path", "/definitely/missing");
        assert!(matches!(source_text(&ctx), Err(AtlasError::Unavailable(_))));
    }
}
