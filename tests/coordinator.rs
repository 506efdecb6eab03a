use anyhow::{anyhow, Result};
use async_trait::async_trait;
use atlas::config::Config;
use atlas::coordinator::{
    AdvanceStatus, Coordinator, HandlerOutcome, HandlerRegistry, PhaseHandler, StageContext,
    NO_MODULE_FOUND,
};
use atlas::db;
use atlas::handlers::builtin_registry;
use atlas::ledger::{Ledger, NewTransition};
use atlas::migrate;
use atlas::stage::{Phase, Stage};
use atlas::versioned::VersionedCleaner;
use std::sync::Arc;
use tempfile::TempDir;

const ARTICLE: &str = "Archivists catalogue recordings from many sources so future listeners can find them quickly. \
Each item receives a stable identifier and careful notes about provenance. \
Cleaning removes sponsor reads while leaving the conversation itself untouched for reference.";

struct Harness {
    _tmp: TempDir,
    ledger: Ledger,
    cleaner: VersionedCleaner,
    config: Config,
}

async fn harness() -> Harness {
    let tmp = TempDir::new().unwrap();
    let config = Config::minimal(tmp.path());
    let pool = db::connect(&config).await.unwrap();
    migrate::apply_schema(&pool).await.unwrap();
    Harness {
        ledger: Ledger::new(pool.clone(), &config.ledger),
        cleaner: VersionedCleaner::new(pool, &config),
        config,
        _tmp: tmp,
    }
}

impl Harness {
    fn builtin(&self) -> Coordinator {
        let registry = builtin_registry(&self.ledger, &self.cleaner, &self.config.pipeline).unwrap();
        Coordinator::new(self.ledger.clone(), registry)
    }
}

struct Exploding;

#[async_trait]
impl PhaseHandler for Exploding {
    fn name(&self) -> &str {
        "exploding"
    }

    fn phase(&self) -> Phase {
        Phase::Validation
    }

    async fn process(&self, _: &str, _: Stage, _: &StageContext) -> Result<HandlerOutcome> {
        Err(anyhow!("disk on fire"))
    }
}

#[tokio::test]
async fn received_item_moves_to_queued() {
    let h = harness().await;
    let coordinator = h.builtin();

    let out = coordinator
        .advance("X", Stage::CONTENT_RECEIVED, &StageContext::new())
        .await
        .unwrap();
    assert_eq!(out.status, AdvanceStatus::Advanced);
    assert_eq!(out.to, Stage::CONTENT_QUEUED);
    assert_eq!(out.handler.as_deref(), Some("acquisition"));

    let history = h.ledger.history("X").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].stage, Stage::CONTENT_QUEUED);
    assert_eq!(history[0].previous_stage, Some(Stage::CONTENT_RECEIVED));
    assert!(history[0].success);
    assert_eq!(history[0].metadata["handler"], "acquisition");
}

#[tokio::test]
async fn terminal_and_held_items_are_not_touched() {
    let h = harness().await;
    let coordinator = h.builtin();
    let ctx = StageContext::new();

    let out = coordinator.advance("done", Stage::COMPLETED, &ctx).await.unwrap();
    assert_eq!(out.status, AdvanceStatus::Terminal);
    assert_eq!(out.transaction_id, None);

    h.ledger
        .record(&NewTransition::new("throttled", Stage::RATE_LIMITED, "429"))
        .await
        .unwrap();
    let out = coordinator.advance_current("throttled", &ctx).await.unwrap();
    assert_eq!(out.status, AdvanceStatus::Held);

    assert!(h.ledger.history("done").await.unwrap().is_empty());
    assert_eq!(h.ledger.history("throttled").await.unwrap().len(), 1);
}

#[tokio::test]
async fn missing_handler_is_recorded_as_fatal() {
    let h = harness().await;
    let coordinator = Coordinator::new(h.ledger.clone(), HandlerRegistry::new());

    let out = coordinator
        .advance("orphan", Stage::VALIDATION_STARTED, &StageContext::new())
        .await
        .unwrap();
    assert_eq!(out.status, AdvanceStatus::Failed);
    assert!(out.fatal);
    assert_eq!(out.message, NO_MODULE_FOUND);

    let history = h.ledger.history("orphan").await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(!history[0].success);
    assert_eq!(history[0].action, NO_MODULE_FOUND);
    assert_eq!(history[0].metadata["fatal"], true);
}

#[tokio::test]
async fn handler_error_becomes_failed_transition() {
    let h = harness().await;
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(Exploding)).unwrap();
    let coordinator = Coordinator::new(h.ledger.clone(), registry);

    let out = coordinator
        .advance("boom", Stage::VALIDATION_STARTED, &StageContext::new())
        .await
        .unwrap();
    assert_eq!(out.status, AdvanceStatus::Failed);
    assert_eq!(out.to, Stage::VALIDATION_STARTED);
    assert!(!out.fatal);

    let history = h.ledger.history("boom").await.unwrap();
    assert!(!history[0].success);
    assert!(history[0].action.contains("disk on fire"));
}

#[tokio::test]
async fn overlapping_handlers_are_rejected() {
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(Exploding)).unwrap();
    assert!(registry.register(Arc::new(Exploding)).is_err());
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn drive_runs_inline_text_to_completion() {
    let h = harness().await;
    let coordinator = h.builtin().with_batch("batch-1");
    let ctx = StageContext::new().with("text", ARTICLE);

    let steps = coordinator.drive("article-1", &ctx, 20).await.unwrap();
    assert!(steps.iter().all(|s| s.is_success()), "{:?}", steps);
    assert_eq!(steps.last().unwrap().to, Stage::COMPLETED);

    let visited: Vec<Stage> = steps.iter().map(|s| s.to).collect();
    for stage in [
        Stage::ACQUIRED,
        Stage::VALIDATED,
        Stage::PROCESSED,
        Stage::ENHANCED,
        Stage::INDEXED,
    ] {
        assert!(visited.contains(&stage), "never reached {}", stage);
    }

    let history = h.ledger.history("article-1").await.unwrap();
    assert_eq!(history.len(), steps.len());
    assert!(history.iter().all(|t| t.batch_id.as_deref() == Some("batch-1")));
    assert_eq!(
        h.ledger.current_stage("article-1").await.unwrap(),
        Some(Stage::COMPLETED)
    );

    // Further driving is a no-op.
    let again = coordinator.drive("article-1", &ctx, 5).await.unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].status, AdvanceStatus::Terminal);
}

#[tokio::test]
async fn archive_flag_ends_in_archived() {
    let h = harness().await;
    let ctx = StageContext::new()
        .with("text", ARTICLE)
        .with("archive", true);
    let steps = h.builtin().drive("article-2", &ctx, 20).await.unwrap();
    assert_eq!(steps.last().unwrap().to, Stage::ARCHIVED);
}

#[tokio::test]
async fn identical_content_is_marked_duplicate() {
    let h = harness().await;
    let coordinator = h.builtin();
    let ctx = StageContext::new().with("text", ARTICLE);

    coordinator.drive("first", &ctx, 20).await.unwrap();
    let steps = coordinator.drive("second", &ctx, 20).await.unwrap();

    let last = steps.last().unwrap();
    assert_eq!(last.to, Stage::DUPLICATE);
    assert!(last.message.contains("first"));
    assert_eq!(
        h.ledger.current_stage("second").await.unwrap(),
        Some(Stage::DUPLICATE)
    );
}

#[tokio::test]
async fn short_content_fails_validation_and_can_be_retried() {
    let h = harness().await;
    let coordinator = h.builtin();

    let short = StageContext::new().with("text", "far too short");
    let steps = coordinator.drive("stub", &short, 20).await.unwrap();
    let last = steps.last().unwrap();
    assert_eq!(last.status, AdvanceStatus::Failed);
    assert_eq!(last.to, Stage::VALIDATION_FAILED);

    coordinator
        .retry("stub", Stage::CONTENT_QUEUED, "source replaced")
        .await
        .unwrap();
    let history = h.ledger.history("stub").await.unwrap();
    let retry = history.last().unwrap();
    assert_eq!(retry.stage, Stage::CONTENT_QUEUED);
    assert_eq!(retry.previous_stage, Some(Stage::VALIDATION_FAILED));
    assert_eq!(retry.metadata["retry"], true);

    let full = StageContext::new().with("text", ARTICLE);
    let steps = coordinator.drive("stub", &full, 20).await.unwrap();
    assert_eq!(steps.last().unwrap().to, Stage::COMPLETED);
}

#[tokio::test]
async fn low_quality_fails_enhancement() {
    let h = harness().await;
    let coordinator = h.builtin();
    let ctx = StageContext::new()
        .with("text", ARTICLE)
        .with("quality_score", 0.1);

    let steps = coordinator.drive("meh", &ctx, 20).await.unwrap();
    let last = steps.last().unwrap();
    assert_eq!(last.to, Stage::ENHANCEMENT_FAILED);
    assert_eq!(last.message, "quality too low");
}
