//! Stage progression.
//!
//! The [`Coordinator`] looks up the phase handler owning a content item's
//! current stage, runs it, and appends the outcome to the [`Ledger`].
//!
//! ```text
//!  ledger.current_stage ──▶ HandlerRegistry::find ──▶ PhaseHandler::process
//!          ▲                                                  │
//!          └──────────── ledger.record(transition) ◀──────────┘
//! ```
//!
//! Handlers own disjoint, contiguous stage ranges. A handler never writes
//! to the ledger itself; it returns a [`HandlerOutcome`] and the coordinator
//! records it. Handler errors are recorded as failed transitions and never
//! escape `advance`; only ledger storage errors do.
//!
//! # Example
//!
//! ```rust
//! use anyhow::Result;
//! use async_trait::async_trait;
//! use atlas::coordinator::{HandlerOutcome, HandlerRegistry, PhaseHandler, StageContext};
//! use atlas::stage::{Phase, Stage};
//! use std::sync::Arc;
//!
//! struct Queue;
//!
//! #[async_trait]
//! impl PhaseHandler for Queue {
//!     fn name(&self) -> &str { "queue" }
//!     fn phase(&self) -> Phase { Phase::Acquisition }
//!
//!     async fn process(&self, _id: &str, _current: Stage, _ctx: &StageContext) -> Result<HandlerOutcome> {
//!         Ok(HandlerOutcome::advanced(Stage::CONTENT_QUEUED, "queued"))
//!     }
//! }
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register(Arc::new(Queue)).unwrap();
//! assert!(registry.find(Stage::CONTENT_RECEIVED).is_some());
//! ```

use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::error::AtlasError;
use crate::ledger::{Ledger, NewTransition};
use crate::stage::{Phase, Stage};

/// Action recorded when no handler claims a stage.
pub const NO_MODULE_FOUND: &str = "no module found";

// ═══════════════════════════════════════════════════════════════════════
// Context
// ═══════════════════════════════════════════════════════════════════════

/// Job-layer inputs for one `advance` call (source path, inline text,
/// quality score, archive flag, ...). Handlers read what they need.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StageContext {
    values: Map<String, Value>,
}

impl StageContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-object values yield an empty context.
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Object(values) => Self { values },
            _ => Self::default(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    pub fn f64(&self, key: &str) -> Option<f64> {
        self.values.get(key).and_then(Value::as_f64)
    }

    pub fn flag(&self, key: &str) -> bool {
        self.values
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Handler trait
// ═══════════════════════════════════════════════════════════════════════

/// What a handler decided for one content item.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    Advanced {
        next_stage: Stage,
        message: String,
        metadata: Value,
    },
    /// `error_stage` may equal the current stage.
    Failed {
        error_stage: Stage,
        error: String,
        metadata: Value,
    },
}

impl HandlerOutcome {
    pub fn advanced(next_stage: Stage, message: impl Into<String>) -> Self {
        HandlerOutcome::Advanced {
            next_stage,
            message: message.into(),
            metadata: json!({}),
        }
    }

    pub fn failed(error_stage: Stage, error: impl Into<String>) -> Self {
        HandlerOutcome::Failed {
            error_stage,
            error: error.into(),
            metadata: json!({}),
        }
    }

    pub fn with_metadata(self, value: Value) -> Self {
        match self {
            HandlerOutcome::Advanced {
                next_stage,
                message,
                ..
            } => HandlerOutcome::Advanced {
                next_stage,
                message,
                metadata: value,
            },
            HandlerOutcome::Failed {
                error_stage, error, ..
            } => HandlerOutcome::Failed {
                error_stage,
                error,
                metadata: value,
            },
        }
    }
}

/// Processes every stage in one contiguous range.
///
/// # Lifecycle
///
/// 1. Registered once via [`HandlerRegistry::register`], which rejects a
///    range overlapping an already-registered handler.
/// 2. [`process`](PhaseHandler::process) is called by
///    [`Coordinator::advance`] whenever an item sits inside the range.
/// 3. The returned outcome is recorded by the coordinator.
#[async_trait]
pub trait PhaseHandler: Send + Sync {
    /// Recorded in transition metadata as `handler`.
    fn name(&self) -> &str;

    fn phase(&self) -> Phase;

    /// Inclusive stage-code range. Defaults to the phase's band.
    fn stages(&self) -> RangeInclusive<u16> {
        self.phase().band()
    }

    /// An `Err` is recorded as a failed transition at `current`; it does
    /// not abort the caller.
    async fn process(
        &self,
        content_id: &str,
        current: Stage,
        ctx: &StageContext,
    ) -> Result<HandlerOutcome>;
}

/// Registered handlers, one per disjoint stage range.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn PhaseHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn PhaseHandler>) -> Result<(), AtlasError> {
        let range = handler.stages();
        if let Some(existing) = self.handlers.iter().find(|h| {
            let other = h.stages();
            range.start() <= other.end() && other.start() <= range.end()
        }) {
            return Err(AtlasError::OverlappingHandler {
                name: handler.name().to_string(),
                existing: existing.name().to_string(),
                start: *range.start(),
                end: *range.end(),
            });
        }
        self.handlers.push(handler);
        self.handlers.sort_by_key(|h| *h.stages().start());
        Ok(())
    }

    pub fn find(&self, stage: Stage) -> Option<&Arc<dyn PhaseHandler>> {
        let code = stage.code();
        self.handlers.iter().find(|h| h.stages().contains(&code))
    }

    /// `(name, range)` pairs in stage order.
    pub fn list(&self) -> Vec<(String, RangeInclusive<u16>)> {
        self.handlers
            .iter()
            .map(|h| (h.name().to_string(), h.stages()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Coordinator
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvanceStatus {
    Advanced,
    Failed,
    /// Already terminal. Nothing recorded.
    Terminal,
    /// Parked on a control code until an explicit retry. Nothing recorded.
    Held,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdvanceOutcome {
    pub content_id: String,
    pub from: Stage,
    pub to: Stage,
    pub status: AdvanceStatus,
    pub handler: Option<String>,
    pub message: String,
    /// Configuration problem (no handler). Retrying will not help.
    pub fatal: bool,
    pub transaction_id: Option<i64>,
    pub duration_ms: Option<i64>,
}

impl AdvanceOutcome {
    pub fn is_success(&self) -> bool {
        self.status == AdvanceStatus::Advanced
    }

    fn unchanged(content_id: &str, stage: Stage, status: AdvanceStatus, message: &str) -> Self {
        Self {
            content_id: content_id.to_string(),
            from: stage,
            to: stage,
            status,
            handler: None,
            message: message.to_string(),
            fatal: false,
            transaction_id: None,
            duration_ms: None,
        }
    }
}

pub struct Coordinator {
    ledger: Ledger,
    registry: HandlerRegistry,
    batch_id: Option<String>,
}

impl Coordinator {
    pub fn new(ledger: Ledger, registry: HandlerRegistry) -> Self {
        Self {
            ledger,
            registry,
            batch_id: None,
        }
    }

    /// Tag every transition written by this coordinator with `batch_id`.
    pub fn with_batch(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Run the handler owning `current` and record what it decided.
    pub async fn advance(
        &self,
        content_id: &str,
        current: Stage,
        ctx: &StageContext,
    ) -> Result<AdvanceOutcome> {
        if current.is_terminal() {
            return Ok(AdvanceOutcome::unchanged(
                content_id,
                current,
                AdvanceStatus::Terminal,
                "already terminal",
            ));
        }
        if current.is_control() {
            return Ok(AdvanceOutcome::unchanged(
                content_id,
                current,
                AdvanceStatus::Held,
                "held on control code; use retry to resume",
            ));
        }

        let Some(handler) = self.registry.find(current) else {
            let error = AtlasError::NoHandler(current);
            warn!(content_id, stage = current.code(), "{}", error);
            let t = self
                .transition(content_id, current, NO_MODULE_FOUND)
                .previous(current)
                .metadata(json!({ "error": error.to_string(), "fatal": true }))
                .failed();
            let id = self.ledger.record(&t).await?;
            return Ok(AdvanceOutcome {
                content_id: content_id.to_string(),
                from: current,
                to: current,
                status: AdvanceStatus::Failed,
                handler: None,
                message: NO_MODULE_FOUND.to_string(),
                fatal: true,
                transaction_id: Some(id),
                duration_ms: None,
            });
        };

        let name = handler.name().to_string();
        let started = Instant::now();
        let result = handler.process(content_id, current, ctx).await;
        let duration_ms = started.elapsed().as_millis() as i64;

        let (to, status, message, metadata) = match result {
            Ok(HandlerOutcome::Advanced {
                next_stage,
                message,
                metadata,
            }) => (next_stage, AdvanceStatus::Advanced, message, metadata),
            Ok(HandlerOutcome::Failed {
                error_stage,
                error,
                metadata,
            }) => (error_stage, AdvanceStatus::Failed, error, metadata),
            Err(e) => {
                let error = format!("{:#}", e);
                warn!(content_id, handler = %name, error = %error, "handler error");
                (
                    current,
                    AdvanceStatus::Failed,
                    error.clone(),
                    json!({ "error": error }),
                )
            }
        };

        let mut t = self
            .transition(content_id, to, &message)
            .previous(current)
            .duration_ms(duration_ms)
            .metadata(with_handler(metadata, &name));
        if status == AdvanceStatus::Failed {
            t = t.failed();
        }
        let id = self.ledger.record(&t).await?;

        info!(
            content_id,
            from = current.code(),
            to = to.code(),
            handler = %name,
            ok = status == AdvanceStatus::Advanced,
            "advance"
        );

        Ok(AdvanceOutcome {
            content_id: content_id.to_string(),
            from: current,
            to,
            status,
            handler: Some(name),
            message,
            fatal: false,
            transaction_id: Some(id),
            duration_ms: Some(duration_ms),
        })
    }

    /// [`advance`](Self::advance) from the ledger's current stage. Unseen
    /// items start at `ContentReceived`.
    pub async fn advance_current(&self, content_id: &str, ctx: &StageContext) -> Result<AdvanceOutcome> {
        let current = self
            .ledger
            .current_stage(content_id)
            .await?
            .unwrap_or(Stage::CONTENT_RECEIVED);
        self.advance(content_id, current, ctx).await
    }

    /// Advance repeatedly until the item is terminal, held, fails, or
    /// `max_steps` transitions have been attempted.
    pub async fn drive(
        &self,
        content_id: &str,
        ctx: &StageContext,
        max_steps: usize,
    ) -> Result<Vec<AdvanceOutcome>> {
        let mut steps = Vec::new();
        for _ in 0..max_steps {
            let outcome = self.advance_current(content_id, ctx).await?;
            let stop = !outcome.is_success() || outcome.to.is_terminal();
            steps.push(outcome);
            if stop {
                break;
            }
        }
        Ok(steps)
    }

    /// Put an item back at `resume_stage`. The one path allowed to move an
    /// item to a lower stage.
    pub async fn retry(&self, content_id: &str, resume_stage: Stage, reason: &str) -> Result<i64> {
        let current = self.ledger.current_stage(content_id).await?;
        let mut t = self
            .transition(content_id, resume_stage, &format!("retry: {}", reason))
            .metadata(json!({ "retry": true, "reason": reason }));
        if let Some(prev) = current {
            t = t.previous(prev);
        }
        let id = self.ledger.record(&t).await?;
        info!(content_id, to = resume_stage.code(), reason, "retry");
        Ok(id)
    }

    fn transition(&self, content_id: &str, stage: Stage, action: &str) -> NewTransition {
        let t = NewTransition::new(content_id, stage, action);
        match &self.batch_id {
            Some(b) => t.batch(b.clone()),
            None => t,
        }
    }
}

fn with_handler(metadata: Value, name: &str) -> Value {
    match metadata {
        Value::Object(mut map) => {
            map.insert("handler".to_string(), Value::String(name.to_string()));
            Value::Object(map)
        }
        Value::Null => json!({ "handler": name }),
        other => json!({ "handler": name, "data": other }),
    }
}
