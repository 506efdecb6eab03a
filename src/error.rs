//! Error kinds callers need to tell apart.
//!
//! Most functions return `anyhow::Result`; the variants here are raised
//! through it and recovered with `downcast_ref` where the distinction
//! matters (a missing handler is a configuration bug, an unavailable source
//! is a content problem).

use std::path::PathBuf;

use thiserror::Error;

use crate::stage::Stage;

#[derive(Debug, Error)]
pub enum AtlasError {
    /// No phase handler claims the stage. Not retryable.
    #[error("no module found for stage {0}")]
    NoHandler(Stage),

    #[error("handler '{name}' stage range {start}-{end} overlaps handler '{existing}'")]
    OverlappingHandler {
        name: String,
        existing: String,
        start: u16,
        end: u16,
    },

    #[error("unknown stage code: {0}")]
    UnknownStage(i64),

    #[error("unknown content type: '{0}'. Must be podcast, youtube, article, newsletter, or unknown")]
    UnknownContentType(String),

    /// Source content is not (yet) present. Retryable.
    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("no removal record for content '{0}'")]
    RemovalRecordMissing(String),

    #[error("removal index {index} out of range for content '{content_id}' ({count} removals)")]
    RemovalIndexOutOfRange {
        content_id: String,
        index: usize,
        count: usize,
    },

    #[error("no review item for content '{content_id}' at removal index {index}")]
    ReviewItemMissing { content_id: String, index: usize },

    #[error("refusing to write clean copy over the original: {}", .0.display())]
    WouldOverwriteOriginal(PathBuf),
}
