//! Batch progress reporting.
//!
//! Reports progress during `atlas batch` and `atlas reclean` so users see
//! what is being scanned and how much is left. Progress goes to **stderr**
//! so stdout stays parseable for scripts.

use std::io::Write;

/// A single progress event for a batch run.
#[derive(Clone, Debug)]
pub enum BatchProgressEvent {
    /// Walking the input tree. Total unknown.
    Discovering { root: String },
    /// `n` of `total` files handled.
    Cleaning { n: u64, total: u64, path: String },
    /// Run finished.
    Done {
        processed: u64,
        skipped: u64,
        errors: u64,
    },
}

/// Implementations write to stderr (human or JSON).
pub trait BatchProgressReporter: Send + Sync {
    fn report(&self, event: BatchProgressEvent);
}

/// Human-friendly progress on stderr: "batch  cleaning  1,234 / 5,000 files".
pub struct StderrProgress;

impl BatchProgressReporter for StderrProgress {
    fn report(&self, event: BatchProgressEvent) {
        let line = match &event {
            BatchProgressEvent::Discovering { root } => {
                format!("batch {}  discovering...\n", root)
            }
            BatchProgressEvent::Cleaning { n, total, .. } => format!(
                "batch  cleaning  {} / {} files\n",
                format_number(*n),
                format_number(*total)
            ),
            BatchProgressEvent::Done {
                processed,
                skipped,
                errors,
            } => format!(
                "batch  done  {} cleaned, {} skipped, {} errors\n",
                format_number(*processed),
                format_number(*skipped),
                format_number(*errors)
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl JsonProgress {
    fn to_json(event: &BatchProgressEvent) -> serde_json::Value {
        match event {
            BatchProgressEvent::Discovering { root } => serde_json::json!({
                "event": "progress",
                "phase": "discovering",
                "root": root
            }),
            BatchProgressEvent::Cleaning { n, total, path } => serde_json::json!({
                "event": "progress",
                "phase": "cleaning",
                "n": n,
                "total": total,
                "path": path
            }),
            BatchProgressEvent::Done {
                processed,
                skipped,
                errors,
            } => serde_json::json!({
                "event": "done",
                "processed": processed,
                "skipped": skipped,
                "errors": errors
            }),
        }
    }
}

impl BatchProgressReporter for JsonProgress {
    fn report(&self, event: BatchProgressEvent) {
        if let Ok(line) = serde_json::to_string(&Self::to_json(&event)) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

pub struct NoProgress;

impl BatchProgressReporter for NoProgress {
    fn report(&self, _event: BatchProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    /// Human on a TTY, otherwise off.
    Auto,
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn BatchProgressReporter> {
        match self {
            ProgressMode::Auto => Self::default_for_tty().reporter(),
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
