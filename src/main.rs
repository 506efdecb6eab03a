//! # Atlas CLI (`atlas`)
//!
//! The `atlas` binary exposes the archive core for manual inspection and
//! batch jobs: ad scanning and cleaning, the review queue, weekly reports,
//! and the stage ledger.
//!
//! ## Usage
//!
//! ```bash
//! atlas --config ./config/atlas.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `atlas init` | Create the SQLite database and tables |
//! | `atlas scan <file>` | Print ad detections without writing anything |
//! | `atlas clean <file>` | Versioned clean of one file |
//! | `atlas batch <dir>` | Versioned clean of every matching file in a tree |
//! | `atlas reclean` | Re-clean flagged, changed, or advertiser-affected content |
//! | `atlas stats` | Cleaning, review, and ledger statistics |
//! | `atlas queue` | List review items |
//! | `atlas mark-fp <id> <index>` | Record a false positive |
//! | `atlas confirm <id> <index>` | Confirm a removal |
//! | `atlas report` | Write the weekly markdown report |
//! | `atlas ledger ...` | Stage history, metrics, distribution, retention |
//! | `atlas advance <id>` | Advance a content item through the pipeline |
//!
//! ## Examples
//!
//! ```bash
//! atlas init
//! atlas scan episode.txt --type podcast
//! atlas batch ./archive/podcasts --type podcast --dry-run
//! atlas reclean --advertiser notion --advertiser slack
//! atlas advance podcast-42 --source ./archive/ep42.txt --type podcast --drive
//! ```

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use atlas::ads::{AdDetector, Tier};
use atlas::clean::ContentCleaner;
use atlas::config::{self, Config};
use atlas::coordinator::{Coordinator, StageContext};
use atlas::db;
use atlas::handlers;
use atlas::ledger::Ledger;
use atlas::migrate;
use atlas::models::{ContentType, ReviewStatus};
use atlas::progress::ProgressMode;
use atlas::review::ReviewQueue;
use atlas::stage::Stage;
use atlas::stats;
use atlas::versioned::{BatchSummary, VersionedCleaner};

/// Atlas: content archive core with stage tracking and ad stripping.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/atlas.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "atlas",
    about = "Atlas: content archive core with stage tracking and ad stripping",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/atlas.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and tables. Idempotent.
    Init,

    /// Detect ads in a file and print them. Writes nothing.
    ///
    /// Runs without a config file, using defaults.
    Scan {
        file: PathBuf,

        #[arg(long = "type", value_enum, default_value = "unknown")]
        content_type: ContentType,

        /// Override the minimum confidence for a detection to be kept.
        #[arg(long)]
        confidence: Option<f64>,

        #[arg(long)]
        json: bool,
    },

    /// Clean one file into the clean tree. The original is never modified.
    Clean {
        file: PathBuf,

        #[arg(long = "type", value_enum, default_value = "unknown")]
        content_type: ContentType,

        /// Re-clean even if the original is unchanged.
        #[arg(long)]
        force: bool,

        /// Show what would be removed without writing anything.
        #[arg(long)]
        dry_run: bool,

        #[arg(long)]
        confidence: Option<f64>,

        #[arg(long)]
        json: bool,
    },

    /// Clean every matching file under a directory.
    ///
    /// Per-file failures are counted and the batch continues.
    Batch {
        dir: PathBuf,

        #[arg(long = "type", value_enum, default_value = "unknown")]
        content_type: ContentType,

        #[arg(long)]
        force: bool,

        #[arg(long)]
        dry_run: bool,

        #[arg(long)]
        confidence: Option<f64>,

        #[arg(long)]
        json: bool,

        /// Progress on stderr. `auto` shows it only on a terminal.
        #[arg(long, value_enum, default_value = "auto")]
        progress: ProgressMode,
    },

    /// Re-clean content from its untouched originals.
    ///
    /// With no selector, re-cleans records flagged `needs_reclean`.
    Reclean {
        /// Re-clean content whose removals mention this advertiser (repeatable).
        #[arg(long = "advertiser")]
        advertisers: Vec<String>,

        /// Re-clean specific content ids (repeatable).
        #[arg(long = "id")]
        ids: Vec<String>,

        /// Flag records whose original changed on disk first.
        #[arg(long)]
        changed: bool,

        /// Flag every record (of `--type`, if given) first.
        #[arg(long)]
        all: bool,

        #[arg(long = "type", value_enum)]
        content_type: Option<ContentType>,

        /// List what would be re-cleaned without doing it.
        #[arg(long)]
        dry_run: bool,

        #[arg(long)]
        json: bool,

        #[arg(long, value_enum, default_value = "auto")]
        progress: ProgressMode,
    },

    /// Show cleaning, review, and ledger statistics.
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// List review items.
    Queue {
        #[arg(long, value_enum, default_value = "pending")]
        status: ReviewStatus,

        #[arg(long, default_value_t = 50)]
        limit: i64,

        #[arg(long)]
        json: bool,
    },

    /// Mark a removal as a false positive.
    #[command(name = "mark-fp")]
    MarkFp {
        content_id: String,
        index: usize,

        #[arg(long)]
        reason: String,
    },

    /// Confirm a queued removal was an ad.
    Confirm {
        content_id: String,
        index: usize,

        #[arg(long)]
        notes: Option<String>,
    },

    /// Write the weekly markdown report.
    Report {
        #[arg(long, default_value_t = 7)]
        days: i64,

        /// Print to stdout instead of writing to the reports directory.
        #[arg(long)]
        stdout: bool,
    },

    /// Inspect and maintain the stage ledger.
    Ledger {
        #[command(subcommand)]
        action: LedgerAction,
    },

    /// Advance a content item from its current stage.
    Advance {
        content_id: String,

        /// Treat the item as being at this stage (code or label) instead of
        /// reading it from the ledger.
        #[arg(long)]
        stage: Option<Stage>,

        /// Keep advancing until terminal, held, or failed.
        #[arg(long)]
        drive: bool,

        #[arg(long, default_value_t = 20)]
        max_steps: usize,

        /// Original file for acquisition, validation, and processing.
        #[arg(long)]
        source: Option<PathBuf>,

        /// Inline text, used instead of reading `--source`.
        #[arg(long)]
        text: Option<String>,

        #[arg(long = "type", value_enum, default_value = "unknown")]
        content_type: ContentType,

        /// Quality score for the enhancement gate.
        #[arg(long)]
        quality: Option<f64>,

        /// Archive instead of complete at finalization.
        #[arg(long)]
        archive: bool,

        #[arg(long)]
        force: bool,

        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum LedgerAction {
    /// Full transition history of an item.
    History {
        content_id: String,
        #[arg(long)]
        json: bool,
    },
    /// Current stage of an item.
    Status { content_id: String },
    /// Step counts, success rate, and durations of an item.
    Metrics {
        content_id: String,
        #[arg(long)]
        json: bool,
    },
    /// Number of items currently at each stage.
    Distribution {
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Recent transitions, newest first.
    Recent {
        #[arg(long, default_value_t = 60)]
        minutes: i64,
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Put an item back at an earlier stage.
    Retry {
        content_id: String,
        stage: Stage,
        #[arg(long)]
        reason: String,
    },
    /// Delete transitions older than `days`.
    Purge {
        #[arg(long)]
        days: i64,
    },
}

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("atlas=info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn detector_for(cfg: &Config, confidence: Option<f64>) -> AdDetector {
    let detector = AdDetector::new(&cfg.detector);
    match confidence {
        Some(c) => detector.with_min_confidence(c),
        None => detector,
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_summary(label: &str, summary: &BatchSummary, json: bool) -> Result<()> {
    if json {
        return print_json(summary);
    }
    println!(
        "{}: {} cleaned, {} skipped, {} errors ({} ads, {} chars removed)",
        label,
        summary.processed,
        summary.skipped,
        summary.errors,
        summary.ads_removed,
        summary.chars_removed
    );
    Ok(())
}

fn read_text(path: &Path) -> Result<String> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    // Scan is read-only and works without a config file.
    if let Commands::Scan {
        file,
        content_type,
        confidence,
        json,
    } = &cli.command
    {
        let cfg = if cli.config.exists() {
            config::load_config(&cli.config)?
        } else {
            Config::minimal(Path::new("."))
        };
        return run_scan(&cfg, file, *content_type, *confidence, *json);
    }

    let cfg = config::load_config(&cli.config)?;

    if let Commands::Init = cli.command {
        migrate::run_migrations(&cfg).await?;
        println!("Database initialized successfully.");
        return Ok(());
    }

    let pool = db::connect(&cfg).await?;
    migrate::apply_schema(&pool).await?;
    let versioned = VersionedCleaner::new(pool.clone(), &cfg);
    let review = ReviewQueue::new(pool.clone(), cfg.storage.changes_dir.clone());
    let ledger = Ledger::new(pool.clone(), &cfg.ledger);

    match cli.command {
        Commands::Init | Commands::Scan { .. } => {}
        Commands::Clean {
            file,
            content_type,
            force,
            dry_run,
            confidence,
            json,
        } => {
            if dry_run {
                run_scan(&cfg, &file, content_type, confidence, json)?;
            } else {
                let cleaner = versioned
                    .clone()
                    .with_cleaner(ContentCleaner::with_detector(detector_for(&cfg, confidence)));
                match cleaner.clean_file(&file, content_type, force).await? {
                    Some(record) if json => print_json(&record)?,
                    Some(record) => {
                        println!("Cleaned {} -> {}", record.original_path, record.clean_path);
                        println!(
                            "  content_id: {}  ads: {}  chars: {} ({:.1}%)  quality: {:.2}",
                            record.content_id,
                            record.ads_removed,
                            record.chars_removed,
                            record.percent_removed,
                            record.quality_score
                        );
                    }
                    None if json => print_json(&json!({ "skipped": true }))?,
                    None => println!("Unchanged since last clean; use --force to re-clean."),
                }
            }
        }
        Commands::Batch {
            dir,
            content_type,
            force,
            dry_run,
            confidence,
            json,
            progress,
        } => {
            let cleaner = versioned
                .clone()
                .with_cleaner(ContentCleaner::with_detector(detector_for(&cfg, confidence)));
            let progress = progress.reporter();
            let summary = cleaner
                .batch_clean(&dir, content_type, force, dry_run, progress.as_ref())
                .await?;
            let label = if dry_run { "Batch (dry run)" } else { "Batch" };
            print_summary(label, &summary, json)?;
        }
        Commands::Reclean {
            advertisers,
            ids,
            changed,
            all,
            content_type,
            dry_run,
            json,
            progress,
        } => {
            let progress = progress.reporter();
            let mut targets = ids;
            if !advertisers.is_empty() {
                targets.extend(versioned.find_affected(&advertisers).await?);
            }

            if dry_run {
                let mut pending: Vec<String> = versioned
                    .list(content_type)
                    .await?
                    .into_iter()
                    .filter(|r| all || r.needs_reclean)
                    .map(|r| r.content_id)
                    .collect();
                if !targets.is_empty() {
                    pending = targets;
                }
                if json {
                    print_json(&pending)?;
                } else {
                    println!("{} item(s) would be re-cleaned", pending.len());
                    for id in &pending {
                        println!("  {}", id);
                    }
                }
                return Ok(());
            }

            if changed {
                let ids = versioned.detect_changes().await?;
                println!("{} original(s) changed since last clean", ids.len());
            }
            if all {
                versioned.invalidate(content_type).await?;
            }
            let summary = if targets.is_empty() {
                versioned.reclean_pending(progress.as_ref()).await?
            } else {
                targets.sort();
                targets.dedup();
                versioned.reclean(&targets, progress.as_ref()).await?
            };
            print_summary("Reclean", &summary, json)?;
        }
        Commands::Stats { json } => {
            let s = stats::collect(&pool, &cfg).await?;
            stats::print_stats(&s, json)?;
        }
        Commands::Queue {
            status,
            limit,
            json,
        } => {
            let items = review.list(Some(status), limit).await?;
            if json {
                print_json(&items)?;
            } else if items.is_empty() {
                println!("No {} review items.", status.as_str());
            } else {
                for item in &items {
                    println!(
                        "{} #{}  {:.2}  {}  [{}]",
                        item.content_id,
                        item.removal_index,
                        item.confidence,
                        item.pattern,
                        stats::format_ts_iso(item.detected_at)
                    );
                    println!("    {}", item.text_preview);
                }
            }
        }
        Commands::MarkFp {
            content_id,
            index,
            reason,
        } => {
            let fp = review.mark_false_positive(&content_id, index, &reason).await?;
            println!(
                "Marked {} #{} as false positive (pattern: {})",
                fp.content_id, fp.removal_index, fp.pattern
            );
        }
        Commands::Confirm {
            content_id,
            index,
            notes,
        } => {
            review.confirm(&content_id, index, notes.as_deref()).await?;
            println!("Confirmed {} #{}", content_id, index);
        }
        Commands::Report { days, stdout } => {
            if stdout {
                print!("{}", review.generate_weekly_report(Utc::now(), days).await?);
            } else {
                let path = review
                    .write_weekly_report(&cfg.storage.reports_dir, Utc::now(), days)
                    .await?;
                println!("Report written to {}", path.display());
            }
        }
        Commands::Ledger { action } => run_ledger(&ledger, action).await?,
        Commands::Advance {
            content_id,
            stage,
            drive,
            max_steps,
            source,
            text,
            content_type,
            quality,
            archive,
            force,
            json,
        } => {
            let registry = handlers::builtin_registry(&ledger, &versioned, &cfg.pipeline)?;
            let coordinator = Coordinator::new(ledger.clone(), registry)
                .with_batch(uuid::Uuid::new_v4().to_string());

            let mut ctx = StageContext::new()
                .with("content_type", content_type.as_str())
                .with("archive", archive)
                .with("force", force);
            if let Some(src) = &source {
                ctx = ctx.with("source_path", src.to_string_lossy().to_string());
            }
            if let Some(t) = text {
                ctx = ctx.with("text", t);
            }
            if let Some(q) = quality {
                ctx = ctx.with("quality_score", q);
            }

            let outcomes = match (stage, drive) {
                (Some(_), true) => bail!("--stage and --drive cannot be combined"),
                (Some(s), false) => vec![coordinator.advance(&content_id, s, &ctx).await?],
                (None, true) => coordinator.drive(&content_id, &ctx, max_steps).await?,
                (None, false) => vec![coordinator.advance_current(&content_id, &ctx).await?],
            };

            if json {
                print_json(&outcomes)?;
            } else {
                for o in &outcomes {
                    println!(
                        "{}  {} -> {}  {:?}  {}{}",
                        o.content_id,
                        o.from,
                        o.to,
                        o.status,
                        o.message,
                        if o.fatal { "  (fatal)" } else { "" }
                    );
                }
            }
        }
    }

    pool.close().await;
    Ok(())
}

fn run_scan(
    cfg: &Config,
    file: &Path,
    content_type: ContentType,
    confidence: Option<f64>,
    json: bool,
) -> Result<()> {
    let text = read_text(file)?;
    let detector = detector_for(cfg, confidence);
    let detections = detector.detect(&text, content_type);

    if json {
        return print_json(&detections);
    }
    if detections.is_empty() {
        println!("No ads detected in {}", file.display());
        return Ok(());
    }
    println!("{} ad segment(s) in {}", detections.len(), file.display());
    for (i, d) in detections.iter().enumerate() {
        let action = match detector.tier(d) {
            Tier::High => "remove",
            Tier::Medium => "review",
            Tier::Low => "keep?",
        };
        println!(
            "  #{} [{}..{}] {:.2} {} {} ({})",
            i,
            d.start,
            d.end,
            d.confidence,
            action,
            d.method,
            d.matched_pattern
        );
        println!("      {}", d.preview(160));
    }
    Ok(())
}

async fn run_ledger(ledger: &Ledger, action: LedgerAction) -> Result<()> {
    match action {
        LedgerAction::History { content_id, json } => {
            let history = ledger.history(&content_id).await?;
            if json {
                return print_json(&history);
            }
            if history.is_empty() {
                println!("No transitions for {}", content_id);
            }
            for t in &history {
                println!(
                    "{}  {:<28} {}  {}",
                    t.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    t.stage.to_string(),
                    if t.success { "ok  " } else { "FAIL" },
                    t.action
                );
            }
        }
        LedgerAction::Status { content_id } => match ledger.current_stage(&content_id).await? {
            Some(stage) => println!("{}  {}", content_id, stage),
            None => println!("{}  unseen", content_id),
        },
        LedgerAction::Metrics { content_id, json } => match ledger.metrics(&content_id).await? {
            Some(m) if json => print_json(&m)?,
            Some(m) => {
                println!("Steps:        {} ({} ok)", m.total_steps, m.successful_steps);
                println!("Success rate: {:.1}%", m.success_rate * 100.0);
                println!(
                    "Duration:     {} ms total, {:.1} ms avg",
                    m.total_duration_ms, m.avg_duration_ms
                );
                println!("First:        {}", m.first_action);
                println!("Last:         {}", m.last_action);
            }
            None => println!("No transitions for {}", content_id),
        },
        LedgerAction::Distribution { project, json } => {
            let dist = ledger.stage_distribution(project.as_deref()).await?;
            if json {
                let by_code: Vec<_> = dist
                    .iter()
                    .map(|(s, n)| json!({ "stage": s.code(), "label": s.label(), "items": n }))
                    .collect();
                return print_json(&by_code);
            }
            for (stage, n) in &dist {
                println!("  {:<28} {}", stage.to_string(), n);
            }
        }
        LedgerAction::Recent {
            minutes,
            project,
            json,
        } => {
            let recent = ledger.recent_activity(minutes, project.as_deref()).await?;
            if json {
                return print_json(&recent);
            }
            for t in &recent {
                println!(
                    "{}  {:<20} {:<28} {}",
                    t.timestamp.format("%H:%M:%S"),
                    t.content_id,
                    t.stage.to_string(),
                    t.action
                );
            }
        }
        LedgerAction::Retry {
            content_id,
            stage,
            reason,
        } => {
            let registry = atlas::coordinator::HandlerRegistry::new();
            let id = Coordinator::new(ledger.clone(), registry)
                .retry(&content_id, stage, &reason)
                .await?;
            println!("Recorded retry of {} at {} (transaction {})", content_id, stage, id);
        }
        LedgerAction::Purge { days } => {
            let n = ledger.purge_older_than(days).await?;
            println!("Purged {} transition(s) older than {} days", n, days);
        }
    }
    Ok(())
}
