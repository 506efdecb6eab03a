use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde_json::Value;
use tempfile::TempDir;

const EPISODE: &str = "Welcome back. Brought to you by NordVPN, use code SAVE20 at nordvpn.com/promo for 70% off. Now, today's topic is how archivists keep recordings findable for decades.";

const ARTICLE: &str = "Archivists catalogue recordings from many sources so future listeners can find them quickly. \
Each item receives a stable identifier and careful notes about provenance. \
Cleaning removes sponsor reads while leaving the conversation itself untouched for reference.";

const WITH_ADS: &str = "Today we look at how small workshops organize their tools and benches.\n\n\
This week's issue is sponsored by Acme Widgets, makers of durable hand tools for careful home workshops.\n\n\
Most of the readers who wrote in last month asked about wall storage, so we start there.\n\n\
Brought to you by Squarespace, start your free trial at squarespace.com/promo today.\n\n\
Back to benches: height matters more than most people think when planing boards.";

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();

    fs::write(files_dir.join("episode.txt"), EPISODE).unwrap();
    fs::write(files_dir.join("issue.md"), WITH_ADS).unwrap();
    fs::write(files_dir.join("article.md"), ARTICLE).unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/atlas.sqlite"

[storage]
clean_dir = "{root}/data/clean"
changes_dir = "{root}/data/changes"
reports_dir = "{root}/data/reports"
include_globs = ["**/*.md", "**/*.txt"]

[detector]
min_confidence = 0.6
"#,
        root = root.display()
    );

    let config_path = config_dir.join("atlas.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_atlas(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let output = Command::new(env!("CARGO_BIN_EXE_atlas"))
        .arg("--config")
        .arg(config_path)
        .args(args)
        .env("RUST_LOG", "atlas=warn")
        .output()
        .expect("Failed to run atlas binary");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn files(config_path: &Path) -> PathBuf {
    config_path.parent().unwrap().parent().unwrap().join("files")
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_atlas(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/atlas.sqlite").exists());

    let (_, _, again) = run_atlas(&config_path, &["init"]);
    assert!(again, "second init failed (not idempotent)");
}

#[test]
fn test_scan_runs_without_config() {
    let (tmp, config_path) = setup_test_env();
    let missing = tmp.path().join("no-such-config.toml");
    let episode = path_arg(&files(&config_path).join("episode.txt"));

    let (stdout, stderr, success) =
        run_atlas(&missing, &["scan", &episode, "--type", "podcast", "--json"]);
    assert!(success, "scan failed: {}", stderr);

    let detections: Value = serde_json::from_str(&stdout).unwrap();
    let arr = detections.as_array().unwrap();
    assert_eq!(arr.len(), 1);
    assert!(arr[0]["text"].as_str().unwrap().contains("NordVPN"));
    assert!(arr[0]["confidence"].as_f64().unwrap() >= 0.9);

    // Nothing written.
    assert!(!tmp.path().join("data").exists());
}

#[test]
fn test_scan_confidence_override() {
    let (_tmp, config_path) = setup_test_env();
    let episode = path_arg(&files(&config_path).join("episode.txt"));

    let (stdout, _, success) = run_atlas(
        &config_path,
        &["scan", &episode, "--type", "podcast", "--confidence", "0.99", "--json"],
    );
    assert!(success);
    let detections: Value = serde_json::from_str(&stdout).unwrap();
    assert!(detections.as_array().unwrap().is_empty());
}

#[test]
fn test_clean_then_skip_then_stats() {
    let (tmp, config_path) = setup_test_env();
    run_atlas(&config_path, &["init"]);
    let episode = files(&config_path).join("episode.txt");
    let episode_arg = path_arg(&episode);

    let (stdout, stderr, success) = run_atlas(
        &config_path,
        &["clean", &episode_arg, "--type", "podcast", "--json"],
    );
    assert!(success, "clean failed: {}", stderr);
    let record: Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(record["ads_removed"], 1);
    let clean_path = PathBuf::from(record["clean_path"].as_str().unwrap());
    assert!(clean_path.starts_with(tmp.path().join("data/clean/podcast")));
    assert!(!fs::read_to_string(&clean_path).unwrap().contains("NordVPN"));
    assert_eq!(fs::read_to_string(&episode).unwrap(), EPISODE);

    let (stdout, _, success) =
        run_atlas(&config_path, &["clean", &episode_arg, "--type", "podcast"]);
    assert!(success);
    assert!(stdout.contains("Unchanged"));

    let (stdout, _, success) = run_atlas(&config_path, &["stats", "--json"]);
    assert!(success);
    let stats: Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(stats["files_cleaned"], 1);
    assert_eq!(stats["ads_removed"], 1);
}

#[test]
fn test_batch_dry_run_then_real() {
    let (tmp, config_path) = setup_test_env();
    run_atlas(&config_path, &["init"]);
    let dir = path_arg(&files(&config_path));

    let (stdout, stderr, success) = run_atlas(
        &config_path,
        &["batch", &dir, "--type", "article", "--dry-run", "--json"],
    );
    assert!(success, "batch failed: {}", stderr);
    let summary: Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(summary["processed"], 3);
    assert!(!tmp.path().join("data/clean").exists());

    let (stdout, _, success) = run_atlas(&config_path, &["batch", &dir, "--type", "article"]);
    assert!(success);
    assert!(stdout.contains("3 cleaned"));
    assert!(stdout.contains("0 errors"));
}

#[test]
fn test_batch_json_progress_on_stderr() {
    let (_tmp, config_path) = setup_test_env();
    run_atlas(&config_path, &["init"]);
    let dir = path_arg(&files(&config_path));

    let (_, stderr, success) = run_atlas(
        &config_path,
        &["batch", &dir, "--type", "article", "--progress", "json"],
    );
    assert!(success, "batch failed: {}", stderr);

    let events: Vec<Value> = stderr
        .lines()
        .filter(|l| l.starts_with('{'))
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(events.first().unwrap()["phase"], "discovering");
    assert_eq!(
        events.iter().filter(|e| e["phase"] == "cleaning").count(),
        3
    );
    let done = events.last().unwrap();
    assert_eq!(done["event"], "done");
    assert_eq!(done["processed"], 3);
}

#[test]
fn test_review_flow_and_report() {
    let (tmp, config_path) = setup_test_env();
    run_atlas(&config_path, &["init"]);
    let issue = path_arg(&files(&config_path).join("issue.md"));

    let (stdout, _, success) =
        run_atlas(&config_path, &["clean", &issue, "--type", "article", "--json"]);
    assert!(success);
    let record: Value = serde_json::from_str(&stdout).unwrap();
    let id = record["content_id"].as_str().unwrap().to_string();

    let (stdout, _, success) = run_atlas(&config_path, &["queue", "--json"]);
    assert!(success);
    let queue: Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(queue.as_array().unwrap().len(), 1);
    assert_eq!(queue[0]["removal_index"], 0);

    let (stdout, stderr, success) = run_atlas(
        &config_path,
        &["mark-fp", &id, "0", "--reason", "the issue is about Acme"],
    );
    assert!(success, "mark-fp failed: {}", stderr);
    assert!(stdout.contains("false positive"));

    let (_, _, success) = run_atlas(&config_path, &["mark-fp", &id, "7", "--reason", "x"]);
    assert!(!success);

    let (stdout, _, success) = run_atlas(&config_path, &["stats", "--json"]);
    assert!(success);
    let stats: Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(stats["review"]["false_positive"], 1);
    assert!(stats["review"].get("pending").is_none());

    let (stdout, _, success) = run_atlas(&config_path, &["report", "--stdout"]);
    assert!(success);
    assert!(stdout.contains("## False Positives (1)"));

    let (stdout, _, success) = run_atlas(&config_path, &["report"]);
    assert!(success);
    assert!(stdout.contains("Report written"));
    let reports: Vec<_> = fs::read_dir(tmp.path().join("data/reports"))
        .unwrap()
        .collect();
    assert_eq!(reports.len(), 1);
}

#[test]
fn test_reclean_by_advertiser() {
    let (_tmp, config_path) = setup_test_env();
    run_atlas(&config_path, &["init"]);
    let dir = path_arg(&files(&config_path));
    run_atlas(&config_path, &["batch", &dir, "--type", "article"]);

    let (stdout, _, success) = run_atlas(
        &config_path,
        &["reclean", "--advertiser", "squarespace", "--dry-run", "--json"],
    );
    assert!(success);
    let ids: Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(ids.as_array().unwrap().len(), 1);

    let (stdout, stderr, success) = run_atlas(
        &config_path,
        &["reclean", "--advertiser", "squarespace", "--json"],
    );
    assert!(success, "reclean failed: {}", stderr);
    let summary: Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(summary["processed"], 1);
}

#[test]
fn test_advance_drives_to_completion() {
    let (_tmp, config_path) = setup_test_env();
    run_atlas(&config_path, &["init"]);
    let article = path_arg(&files(&config_path).join("article.md"));

    let (stdout, stderr, success) = run_atlas(
        &config_path,
        &[
            "advance", "article-1", "--source", &article, "--type", "article", "--drive", "--json",
        ],
    );
    assert!(success, "advance failed: {}", stderr);
    let steps: Value = serde_json::from_str(&stdout).unwrap();
    let last = steps.as_array().unwrap().last().unwrap();
    assert_eq!(last["to"], 590);
    assert_eq!(last["status"], "advanced");

    let (stdout, _, success) = run_atlas(&config_path, &["ledger", "status", "article-1"]);
    assert!(success);
    assert!(stdout.contains("completed"));

    let (stdout, _, success) =
        run_atlas(&config_path, &["ledger", "distribution", "--json"]);
    assert!(success);
    let dist: Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(dist[0]["stage"], 590);
    assert_eq!(dist[0]["items"], 1);

    let (stdout, _, success) = run_atlas(
        &config_path,
        &["ledger", "retry", "article-1", "validation_started", "--reason", "re-check"],
    );
    assert!(success);
    assert!(stdout.contains("Recorded retry"));

    let (stdout, _, _) = run_atlas(&config_path, &["ledger", "history", "article-1", "--json"]);
    let history: Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(history.as_array().unwrap().last().unwrap()["stage"], 200);
}

#[test]
fn test_missing_config_is_an_error() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_atlas(&tmp.path().join("nope.toml"), &["stats"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}
