//! Drives the `cfr` binary against a temporary database with every
//! endpoint unreachable, so each refresh lands on the bundled fallback data.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn cfr_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_cfr"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    // Port 1 refuses connections immediately.
    let config_content = format!(
        r#"[db]
path = "{}/data/cfr.sqlite"

[fetch]
max_retries = 0
backoff_base_ms = 0
timeout_secs = 2
total_budget_secs = 10

[[fetch.endpoints]]
url = "http://127.0.0.1:1/current/title-21"

[[fetch.endpoints]]
url = "http://127.0.0.1:1/api/title/21"
strategies = ["api"]

[retrieval]
final_limit = 5

[agent]
item_timeout_secs = 10
"#,
        root.display()
    );

    let config_path = config_dir.join("cfr.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_cfr(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = cfr_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run cfr binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

/// init + refresh, returning the config path.
fn seeded_env() -> (TempDir, PathBuf) {
    let (tmp, config_path) = setup_test_env();
    let (_, stderr, success) = run_cfr(&config_path, &["init"]);
    assert!(success, "init failed: {}", stderr);
    let (stdout, stderr, success) = run_cfr(&config_path, &["refresh"]);
    assert!(success, "refresh failed: stdout={}, stderr={}", stdout, stderr);
    (tmp, config_path)
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success1) = run_cfr(&config_path, &["init"]);
    assert!(success1, "First init failed");
    assert!(stdout.contains("initialized"));

    let (_, _, success2) = run_cfr(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_health_before_any_refresh_is_error() {
    let (_tmp, config_path) = setup_test_env();
    run_cfr(&config_path, &["init"]);

    let (stdout, stderr, success) = run_cfr(&config_path, &["health"]);
    assert!(success, "health failed: {}", stderr);
    assert!(stdout.contains("status:           error"), "got: {}", stdout);
    assert!(stdout.contains("cached endpoint:  (none)"));
}

#[test]
fn test_refresh_falls_back_to_bundled_data() {
    let (_tmp, config_path) = setup_test_env();
    run_cfr(&config_path, &["init"]);

    let (stdout, stderr, success) = run_cfr(&config_path, &["refresh"]);
    assert!(success, "refresh failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("source: fallback"), "got: {}", stdout);
    assert!(stdout.contains("added: 20"));
    assert!(stdout.contains("degraded"));
    assert!(stdout.contains("ok"));

    let (stdout, _, _) = run_cfr(&config_path, &["health"]);
    assert!(stdout.contains("status:           error"));
    assert!(stdout.contains("fallback in use:  true"));
    assert!(stdout.contains("http://127.0.0.1:1/current/title-21"));
}

#[test]
fn test_second_fallback_refresh_keeps_corpus() {
    let (_tmp, config_path) = seeded_env();

    let (stdout, _, success) = run_cfr(&config_path, &["refresh", "--dry-run"]);
    assert!(success);
    assert!(stdout.contains("dry-run"));
    assert!(stdout.contains("added: 0"));
    assert!(stdout.contains("removed: 0"));

    let (stdout, _, success) = run_cfr(&config_path, &["refresh"]);
    assert!(success);
    assert!(stdout.contains("unchanged: 20"), "got: {}", stdout);
}

#[test]
fn test_search_keyword_reports_degradation() {
    let (_tmp, config_path) = seeded_env();

    let (stdout, stderr, success) = run_cfr(&config_path, &["search", "device labeling", "--limit", "20"]);
    assert!(success, "search failed: {}", stderr);
    assert!(stdout.contains("keyword only"), "got: {}", stdout);
    assert!(stdout.contains("bundled fallback data"), "got: {}", stdout);
    assert!(stdout.contains("Part 801"), "got: {}", stdout);

    let (stdout, _, success) =
        run_cfr(&config_path, &["search", "device labeling", "--keyword-only", "--explain"]);
    assert!(success);
    assert!(!stdout.contains("keyword only"));
    assert!(stdout.contains("explain: keyword="));
}

#[test]
fn test_search_deterministic() {
    let (_tmp, config_path) = seeded_env();

    let (stdout1, _, _) = run_cfr(&config_path, &["search", "requirements", "--keyword-only"]);
    let (stdout2, _, _) = run_cfr(&config_path, &["search", "requirements", "--keyword-only"]);
    assert_eq!(stdout1, stdout2);
}

#[test]
fn test_search_empty_query() {
    let (_tmp, config_path) = seeded_env();

    let (stdout, _, success) = run_cfr(&config_path, &["search", "   "]);
    assert!(success);
    assert!(stdout.contains("No results."));
}

#[test]
fn test_get_by_id_from_search() {
    let (_tmp, config_path) = seeded_env();

    let (stdout, _, _) = run_cfr(&config_path, &["search", "nutrition", "--keyword-only"]);
    let id = stdout
        .lines()
        .find_map(|l| l.trim().strip_prefix("id: "))
        .expect("search output should include an id")
        .to_string();

    let (stdout, stderr, success) = run_cfr(&config_path, &["get", &id]);
    assert!(success, "get failed: {}", stderr);
    assert!(stdout.contains("--- Regulation ---"));
    assert!(stdout.contains("Nutrition labeling"));
    assert!(stdout.contains("added"));

    let (_, _, success) = run_cfr(&config_path, &["get", "42"]);
    assert!(!success, "unknown id should fail");
}

#[test]
fn test_analyze_and_validation() {
    let (_tmp, config_path) = seeded_env();

    let (stdout, stderr, success) =
        run_cfr(&config_path, &["analyze", "labeling", "--context", "medical device"]);
    assert!(success, "analyze failed: {}", stderr);
    assert!(stdout.contains("Analysis for: 'labeling'"));
    assert!(stdout.contains("Summary (raw):"));
    assert!(stdout.contains("Corpus:        fallback"));
    assert!(stdout.contains("Chapter I - Subchapter"));

    let (_, stderr, success) = run_cfr(&config_path, &["analyze", "  "]);
    assert!(!success, "empty query must be rejected");
    assert!(stderr.contains("must not be empty"), "got: {}", stderr);
}

#[test]
fn test_ask_cites_regulations_without_llm() {
    let (_tmp, config_path) = seeded_env();

    let (stdout, stderr, success) = run_cfr(&config_path, &["ask", "what are the labeling rules?"]);
    assert!(success, "ask failed: {}", stderr);
    assert!(stdout.contains("Answer (raw):"), "got: {}", stdout);
    assert!(stdout.contains("Relevant regulations:"));
    assert!(stdout.contains("Corpus:   fallback"));

    let (_, stderr, success) = run_cfr(&config_path, &["ask", " "]);
    assert!(!success, "empty question must be rejected");
    assert!(stderr.contains("must not be empty"), "got: {}", stderr);
}

#[test]
fn test_summarize_falls_back_to_description() {
    let (_tmp, config_path) = seeded_env();

    let (stdout, _, _) = run_cfr(&config_path, &["search", "nutrition", "--keyword-only"]);
    let id = stdout
        .lines()
        .find_map(|l| l.trim().strip_prefix("id: "))
        .expect("search output should include an id")
        .to_string();

    let (stdout, stderr, success) = run_cfr(&config_path, &["summarize", &id]);
    assert!(success, "summarize failed: {}", stderr);
    assert!(stdout.contains("Summary (raw):"), "got: {}", stdout);
    assert!(stdout.contains("Nutrition labeling"));
    assert!(!stdout.contains("saved as content summary"));

    let (_, stderr, success) = run_cfr(&config_path, &["summarize", "42"]);
    assert!(!success, "unknown id should fail");
    assert!(stderr.contains("regulation not found: 42"), "got: {}", stderr);
}

#[test]
fn test_recommendations_from_history() {
    let (_tmp, config_path) = seeded_env();

    run_cfr(&config_path, &["analyze", "nutrition labeling"]);
    let (stdout, _, success) = run_cfr(&config_path, &["analyze", "labeling"]);
    assert!(success);
    assert!(stdout.contains("Related searches: nutrition"), "got: {}", stdout);
}

#[test]
fn test_batch_annotates_each_item() {
    let (_tmp, config_path) = seeded_env();

    let (stdout, stderr, success) = run_cfr(&config_path, &["batch", "labeling", "cosmetic", "zzzz"]);
    assert!(success, "batch failed: {}", stderr);
    // The corpus is the bundled fallback seed, so every item is degraded.
    assert!(stdout.contains("[1] labeling (degraded)"), "got: {}", stdout);
    assert!(stdout.contains("[2] cosmetic (degraded)"));
    assert!(stdout.contains("[3] zzzz (degraded)"));
    assert!(stdout.contains("corpus: fallback"));
    assert!(stdout.contains("results: 0"));
}

#[test]
fn test_changes_and_stats() {
    let (_tmp, config_path) = seeded_env();

    let (stdout, _, success) = run_cfr(&config_path, &["changes", "--days", "1"]);
    assert!(success);
    assert!(stdout.contains("Changes in the last 1 day(s): 20"), "got: {}", stdout);
    assert!(stdout.contains("added"));

    let (stdout, _, success) = run_cfr(&config_path, &["stats"]);
    assert!(success);
    assert!(stdout.contains("Regulations:  20"), "got: {}", stdout);
    assert!(stdout.contains("Embedded:     0 / 20"));
}
