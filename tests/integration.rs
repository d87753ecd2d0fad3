use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn corpus_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_corpus"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("target.md"),
        "# Auth\n\nOAuth2 authentication token exchange flow.",
    )
    .unwrap();
    fs::write(
        files_dir.join("distractor.md"),
        "# Garden\n\nTomatoes need full sun, deep watering, and mulch around the stems.",
    )
    .unwrap();
    fs::write(
        files_dir.join("ticket.txt"),
        "Follow-up for PROJ-1234: rotate the signing keys before release.",
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/corpus.sqlite"

[source]
scope = "notes"
root = "{root}/files"
include_globs = ["**/*.md", "**/*.txt"]

[embedding]
provider = "hash"
dims = 128

[ingest]
concurrency = 2

[eval]
k_values = [1, 3, 5]
output_dir = "{root}/eval-runs"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("corpus.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_corpus(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = corpus_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run corpus binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn init_and_sync(config_path: &Path) {
    let (_, stderr, ok) = run_corpus(config_path, &["init"]);
    assert!(ok, "init failed: {}", stderr);
    let (stdout, stderr, ok) = run_corpus(config_path, &["sync", "--progress", "off"]);
    assert!(ok, "sync failed: stdout={}, stderr={}", stdout, stderr);
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, first) = run_corpus(&config_path, &["init"]);
    assert!(first, "First init failed");
    assert!(stdout.contains("initialized"));

    let (_, _, second) = run_corpus(&config_path, &["init"]);
    assert!(second, "Second init failed (not idempotent)");
}

#[test]
fn test_sync_then_resync_skips_everything() {
    let (_tmp, config_path) = setup_test_env();
    init_and_sync(&config_path);

    let (stdout, _, ok) = run_corpus(&config_path, &["sync", "--progress", "off"]);
    assert!(ok);
    assert!(stdout.contains("created: 0"), "stdout={}", stdout);
    assert!(stdout.contains("skipped: 3"), "stdout={}", stdout);
    assert!(stdout.contains("chunks written: 0"), "stdout={}", stdout);
}

#[test]
fn test_sync_dry_run_writes_nothing() {
    let (_tmp, config_path) = setup_test_env();
    run_corpus(&config_path, &["init"]);

    let (stdout, _, ok) = run_corpus(&config_path, &["sync", "--dry-run", "--progress", "off"]);
    assert!(ok);
    assert!(stdout.contains("would create: 3"), "stdout={}", stdout);

    let (stdout, _, ok) = run_corpus(&config_path, &["sync", "--progress", "off"]);
    assert!(ok);
    assert!(stdout.contains("created: 3"), "stdout={}", stdout);
}

#[test]
fn test_sync_with_limit() {
    let (_tmp, config_path) = setup_test_env();
    run_corpus(&config_path, &["init"]);

    let (stdout, _, ok) = run_corpus(
        &config_path,
        &["sync", "--limit", "1", "--progress", "off"],
    );
    assert!(ok);
    assert!(stdout.contains("fetched: 1 items"), "stdout={}", stdout);
}

#[test]
fn test_sync_cleanup_deactivates_deleted_file() {
    let (tmp, config_path) = setup_test_env();
    init_and_sync(&config_path);

    fs::remove_file(tmp.path().join("files/distractor.md")).unwrap();
    let (stdout, _, ok) = run_corpus(
        &config_path,
        &["sync", "--cleanup", "--progress", "off"],
    );
    assert!(ok);
    assert!(stdout.contains("deactivated: 1"), "stdout={}", stdout);

    let (stdout, _, ok) = run_corpus(&config_path, &["search", "tomatoes mulch", "--mode", "term"]);
    assert!(ok);
    assert!(stdout.contains("No results."), "stdout={}", stdout);

    let (stdout, _, ok) = run_corpus(&config_path, &["get", "notes", "distractor.md"]);
    assert!(ok);
    assert!(stdout.contains("active:        false"), "stdout={}", stdout);
}

#[test]
fn test_term_search_exact_identifier() {
    let (_tmp, config_path) = setup_test_env();
    init_and_sync(&config_path);

    let (stdout, stderr, ok) = run_corpus(&config_path, &["search", "PROJ-1234", "--mode", "term"]);
    assert!(ok, "search failed: {}", stderr);
    let first = stdout.lines().find(|l| l.starts_with("1. ")).unwrap();
    assert!(first.contains("ticket.txt"), "stdout={}", stdout);
}

#[test]
fn test_vector_search_ranks_target_first() {
    let (_tmp, config_path) = setup_test_env();
    init_and_sync(&config_path);

    let (stdout, stderr, ok) = run_corpus(
        &config_path,
        &["search", "oauth2 authentication", "--mode", "vector"],
    );
    assert!(ok, "search failed: {}", stderr);
    let first = stdout.lines().find(|l| l.starts_with("1. ")).unwrap();
    assert!(first.contains("target.md"), "stdout={}", stdout);
}

#[test]
fn test_fused_search_explain_shows_components() {
    let (_tmp, config_path) = setup_test_env();
    init_and_sync(&config_path);

    let (stdout, _, ok) = run_corpus(
        &config_path,
        &["search", "authentication token", "--explain"],
    );
    assert!(ok);
    assert!(stdout.contains("channels: term, vector"), "stdout={}", stdout);
    assert!(stdout.contains("rrf:term"), "stdout={}", stdout);
}

#[test]
fn test_search_deterministic() {
    let (_tmp, config_path) = setup_test_env();
    init_and_sync(&config_path);

    let (first, _, _) = run_corpus(&config_path, &["search", "signing keys release"]);
    let (second, _, _) = run_corpus(&config_path, &["search", "signing keys release"]);
    assert_eq!(first, second);
}

#[test]
fn test_search_unknown_mode_errors() {
    let (_tmp, config_path) = setup_test_env();
    init_and_sync(&config_path);

    let (_, stderr, ok) = run_corpus(&config_path, &["search", "oauth2", "--mode", "semantic"]);
    assert!(!ok);
    assert!(stderr.contains("Unknown search mode"), "stderr={}", stderr);
}

#[test]
fn test_rerank_without_judge_errors() {
    let (_tmp, config_path) = setup_test_env();
    init_and_sync(&config_path);

    let (_, stderr, ok) = run_corpus(&config_path, &["search", "oauth2", "--rerank"]);
    assert!(!ok);
    assert!(stderr.contains("rerank"), "stderr={}", stderr);
}

#[test]
fn test_get_missing_document() {
    let (_tmp, config_path) = setup_test_env();
    init_and_sync(&config_path);

    let (_, stderr, ok) = run_corpus(&config_path, &["get", "notes", "nope.md"]);
    assert!(!ok);
    assert!(stderr.contains("not found"), "stderr={}", stderr);
}

#[test]
fn test_stats_lists_scope() {
    let (_tmp, config_path) = setup_test_env();
    init_and_sync(&config_path);

    let (stdout, _, ok) = run_corpus(&config_path, &["stats"]);
    assert!(ok);
    assert!(stdout.contains("notes"), "stdout={}", stdout);
    assert!(stdout.contains("hash/hash-128 (128d)"), "stdout={}", stdout);
}

fn write_queries(dir: &Path, expected: &str) -> PathBuf {
    let path = dir.join("golden.json");
    let body = format!(
        r#"{{
  "version": "v1",
  "queries": [
    {{ "query": "PROJ-1234", "expected_docs": ["{}"], "difficulty": "easy",
       "retriever_types": ["bm25", "hybrid"] }}
  ]
}}"#,
        expected
    );
    fs::write(&path, body).unwrap();
    path
}

#[test]
fn test_eval_writes_artifacts() {
    let (tmp, config_path) = setup_test_env();
    init_and_sync(&config_path);
    let queries = write_queries(tmp.path(), "ticket.txt");

    let (stdout, stderr, ok) = run_corpus(
        &config_path,
        &["eval", queries.to_str().unwrap(), "--strict"],
    );
    assert!(ok, "eval failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("All thresholds passed."), "stdout={}", stdout);

    let runs: Vec<_> = fs::read_dir(tmp.path().join("eval-runs"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(runs.len(), 1);
    for file in ["run.json", "results.jsonl", "metrics.json", "traces.jsonl"] {
        assert!(runs[0].join(file).exists(), "missing {}", file);
    }
}

#[test]
fn test_eval_threshold_overrides_from_config() {
    let (tmp, config_path) = setup_test_env();
    init_and_sync(&config_path);
    let queries = write_queries(tmp.path(), "missing.md");

    let mut config = fs::read_to_string(&config_path).unwrap();
    for bucket in ["bm25/easy", "hybrid/easy"] {
        config.push_str(&format!(
            "\n[eval.thresholds.\"{}\"]\nhit_at_1 = 0.0\nhit_at_3 = 0.0\nhit_at_5 = 0.0\n",
            bucket
        ));
    }
    fs::write(&config_path, config).unwrap();

    let (stdout, stderr, ok) = run_corpus(
        &config_path,
        &["eval", queries.to_str().unwrap(), "--strict"],
    );
    assert!(ok, "eval failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("All thresholds passed."), "stdout={}", stdout);
}

#[test]
fn test_eval_strict_fails_on_threshold_miss() {
    let (tmp, config_path) = setup_test_env();
    init_and_sync(&config_path);
    let queries = write_queries(tmp.path(), "missing.md");

    let (stdout, _, ok) = run_corpus(&config_path, &["eval", queries.to_str().unwrap()]);
    assert!(ok, "non-strict eval must not fail");
    assert!(stdout.contains("Threshold failures:"), "stdout={}", stdout);

    let (_, _, ok) = run_corpus(
        &config_path,
        &["eval", queries.to_str().unwrap(), "--strict"],
    );
    assert!(!ok);
}
