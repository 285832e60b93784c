use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

use tender_watch::config::load_config;
use tender_watch::db;

const KNOWN_A: &str = "0100000000000000001";
const KNOWN_B: &str = "0100000000000000002";
const FRESH_C: &str = "0100000000000000003";

fn tw_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("tw");
    path
}

fn setup_test_env(tasks: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("in")).unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/notices.sqlite"

[browser]
webdriver_url = "http://127.0.0.1:9"
warmup_secs = 0

[search]
workers = 2

{tasks}
"#,
        root = root.display(),
        tasks = tasks.replace("{root}", &root.display().to_string())
    );

    let config_path = config_dir.join("tw.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_tw(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = tw_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run tw binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

async fn seed(config_path: &Path, table: &str, numbers: &[&str]) {
    let cfg = load_config(config_path).unwrap();
    let mut conn = db::connect(&cfg).await.unwrap();
    for number in numbers {
        sqlx::query(&format!("INSERT INTO {} (notificationnumber) VALUES (?)", table))
            .bind(*number)
            .execute(&mut conn)
            .await
            .unwrap();
    }
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env("");

    let (stdout, stderr, success) = run_tw(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/notices.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env("");

    let (_, _, success1) = run_tw(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_tw(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_tasks_lists_input_status() {
    let (tmp, config_path) = setup_test_env(
        r#"
[[tasks]]
name = "kw44"
regime = "44"
mode = "keywords"
input = "{root}/in/kw.txt"
output = "{root}/out/kw44.txt"

[[tasks]]
name = "codes223"
regime = "223"
mode = "codes"
input = "{root}/in/codes.txt"
output = "{root}/out/codes223.txt"
"#,
    );
    fs::write(tmp.path().join("in/kw.txt"), "хлеб\n").unwrap();

    let (stdout, stderr, success) = run_tw(&config_path, &["tasks"]);
    assert!(success, "tasks failed: stderr={}", stderr);
    let kw = stdout.lines().find(|l| l.starts_with("kw44")).unwrap();
    assert!(kw.contains("OK"));
    let codes = stdout.lines().find(|l| l.starts_with("codes223")).unwrap();
    assert!(codes.contains("MISSING"));
    assert!(codes.contains("223"));
}

#[test]
fn test_run_rejects_task_without_mode() {
    let (tmp, config_path) = setup_test_env(
        r#"
[[tasks]]
name = "unclear"
regime = "44"
input = "{root}/in/kw.txt"
output = "{root}/out/kw44.txt"
"#,
    );
    fs::write(tmp.path().join("in/kw.txt"), "хлеб\n").unwrap();

    let (_, stderr, success) = run_tw(&config_path, &["run", "--regime", "44"]);
    assert!(!success);
    assert!(stderr.contains("has no mode"), "stderr={}", stderr);
    assert!(!tmp.path().join("out").exists());
}

#[test]
fn test_run_without_matching_tasks_fails() {
    let (_tmp, config_path) = setup_test_env(
        r#"
[[tasks]]
name = "kw44"
regime = "44"
mode = "keywords"
input = "{root}/in/kw.txt"
output = "{root}/out/kw44.txt"
"#,
    );

    let (_, stderr, success) = run_tw(&config_path, &["run", "--regime", "223"]);
    assert!(!success);
    assert!(stderr.contains("No tasks configured for regime 223"), "stderr={}", stderr);

    let (_, stderr, success) =
        run_tw(&config_path, &["run", "--regime", "44", "--mode", "codes"]);
    assert!(!success);
    assert!(stderr.contains("No codes tasks"), "stderr={}", stderr);
}

#[test]
fn test_run_with_missing_input_fails_before_browsing() {
    let (tmp, config_path) = setup_test_env(
        r#"
[[tasks]]
name = "codes44"
regime = "44"
mode = "codes"
input = "{root}/in/absent.txt"
output = "{root}/out/codes44.txt"
"#,
    );

    let (_, stderr, success) = run_tw(&config_path, &["run", "--regime", "44"]);
    assert!(!success);
    assert!(stderr.contains("codes44"), "stderr={}", stderr);
    assert!(!tmp.path().join("data/notices.sqlite").exists());
}

#[test]
fn test_unknown_regime_is_a_usage_error() {
    let (_tmp, config_path) = setup_test_env("");
    let (_, _, success) = run_tw(&config_path, &["run", "--regime", "94"]);
    assert!(!success);
}

#[tokio::test]
async fn test_reconcile_prints_only_unseen() {
    let (tmp, config_path) = setup_test_env("");
    let (_, _, success) = run_tw(&config_path, &["init"]);
    assert!(success);
    seed(&config_path, "notifications44", &[KNOWN_A, KNOWN_B]).await;

    let collected = tmp.path().join("collected.txt");
    fs::write(
        &collected,
        format!("{}\n{}\n{}\n12345\n{}\n", KNOWN_A, KNOWN_B, FRESH_C, FRESH_C),
    )
    .unwrap();

    let (stdout, stderr, success) = run_tw(
        &config_path,
        &["reconcile", "--regime", "44", collected.to_str().unwrap()],
    );
    assert!(success, "reconcile failed: stderr={}", stderr);
    assert_eq!(stdout, format!("{}\n", FRESH_C));

    // Running again gives the same answer.
    let (again, _, _) = run_tw(
        &config_path,
        &["reconcile", "--regime", "44", collected.to_str().unwrap()],
    );
    assert_eq!(again, stdout);
}

#[tokio::test]
async fn test_reconcile_regime_b_keeps_registry_ids() {
    let (tmp, config_path) = setup_test_env("");
    run_tw(&config_path, &["init"]);
    seed(&config_path, "notifications223", &["31000000001"]).await;

    let collected = tmp.path().join("collected223.txt");
    fs::write(
        &collected,
        "31000000001;100;7\n31000000002;101;8\n31000000003\n21000000004;1;1\n",
    )
    .unwrap();

    let (stdout, stderr, success) = run_tw(
        &config_path,
        &["reconcile", "--regime", "223", collected.to_str().unwrap()],
    );
    assert!(success, "reconcile failed: stderr={}", stderr);
    assert_eq!(stdout, "31000000002;101;8\n31000000003\n");
}

#[test]
fn test_reconcile_empty_file_needs_no_schema() {
    let (tmp, config_path) = setup_test_env("");
    let collected = tmp.path().join("empty.txt");
    fs::write(&collected, "\n\n").unwrap();

    // No init: the store has no tables, and none are queried.
    let (stdout, stderr, success) = run_tw(
        &config_path,
        &["reconcile", "--regime", "44", collected.to_str().unwrap()],
    );
    assert!(success, "reconcile failed: stderr={}", stderr);
    assert!(stdout.is_empty());
}
