use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tempfile::TempDir;

fn pdm_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("pdm");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/pdm.sqlite"

[server]
bind = "127.0.0.1:8080"

[ai]
default_provider = "perplexity"

[reports]
table = "pdm.materials"
dimensions = ["plant", "material_type"]
measures = ["quantity"]
"#,
        root.display()
    );

    let config_path = config_dir.join("pdm.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn pdm_command(config_path: &Path, args: &[&str]) -> Command {
    let mut cmd = Command::new(pdm_binary());
    cmd.arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("PERPLEXITY_API_KEY")
        .env_remove("OPENAI_API_KEY")
        .env("RUST_LOG", "warn");
    cmd
}

fn run_pdm(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let output = pdm_command(config_path, args)
        .stdin(Stdio::null())
        .output()
        .unwrap_or_else(|e| panic!("Failed to run pdm binary at {:?}: {}", pdm_binary(), e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn run_pdm_with_stdin(config_path: &Path, args: &[&str], input: &str) -> (String, String, bool) {
    let mut child = pdm_command(config_path, args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap_or_else(|e| panic!("Failed to run pdm binary at {:?}: {}", pdm_binary(), e));
    child
        .stdin
        .take()
        .unwrap()
        .write_all(input.as_bytes())
        .unwrap();
    let output = child.wait_with_output().unwrap();

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_pdm(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/pdm.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_pdm(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_pdm(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_user_add_and_list() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_pdm(
        &config_path,
        &["user", "add", "Ana@Example.com", "--name", "Ana", "--password", "correct-horse"],
    );
    assert!(success, "user add failed: stderr={}", stderr);
    assert!(stdout.contains("Created user ana@example.com"));

    let (stdout, _, success) = run_pdm(&config_path, &["user", "list"]);
    assert!(success);
    assert!(stdout.contains("ana@example.com"));
    assert!(stdout.contains("Ana"));

    // Duplicate email is rejected
    let (_, stderr, success) = run_pdm(
        &config_path,
        &["user", "add", "ana@example.com", "--password", "another-pass"],
    );
    assert!(!success);
    assert!(stderr.contains("already exists"), "stderr={}", stderr);
}

#[test]
fn test_user_add_reads_password_from_stdin() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) =
        run_pdm_with_stdin(&config_path, &["user", "add", "bo@example.com"], "s3cret-pass\n");
    assert!(success, "user add failed: stderr={}", stderr);
    assert!(stdout.contains("bo@example.com"));

    let (stdout, stderr, success) =
        run_pdm_with_stdin(&config_path, &["user", "passwd", "bo@example.com"], "n3w-s3cret-pass\n");
    assert!(success, "passwd failed: stderr={}", stderr);
    assert!(stdout.contains("Password updated"));
}

#[test]
fn test_user_add_rejects_short_password() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_pdm(
        &config_path,
        &["user", "add", "cy@example.com", "--password", "short"],
    );
    assert!(!success);
    assert!(stderr.contains("at least 8 characters"), "stderr={}", stderr);
}

#[test]
fn test_parse_table_from_file_and_stdin() {
    let (tmp, config_path) = setup_test_env();
    let answer = "<think>plan</think>Two seals match [1].\n\n\
| Código | Fabricante |\n|---|---|\n| **A-70** | Parker [1] |\n| B-80 | Trelleborg |\n";
    let file = tmp.path().join("answer.md");
    fs::write(&file, answer).unwrap();

    // parse-table needs no configuration file
    let missing = tmp.path().join("nope.toml");
    let (stdout, stderr, success) = run_pdm(&missing, &["parse-table", file.to_str().unwrap()]);
    assert!(success, "parse-table failed: stderr={}", stderr);

    let parsed: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(parsed["text"], "Two seals match.");
    assert_eq!(parsed["reasoning"], "plan");
    assert_eq!(parsed["citations"], serde_json::json!([1]));
    assert_eq!(parsed["tables"][0]["headers"], serde_json::json!(["Código", "Fabricante"]));
    assert_eq!(parsed["tables"][0]["rows"][0], serde_json::json!(["A-70", "Parker"]));

    let (stdout, _, success) = run_pdm_with_stdin(&config_path, &["parse-table"], answer);
    assert!(success);
    let from_stdin: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(from_stdin, parsed);
}

#[test]
fn test_pivot_sql() {
    let (tmp, config_path) = setup_test_env();
    let request = tmp.path().join("pivot.json");
    fs::write(
        &request,
        r#"{ "rows": ["plant"], "columns": ["material_type"],
            "values": [{ "field": "quantity", "agg": "sum" }],
            "filters": [{ "field": "plant", "op": "eq", "value": "P'1" }] }"#,
    )
    .unwrap();

    let (stdout, stderr, success) =
        run_pdm(&config_path, &["pivot-sql", "--file", request.to_str().unwrap()]);
    assert!(success, "pivot-sql failed: stderr={}", stderr);
    assert!(stdout.contains(r#"SUM("quantity") AS "sum_quantity""#));
    assert!(stdout.contains(r#"FROM "pdm"."materials""#));
    assert!(stdout.contains("'P''1'"));
    assert!(stdout.contains("GROUP BY 1, 2"));

    fs::write(
        &request,
        r#"{ "rows": ["password_hash"], "values": [{ "field": "quantity", "agg": "sum" }] }"#,
    )
    .unwrap();
    let (_, stderr, success) =
        run_pdm(&config_path, &["pivot-sql", "--file", request.to_str().unwrap()]);
    assert!(!success);
    assert!(stderr.contains("not an available dimension"), "stderr={}", stderr);
}

#[test]
fn test_feedback_and_sessions_on_empty_database() {
    let (_tmp, config_path) = setup_test_env();
    let (_, _, success) = run_pdm(&config_path, &["init"]);
    assert!(success);

    let (stdout, _, success) = run_pdm(&config_path, &["feedback", "stats"]);
    assert!(success);
    assert!(stdout.contains("ratings: 0"));
    assert!(stdout.contains("average: n/a"));

    let (stdout, _, success) = run_pdm(&config_path, &["feedback", "list"]);
    assert!(success);
    assert!(stdout.contains("No feedback yet."));

    let (stdout, _, success) = run_pdm(&config_path, &["sessions", "purge"]);
    assert!(success);
    assert!(stdout.contains("Removed 0"));
}

#[test]
fn test_search_without_provider_fails() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_pdm(&config_path, &["search", "EPDM 70 shore"]);
    assert!(!success);
    assert!(stderr.contains("not available"), "stderr={}", stderr);
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let missing = tmp.path().join("absent.toml");

    let (_, stderr, success) = run_pdm(&missing, &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"), "stderr={}", stderr);
}
