use std::fs;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

const OVERRIDE_VARS: &[&str] = &[
    "MCP_HOST",
    "MCP_PORT",
    "MCP_PATH",
    "TOOL_TIMEOUT",
    "MODEL_PROTOCOL",
    "MODEL_URL",
    "MODEL_NAME",
    "LOG_LEVEL",
    "RUST_LOG",
];

fn quiknow_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("quiknow");
    path
}

/// A local port with nothing listening on it.
fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();
    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[backend]
host = "127.0.0.1"
port = {backend_port}
tool_timeout_secs = 2.0

[model]
url = "127.0.0.1:{model_port}/v1"
name = "tiny"
api_key_env = "QUIKNOW_CLI_TEST_KEY"
timeout_secs = 2
max_retries = 0

[ask]
board_path = "{root}/ask.md"

[report]
output_path = "{root}/report.md"

[logging]
to_file = false
"#,
        backend_port = closed_port(),
        model_port = closed_port(),
        root = root.display(),
    );

    let config_path = config_dir.join("quiknow.toml");
    fs::write(&config_path, config_content).unwrap();
    (tmp, config_path)
}

fn run_quiknow(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = quiknow_binary();
    let mut cmd = Command::new(&binary);
    for var in OVERRIDE_VARS {
        cmd.env_remove(var);
    }
    let output = cmd
        .env("QUIKNOW_CLI_TEST_KEY", "test-key")
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run quiknow binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_help_lists_commands() {
    let output = Command::new(quiknow_binary()).arg("--help").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for cmd in ["check", "build", "status", "tree", "ask", "report"] {
        assert!(stdout.contains(cmd), "--help is missing {}: {}", cmd, stdout);
    }
}

#[test]
fn test_check_unreachable_model_prints_error_json() {
    let (_tmp, config) = setup_test_env();
    let (stdout, stderr, success) = run_quiknow(&config, &["check"]);
    assert!(!success, "check should fail: {}", stderr);

    let json: serde_json::Value = serde_json::from_str(&stdout)
        .unwrap_or_else(|e| panic!("stdout is not JSON ({}): {}", e, stdout));
    assert_eq!(json["status"], "error");
    assert_eq!(json["model"], "tiny");
    assert_eq!(json["protocol"], "openai");
    assert!(json["base_url"].as_str().unwrap().starts_with("http://127.0.0.1:"));
    assert!(json["error"].is_string());
    assert!(json["latency_sec"].is_number());
}

#[test]
fn test_check_model_override() {
    let (_tmp, config) = setup_test_env();
    let (stdout, _stderr, _success) = run_quiknow(&config, &["check", "--model", "other-model"]);
    let json: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(json["model"], "other-model");
}

#[test]
fn test_status_unreachable_backend_fails() {
    let (_tmp, config) = setup_test_env();
    let (stdout, stderr, success) = run_quiknow(&config, &["status", "--job", "job-1"]);
    assert!(!success);
    assert!(stdout.trim().is_empty(), "nothing should reach stdout: {}", stdout);
    assert!(
        stderr.contains("unavailable"),
        "expected a backend error, got: {}",
        stderr
    );
}

#[test]
fn test_report_requires_task() {
    let (_tmp, config) = setup_test_env();
    let (_stdout, _stderr, success) = run_quiknow(&config, &["report"]);
    assert!(!success);
}

#[test]
fn test_report_rejects_out_of_range_max_sub() {
    let (_tmp, config) = setup_test_env();
    let (_stdout, stderr, success) =
        run_quiknow(&config, &["report", "Summarize Q1", "--max-sub", "50"]);
    assert!(!success);
    assert!(stderr.contains("max-sub"), "{}", stderr);
}

#[test]
fn test_invalid_config_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let config_path = tmp.path().join("bad.toml");
    fs::write(
        &config_path,
        "[report]\nmin_sub_questions = 4\nmax_sub_questions = 2\n\n[logging]\nto_file = false\n",
    )
    .unwrap();
    let (_stdout, stderr, success) = run_quiknow(&config_path, &["check"]);
    assert!(!success);
    assert!(stderr.contains("must not exceed"), "{}", stderr);
}

#[test]
fn test_missing_explicit_config_is_an_error() {
    let tmp = TempDir::new().unwrap();
    let (_stdout, stderr, success) = run_quiknow(&tmp.path().join("nope.toml"), &["tree"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"), "{}", stderr);
}

#[test]
fn test_build_rejects_non_finite_interval() {
    let (_tmp, config) = setup_test_env();
    let (_stdout, stderr, success) =
        run_quiknow(&config, &["build", "--wait", "--interval", "inf"]);
    assert!(!success);
    assert!(stderr.contains("interval"), "{}", stderr);
}

#[test]
fn test_non_finite_tool_timeout_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let config_path = tmp.path().join("inf.toml");
    fs::write(
        &config_path,
        "[backend]\ntool_timeout_secs = inf\n\n[logging]\nto_file = false\n",
    )
    .unwrap();
    let (_stdout, stderr, success) = run_quiknow(&config_path, &["tree"]);
    assert!(!success);
    assert!(stderr.contains("tool_timeout_secs"), "{}", stderr);
}
