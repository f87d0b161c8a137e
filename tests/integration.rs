use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn relay_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_relay"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let corpus_path = root.join("corpus.json");
    fs::write(
        &corpus_path,
        r#"[
  {"id": "myopia", "content": "Myopia treatment includes glasses, contact lenses and low-dose atropine.", "source": "kb", "metadata": {"title": "Myopia"}},
  {"id": "cataract", "content": "Cataract surgery replaces the clouded natural lens.", "source": "kb"},
  {"id": "dry-eye", "content": "Dry eye is treated with artificial tears and warm compresses.", "source": "faq"}
]"#,
    )
    .unwrap();

    let config_content = format!(
        r#"[server]
bind = "127.0.0.1:7450"

[retrieval]
top_k = 2

[corpus]
path = "{}"

[[prompts.chat]]
version = "1.0.0"
system = "You are an eye-care assistant."
user = "{{input}}"

[[prompts.chat]]
version = "2.0.0"
system = "You are an eye-care assistant. Answer in {{language}}."
user = "{{name}} ({{age}}) asks: {{input}}"
temperature = 0.3
max_tokens = 400

[prompts.triage]
version = "0.1.0"
system = "Classify urgency."
user = "{{input}}"
"#,
        corpus_path.display()
    );

    let config_path = config_dir.join("relay.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_relay(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = relay_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run relay binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_search_ranks_corpus() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_relay(&config_path, &["search", "myopia treatment"]);
    assert!(success, "search failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("1. ["));
    assert!(stdout.contains("kb / Myopia"));
    assert!(stdout.contains("id: myopia"));
}

#[test]
fn test_search_top_k_limits_results() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_relay(
        &config_path,
        &["search", "treated treatment", "--top-k", "1"],
    );
    assert!(success);
    assert!(stdout.contains("1. ["));
    assert!(!stdout.contains("2. ["));
}

#[test]
fn test_search_no_matches() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_relay(&config_path, &["search", "zzzz"]);
    assert!(success);
    assert!(stdout.contains("No results."));
}

#[test]
fn test_prompts_lists_every_version() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_relay(&config_path, &["prompts"]);
    assert!(success, "prompts failed: stderr={}", stderr);
    assert!(stdout.contains("chat@1.0.0"));
    assert!(stdout.contains("chat@2.0.0"));
    assert!(stdout.contains("triage@0.1.0"));
    assert!(stdout.contains("temperature: 0.3"));
    assert!(stdout.contains("max_tokens: 400"));
}

#[test]
fn test_render_latest_and_pinned() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_relay(
        &config_path,
        &["render", "chat", "--input", "Is atropine safe?", "--user-name", "Ana", "--age", "9"],
    );
    assert!(success, "render failed: stderr={}", stderr);
    assert!(stdout.contains("--- chat@2.0.0"));
    assert!(stdout.contains("Answer in en."));
    assert!(stdout.contains("Ana (9) asks: Is atropine safe?"));

    let (stdout, _, success) = run_relay(
        &config_path,
        &["render", "chat", "--input", "hello", "--version", "1.0.0"],
    );
    assert!(success);
    assert!(stdout.contains("--- chat@1.0.0"));
}

#[test]
fn test_render_unknown_prompt_fails() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_relay(&config_path, &["render", "missing", "--input", "hi"]);
    assert!(!success);
    assert!(stderr.contains("missing"));
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_relay(&tmp.path().join("nope.toml"), &["prompts"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}
