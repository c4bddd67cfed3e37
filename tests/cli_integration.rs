//! Integration tests for the insidr binary
//!
//! Each test points INSIDR_DIR at a temporary directory holding its own
//! insidr.yaml, so the real user config and storage are never touched.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Output, Stdio};

use tempfile::TempDir;

fn setup() -> TempDir {
    let dir = TempDir::new().unwrap();
    let config = format!(
        "storageDir: {}\ncapture:\n  network: false\n  performance: false\n",
        dir.path().join("storage").display()
    );
    fs::write(dir.path().join("insidr.yaml"), config).unwrap();
    dir
}

fn command(dir: &Path, args: &[&str]) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_insidr"));
    cmd.env("INSIDR_DIR", dir)
        .env_remove("INSIDR_CONFIG")
        .env_remove("RUST_LOG")
        .args(args);
    cmd
}

fn run(dir: &Path, args: &[&str]) -> Output {
    command(dir, args).output().expect("Failed to execute insidr")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn pipe(dir: &Path, input: &str) -> Output {
    let mut child = command(dir, &["pipe"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("Failed to spawn insidr pipe");
    child.stdin.take().unwrap().write_all(input.as_bytes()).unwrap();
    child.wait_with_output().unwrap()
}

fn events(dir: &Path, extra: &[&str]) -> Vec<serde_json::Value> {
    let mut args = vec!["events", "list", "-o", "json"];
    args.extend_from_slice(extra);
    let output = run(dir, &args);
    assert!(output.status.success());
    serde_json::from_str(&stdout(&output)).unwrap()
}

#[test]
fn test_device_id_is_stable() {
    let dir = setup();
    let first = stdout(&run(dir.path(), &["device"]));
    let second = stdout(&run(dir.path(), &["device"]));
    assert!(first.trim().starts_with("device_"));
    assert_eq!(first, second);
}

#[test]
fn test_empty_log() {
    let dir = setup();
    assert!(events(dir.path(), &[]).is_empty());
}

#[test]
fn test_pipe_passes_through_and_records() {
    let dir = setup();
    let output = pipe(dir.path(), "hello\nERROR boom\n");
    assert!(output.status.success());
    let printed = stdout(&output);
    assert!(printed.contains("hello"));

    let console = events(dir.path(), &["--type", "console"]);
    assert_eq!(console.len(), 2);
    assert_eq!(console[0]["payload"]["args"][0], "hello");
    assert_eq!(console[0]["payload"]["level"], "log");
    assert_eq!(console[1]["payload"]["level"], "error");

    let all = events(dir.path(), &[]);
    let types: Vec<&str> = all.iter().filter_map(|e| e["type"].as_str()).collect();
    assert_eq!(types.first(), Some(&"device.info"));
    assert!(types.contains(&"agent.started"));
    assert_eq!(types.last(), Some(&"agent.shutdown"));

    let last = events(dir.path(), &["--last", "1"]);
    assert_eq!(last.len(), 1);
    assert_eq!(last[0]["type"], "agent.shutdown");
}

#[test]
fn test_export_and_clear() {
    let dir = setup();
    pipe(dir.path(), "one\n");

    let exported = stdout(&run(dir.path(), &["events", "export"]));
    let parsed: Vec<serde_json::Value> = serde_json::from_str(&exported).unwrap();
    assert!(!parsed.is_empty());

    assert!(run(dir.path(), &["events", "clear"]).status.success());
    assert!(events(dir.path(), &[]).is_empty());
}

#[test]
fn test_config_show_yaml() {
    let dir = setup();
    let output = run(dir.path(), &["config", "show", "-o", "yaml"]);
    assert!(output.status.success());
    let shown: serde_yaml::Value = serde_yaml::from_str(&stdout(&output)).unwrap();
    assert_eq!(shown["capture"]["network"].as_bool(), Some(false));
    assert_eq!(shown["bufferSize"].as_u64(), Some(100));
}
