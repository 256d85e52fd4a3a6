//! CLI tests for `bench`.
//!
//! Spawns the binary against descriptor trees in a temp dir and checks exit
//! codes. Nothing here reaches a container runtime.

use std::path::Path;
use std::process::{Command, Output};

use harness::core::descriptor::Difficulty;
use harness::exit_codes;
use harness::test_support::{write_agent_dir, write_task_dir};

fn fixture() -> tempfile::TempDir {
    let temp = tempfile::tempdir().expect("tempdir");
    write_agent_dir(&temp.path().join("agents"), "claude", &[]);
    write_agent_dir(&temp.path().join("agents"), "codex", &["beta"]);
    write_task_dir(&temp.path().join("tasks"), "calc", Difficulty::Easy, &[]);
    write_task_dir(&temp.path().join("tasks"), "compiler", Difficulty::Hard, &[]);
    temp
}

fn bench(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_bench"))
        .current_dir(dir)
        .args(args)
        .output()
        .expect("spawn bench")
}

#[test]
fn list_prints_filtered_pairs() {
    let temp = fixture();
    let output = bench(
        temp.path(),
        &["list", "--agent-filter", "tag!=beta", "--task-filter", "difficulty=hard"],
    );

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("claude\tcompiler\thard"));
    assert!(!stdout.contains("codex"));
    assert!(stdout.contains("list: pairs=1"));
}

#[test]
fn unknown_filter_attribute_is_invalid() {
    let temp = fixture();
    let output = bench(temp.path(), &["list", "--task-filter", "colour=red"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("colour"));
}

#[test]
fn malformed_filter_fails_run_before_scheduling() {
    let temp = fixture();
    let output = bench(temp.path(), &["run", "--agent-filter", "name"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(!temp.path().join("runs").exists());
}

#[test]
fn empty_selection_runs_nothing() {
    let temp = fixture();
    let output = bench(temp.path(), &["run", "--task-filter", "name=missing"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert!(String::from_utf8_lossy(&output.stdout).contains("nothing selected"));
    assert!(!temp.path().join("runs").exists());
}

#[test]
fn missing_descriptor_directory_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = bench(temp.path(), &["list"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
}

#[test]
fn bad_config_is_invalid() {
    let temp = fixture();
    std::fs::write(temp.path().join("bench.toml"), "max_parallel = 0\n").expect("write config");
    let output = bench(temp.path(), &["run"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
}
