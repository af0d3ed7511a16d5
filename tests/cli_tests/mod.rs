use assert_cmd::Command;
use predicates::prelude::*;

fn limitbox() -> Command {
    Command::cargo_bin("limitbox").expect("limitbox binary")
}

#[test]
fn test_supports_lists_every_feature() {
    limitbox()
        .arg("supports")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"wall_time\": true"))
        .stdout(predicate::str::contains("\"memory\""))
        .stdout(predicate::str::contains("\"decorator\""));
}

#[test]
fn test_supports_rejects_unknown_feature() {
    limitbox()
        .args(["supports", "gpu"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("gpu"));
}

#[test]
fn test_tasks_lists_registry() {
    limitbox()
        .arg("tasks")
        .assert()
        .success()
        .stdout(predicate::str::contains("echo"))
        .stdout(predicate::str::contains("allocate"));
}

#[test]
fn test_run_echo_succeeds() {
    limitbox()
        .args(["run", "echo", "--", "apple"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"status\": \"success\""))
        .stdout(predicate::str::contains("\"value\": \"apple\""));
}

#[test]
fn test_run_wall_limit_fails() {
    limitbox()
        .args(["run", "--wall", "1s", "sleep", "--", "5"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("wall time exceeded"));
}

#[test]
fn test_run_in_fresh_process_mode() {
    limitbox()
        .args(["run", "--mode", "spawn", "echo", "--", "42"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"value\": 42"))
        .stdout(predicate::str::contains("\"spawn_mode\": \"fresh-process\""));
}

#[test]
fn test_run_captures_command_output() {
    limitbox()
        .args(["run", "--capture", "print", "--", "captured"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"stdout\": \"captured"));
}

#[test]
fn test_run_unknown_task() {
    limitbox()
        .args(["run", "nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown task"));
}

#[test]
fn test_spawn_mode_from_environment() {
    limitbox()
        .env("LIMITBOX_SPAWN_MODE", "forkserver")
        .args(["run", "echo", "--", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"spawn_mode\": \"pre-forked-pool\""));
}

#[test]
fn test_bad_memory_literal() {
    limitbox()
        .args(["run", "--mem", "lots", "echo"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid memory literal"));
}
