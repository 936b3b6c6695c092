//! CLI smoke tests for the `sparlo` binary.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

fn sparlo() -> Command {
    cargo_bin_cmd!("sparlo")
}

#[test]
fn test_help_lists_subcommands() {
    sparlo()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("submit"))
        .stdout(predicate::str::contains("clarify"));
}

#[test]
fn test_version() {
    sparlo().arg("--version").assert().success();
}

#[test]
fn test_phases_lists_all_catalogs() {
    sparlo()
        .arg("phases")
        .assert()
        .success()
        .stdout(predicate::str::contains("framing"))
        .stdout(predicate::str::contains("due_diligence"))
        .stdout(predicate::str::contains("report"));
}

#[test]
fn test_clarify_rejects_answer_with_skip() {
    sparlo()
        .args(["clarify", "run-1", "--answer", "x", "--skip"])
        .assert()
        .failure();
}

#[test]
fn test_unknown_subcommand_fails() {
    sparlo().arg("frobnicate").assert().failure();
}
