//! End-to-end checks of the three binaries' argument surfaces.
//!
//! These run the compiled binaries but stop before any container work:
//! validation errors and dry runs exercise the full flag-to-spec path
//! without needing a Docker daemon.

use assert_cmd::Command;
use predicates::prelude::*;

fn dsub() -> Command {
    Command::cargo_bin("dsub").unwrap()
}

#[test]
fn requires_command_or_script() {
    dsub()
        .assert()
        .failure()
        .stderr(predicate::str::contains("--command or --script"));
}

#[test]
fn command_and_script_conflict() {
    dsub()
        .args(["--command", "true", "--script", "missing.sh"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("mutually exclusive"));
}

#[test]
fn dry_run_prints_resolved_job() {
    let tmp = tempfile::tempdir().unwrap();
    dsub()
        .env("TMPDIR", tmp.path())
        .args([
            "--dry-run",
            "--command",
            "echo hello > ${OUT}",
            "--output",
            "OUT=file:///tmp/dsub-cli-test/out.txt",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("job_id:"))
        .stdout(predicate::str::contains("ubuntu:22.04"))
        .stdout(predicate::str::contains("out.txt"));
}

#[test]
fn rejects_bad_wildcard_path() {
    dsub()
        .args([
            "--dry-run",
            "--command",
            "true",
            "--input",
            "IN=gs://b/**/x.bam",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("**"));
}

#[test]
fn rejects_uppercase_label() {
    dsub()
        .args(["--dry-run", "--command", "true", "--label", "CAPS=v"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("lowercase"));
}

#[test]
fn unknown_provider_is_rejected() {
    dsub()
        .args(["--provider", "slurm", "--command", "true"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown provider"));
}

#[test]
fn dstat_empty_workspace_prints_header() {
    let tmp = tempfile::tempdir().unwrap();
    Command::cargo_bin("dstat")
        .unwrap()
        .env("TMPDIR", tmp.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("JOB-ID"));
}

#[test]
fn ddel_requires_a_selector() {
    Command::cargo_bin("ddel")
        .unwrap()
        .assert()
        .failure()
        .stderr(predicate::str::contains("--jobs"));
}
