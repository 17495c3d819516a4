use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn prints_version() {
    Command::cargo_bin("reelfeed")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn prints_help() {
    Command::cargo_bin("reelfeed")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("reelfeed"))
        .stdout(predicate::str::contains("--play"))
        .stdout(predicate::str::contains("--version"));
}

#[test]
fn rejects_unknown_arguments() {
    Command::cargo_bin("reelfeed")
        .unwrap()
        .arg("--bogus")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown argument"));
}

#[test]
fn warm_needs_exactly_one_url() {
    Command::cargo_bin("reelfeed")
        .unwrap()
        .arg("--warm")
        .assert()
        .failure()
        .stderr(predicate::str::contains("exactly one url"));
}
