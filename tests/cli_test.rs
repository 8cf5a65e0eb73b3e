// file: tests/cli_test.rs
// version: 1.0.0
// guid: 4e8b2f61-9a3c-4d57-b1e0-7c2d5f8a9b36

//! Command line behaviour of the debian-cloud-images binary

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn cli() -> Command {
    let mut cmd = Command::cargo_bin("debian-cloud-images").unwrap();
    cmd.env_remove("DCI_CONFIG");
    cmd
}

#[test]
fn test_list_builds_json_on_empty_dir() {
    let dir = TempDir::new().unwrap();
    cli()
        .args(["--quiet", "list-builds", "--json"])
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::diff("[]\n"));
}

#[test]
fn test_missing_manifest_dir_fails() {
    cli()
        .args(["--quiet", "list-builds", "/nonexistent/manifests"])
        .assert()
        .failure()
        .code(1);
}

#[test]
fn test_publish_requires_root() {
    let dir = TempDir::new().unwrap();
    cli()
        .arg("publish")
        .arg(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("publish.root"));
}

#[test]
fn test_unknown_format_is_usage_error() {
    cli()
        .args(["convert", "in.tar", "out.img", "--format", "iso"])
        .assert()
        .failure()
        .code(2);
}
