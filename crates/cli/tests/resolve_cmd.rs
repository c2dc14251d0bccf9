//! End-to-end tests for `kiln resolve` against stub delegate commands.

#![cfg(unix)]

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const BUILDER: &str = r#"#!/bin/sh
case "$1" in
  supports)
    [ "$2" = "example.com/app" ]
    ;;
  build)
    echo "img-$2"
    ;;
esac
"#;

const PUBLISHER: &str = r#"#!/bin/sh
[ "$1" = "publish" ] || exit 2
echo "registry.local/$3@sha256:4e1243bd22c66e76c2ba9eddc1f91394e57f9f83"
"#;

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
  use std::os::unix::fs::PermissionsExt;

  let path = dir.join(name);
  std::fs::write(&path, body).unwrap();
  std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
  path
}

struct TestEnv {
  #[allow(dead_code)]
  temp: TempDir,
  builder: PathBuf,
  publisher: PathBuf,
  manifest: PathBuf,
}

impl TestEnv {
  fn new(manifest: &str) -> Self {
    let temp = TempDir::new().unwrap();
    let builder = write_script(temp.path(), "builder.sh", BUILDER);
    let publisher = write_script(temp.path(), "publisher.sh", PUBLISHER);
    let path = temp.path().join("manifest.yaml");
    std::fs::write(&path, manifest).unwrap();
    Self {
      temp,
      builder,
      publisher,
      manifest: path,
    }
  }

  fn resolve_cmd(&self) -> Command {
    let mut cmd = Command::cargo_bin("kiln").unwrap();
    cmd
      .arg("resolve")
      .arg("-f")
      .arg(&self.manifest)
      .arg("--builder")
      .arg(&self.builder)
      .arg("--publisher")
      .arg(&self.publisher);
    cmd
  }
}

#[test]
fn resolve_rewrites_supported_references() {
  let env = TestEnv::new("image: ko://example.com/app\n");

  env
    .resolve_cmd()
    .assert()
    .success()
    .stdout(predicate::str::contains(
      "image: registry.local/example.com/app@sha256:4e1243bd22c66e76c2ba9eddc1f91394e57f9f83",
    ))
    .stdout(predicate::str::ends_with("\n---\n"));
}

#[test]
fn resolve_leaves_unsupported_strings_alone() {
  let env = TestEnv::new("image: not-a-ref\nname: web\n");

  env
    .resolve_cmd()
    .assert()
    .success()
    .stdout(predicate::str::contains("image: not-a-ref"))
    .stdout(predicate::str::contains("name: web"));
}

#[test]
fn strict_mode_fails_on_unsupported_prefixed_references() {
  let env = TestEnv::new("image: ko://unknown/x\n");

  env
    .resolve_cmd()
    .arg("--strict")
    .assert()
    .failure()
    .stderr(predicate::str::contains("ko://unknown/x"));
}

#[test]
fn selector_limits_rewriting_to_matching_documents() {
  let env = TestEnv::new(
    "metadata:\n  labels:\n    app: keep\nimage: example.com/app\n---\nmetadata:\n  name: other\nimage: example.com/app\n",
  );

  env
    .resolve_cmd()
    .args(["-l", "app=keep"])
    .assert()
    .success()
    .stdout(predicate::str::contains("@sha256:"))
    .stdout(predicate::str::contains("image: example.com/app"));
}

#[test]
fn invalid_selectors_fail_before_resolution() {
  let env = TestEnv::new("image: example.com/app\n");

  env
    .resolve_cmd()
    .args(["-l", "env in (a,b"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("selector"));
}

#[test]
fn resolve_reads_stdin_with_the_dash_filename() {
  let env = TestEnv::new("unused: doc\n");

  let mut cmd = Command::cargo_bin("kiln").unwrap();
  cmd
    .arg("resolve")
    .args(["-f", "-"])
    .arg("--builder")
    .arg(&env.builder)
    .arg("--publisher")
    .arg(&env.publisher)
    .write_stdin("image: ko://example.com/app\n")
    .assert()
    .success()
    .stdout(predicate::str::contains("@sha256:"));
}
