//! Delegate publisher shelling out to an external registry command.
//!
//! `CMD publish <artifact-id> <bare-ref>` uploads the artifact and prints the
//! resulting digest on stdout.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Digest, PublishError, Publisher};
use crate::build::Artifact;

/// Publisher delegating to an external command.
pub struct CommandPublisher {
  program: String,
}

impl CommandPublisher {
  pub fn new(program: impl Into<String>) -> Self {
    Self {
      program: program.into(),
    }
  }
}

#[async_trait]
impl Publisher for CommandPublisher {
  async fn publish(
    &self,
    artifact: &Artifact,
    bare_ref: &str,
    cancel: &CancellationToken,
  ) -> Result<Digest, PublishError> {
    debug!(reference = bare_ref, program = %self.program, "invoking publish delegate");

    let child = Command::new(&self.program)
      .arg("publish")
      .arg(artifact.id())
      .arg(bare_ref)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true)
      .spawn()?;

    let output = tokio::select! {
      output = child.wait_with_output() => output?,
      () = cancel.cancelled() => return Err(PublishError::Cancelled(bare_ref.to_string())),
    };

    if !output.status.success() {
      return Err(PublishError::CommandFailed {
        reference: bare_ref.to_string(),
        code: output.status.code(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
      });
    }

    let digest = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if digest.is_empty() {
      return Err(PublishError::EmptyDigest(bare_ref.to_string()));
    }
    Ok(Digest(digest))
  }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
  use tempfile::TempDir;

  use super::*;
  use crate::util::testutil::write_delegate_script;

  const DELEGATE: &str = r#"#!/bin/sh
[ "$1" = "publish" ] || exit 2
case "$2" in
  img-*)
    echo "registry.example.com/$3@sha256:0123456789abcdef"
    ;;
  *)
    echo "unknown artifact $2" >&2
    exit 4
    ;;
esac
"#;

  fn delegate(dir: &TempDir) -> CommandPublisher {
    let script = write_delegate_script(dir.path(), "publisher", DELEGATE);
    CommandPublisher::new(script.display().to_string())
  }

  #[tokio::test]
  async fn publish_parses_the_digest_from_stdout() {
    let dir = TempDir::new().unwrap();
    let publisher = delegate(&dir);
    let cancel = CancellationToken::new();

    let digest = publisher
      .publish(&Artifact::new("img-app"), "example.com/app", &cancel)
      .await
      .unwrap();
    assert_eq!(digest.0, "registry.example.com/example.com/app@sha256:0123456789abcdef");
  }

  #[tokio::test]
  async fn publish_failure_carries_exit_code_and_stderr() {
    let dir = TempDir::new().unwrap();
    let publisher = delegate(&dir);
    let cancel = CancellationToken::new();

    let err = publisher
      .publish(&Artifact::new("bogus"), "example.com/app", &cancel)
      .await
      .unwrap_err();
    match err {
      PublishError::CommandFailed { code, stderr, .. } => {
        assert_eq!(code, Some(4));
        assert!(stderr.contains("unknown artifact bogus"));
      }
      other => panic!("unexpected error: {other}"),
    }
  }
}
