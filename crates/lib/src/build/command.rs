//! Delegate builder shelling out to an external toolchain command.
//!
//! kiln does not compile anything itself. The delegate command owns that:
//! `CMD supports <bare-ref>` decides support by exit status, and
//! `CMD build <bare-ref>` prints an artifact identifier on stdout.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Artifact, BuildError, Builder};

/// Builder delegating to an external command.
pub struct CommandBuilder {
  program: String,
}

impl CommandBuilder {
  pub fn new(program: impl Into<String>) -> Self {
    Self {
      program: program.into(),
    }
  }
}

#[async_trait]
impl Builder for CommandBuilder {
  async fn is_supported(&self, bare_ref: &str) -> bool {
    let status = Command::new(&self.program)
      .arg("supports")
      .arg(bare_ref)
      .stdin(Stdio::null())
      .stdout(Stdio::null())
      .stderr(Stdio::null())
      .status()
      .await;

    matches!(status, Ok(status) if status.success())
  }

  async fn build(&self, bare_ref: &str, cancel: &CancellationToken) -> Result<Artifact, BuildError> {
    debug!(reference = bare_ref, program = %self.program, "invoking build delegate");

    let child = Command::new(&self.program)
      .arg("build")
      .arg(bare_ref)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true)
      .spawn()?;

    let output = tokio::select! {
      output = child.wait_with_output() => output?,
      () = cancel.cancelled() => return Err(BuildError::Cancelled(bare_ref.to_string())),
    };

    if !output.status.success() {
      return Err(BuildError::CommandFailed {
        reference: bare_ref.to_string(),
        code: output.status.code(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
      });
    }

    let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if id.is_empty() {
      return Err(BuildError::EmptyArtifact(bare_ref.to_string()));
    }
    Ok(Artifact::new(id))
  }
}
