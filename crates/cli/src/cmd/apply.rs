//! Implementation of the `kiln apply` command.
//!
//! Resolves the input files exactly like `kiln resolve`, but pipes the
//! resolved stream into kubectl's stdin instead of printing it.

use std::process::Stdio;

use anyhow::{Context, Result, anyhow, bail};
use clap::Args;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::info;

use super::{PipelineArgs, stream_resolved};

/// kubectl buffers a chunk of input before acting on it, which delays the
/// first resources. Priming the stream with empty documents that kubectl
/// discards works around the buffering.
const PRIME_SEPARATORS: usize = 1000;

#[derive(Args, Debug)]
pub struct ApplyArgs {
  #[command(flatten)]
  pub pipeline: PipelineArgs,

  /// kubectl verb fed the resolved stream
  #[arg(long, default_value = "apply", value_parser = ["apply", "create"])]
  pub kubectl_verb: String,

  /// Extra arguments passed through to kubectl
  #[arg(last = true)]
  pub kubectl_args: Vec<String>,
}

/// Resolve the input files and feed the result to `kubectl <verb> -f -`.
pub fn run(args: ApplyArgs) -> Result<()> {
  let rt = tokio::runtime::Runtime::new().context("failed to create async runtime")?;
  rt.block_on(async {
    let mut kubectl = Command::new("kubectl")
      .arg(&args.kubectl_verb)
      .arg("-f")
      .arg("-")
      .args(&args.kubectl_args)
      .stdin(Stdio::piped())
      .spawn()
      .context("unable to spawn kubectl")?;

    let mut stdin = kubectl.stdin.take().ok_or_else(|| anyhow!("kubectl stdin unavailable"))?;
    for _ in 0..PRIME_SEPARATORS {
      stdin.write_all(b"---\n").await.context("unable to prime kubectl")?;
    }

    // Stream resolved documents into kubectl while it runs; the orchestrator
    // closes stdin when the stream ends, which lets kubectl finish.
    let (streamed, waited) = tokio::join!(stream_resolved(&args.pipeline, stdin), kubectl.wait());

    streamed?;
    let status = waited.context("kubectl did not run")?;
    if !status.success() {
      bail!("kubectl {} exited with {}", args.kubectl_verb, status);
    }
    info!(verb = %args.kubectl_verb, "kubectl finished");
    Ok(())
  })
}
