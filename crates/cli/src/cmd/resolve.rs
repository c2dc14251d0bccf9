//! Implementation of the `kiln resolve` command.

use anyhow::{Context, Result};
use clap::Args;

use super::{PipelineArgs, stream_resolved};

#[derive(Args, Debug)]
pub struct ResolveArgs {
  #[command(flatten)]
  pub pipeline: PipelineArgs,
}

/// Resolve the input files and print the rewritten documents on stdout.
pub fn run(args: ResolveArgs) -> Result<()> {
  let rt = tokio::runtime::Runtime::new().context("failed to create async runtime")?;
  rt.block_on(stream_resolved(&args.pipeline, tokio::io::stdout()))
}
