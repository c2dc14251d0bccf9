//! kiln: resolve source references in YAML manifests to image digests.
//!
//! Subcommands:
//! - `kiln resolve -f FILE...` prints the input files with references
//!   resolved to built and published image digests
//! - `kiln apply -f FILE...` pipes the resolved stream into `kubectl apply`

mod cmd;
mod files;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "kiln", version)]
#[command(about = "Resolve source references in manifests to published image digests")]
struct Cli {
  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Print the input files with references resolved to image digests
  Resolve(cmd::resolve::ResolveArgs),

  /// Resolve the input files and feed the result to kubectl
  Apply(cmd::apply::ApplyArgs),
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
  // Logs go to stderr; stdout carries the resolved document stream.
  FmtSubscriber::builder()
    .with_max_level(level)
    .with_target(false)
    .without_time()
    .with_writer(std::io::stderr)
    .init();

  match cli.command {
    Commands::Resolve(args) => cmd::resolve::run(args),
    Commands::Apply(args) => cmd::apply::run(args),
  }
}
