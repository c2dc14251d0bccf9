//! Subcommand implementations.

pub mod apply;
pub mod resolve;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use kiln_lib::build::{Builder, Caching, CommandBuilder, Limiter, default_concurrency};
use kiln_lib::publish::{self, CommandPublisher, Publisher};
use kiln_lib::resolve::Selector;
use kiln_lib::stream::{FileRecords, StreamOptions, WatchHooks, affected_handler, resolve_files_to_writer};
use kiln_lib::watch::FsNotifier;

use crate::files;

/// Flags shared by `resolve` and `apply`.
#[derive(Args, Debug)]
pub struct PipelineArgs {
  /// Manifest files, directories, or `-` for stdin
  #[arg(short, long = "filename", required = true)]
  pub filename: Vec<PathBuf>,

  /// Require references to carry the ko:// prefix and fail on unsupported ones
  #[arg(long)]
  pub strict: bool,

  /// Label selector limiting which documents are resolved
  #[arg(short = 'l', long)]
  pub selector: Option<String>,

  /// Re-resolve files when watched source roots change
  #[arg(short, long)]
  pub watch: bool,

  /// Maximum number of concurrent builds (default: number of CPUs)
  #[arg(short = 'j', long)]
  pub concurrency: Option<usize>,

  /// Builder delegate: `CMD supports REF` and `CMD build REF`
  #[arg(long, env = "KILN_BUILDER")]
  pub builder: String,

  /// Publisher delegate: `CMD publish ARTIFACT REF`
  #[arg(long, env = "KILN_PUBLISHER")]
  pub publisher: String,
}

/// Resolve the configured inputs and stream the result into `out`.
///
/// Wires the delegate builder through the limiter and the futures cache, the
/// delegate publisher through the memoizing cache, and, in watch mode, a
/// filesystem notifier whose callback invalidates and re-enqueues. Ctrl-C
/// cancels the pipeline; the orchestrator drains and returns.
pub async fn stream_resolved<W>(args: &PipelineArgs, out: W) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  let selector = args
    .selector
    .as_deref()
    .map(Selector::parse)
    .transpose()
    .context("unable to parse selector")?;

  let concurrency = args.concurrency.unwrap_or_else(default_concurrency);
  let delegate: Arc<dyn Builder> = Arc::new(CommandBuilder::new(&args.builder));
  let builder = Arc::new(Caching::new(Arc::new(Limiter::new(delegate, concurrency))));
  let publisher: Arc<dyn Publisher> =
    Arc::new(publish::Caching::new(Arc::new(CommandPublisher::new(&args.publisher))));
  debug!(concurrency, builder = %args.builder, publisher = %args.publisher, "pipeline configured");

  let cancel = CancellationToken::new();
  {
    let cancel = cancel.clone();
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        cancel.cancel();
      }
    });
  }

  let (tx, rx) = mpsc::unbounded_channel();
  let records = Arc::new(FileRecords::new());

  let watch_hooks = if args.watch {
    let handler = affected_handler(records.clone(), builder.clone(), tx.clone());
    let (notifier, errors) = FsNotifier::new(handler).context("unable to create filesystem notifier")?;
    Some(WatchHooks {
      notifier: Arc::new(notifier),
      errors,
    })
  } else {
    None
  };

  for path in files::enumerate(&args.filename)? {
    tx.send(path).ok();
  }
  if !args.watch {
    // Close the input so the orchestrator drains and terminates.
    drop(tx);
  }

  let options = StreamOptions {
    strict: args.strict,
    selector,
    watch: args.watch,
  };
  resolve_files_to_writer(builder, publisher, rx, records, options, watch_hooks, cancel, out)
    .await
    .context("resolution failed")?;
  Ok(())
}
