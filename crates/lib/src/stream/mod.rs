//! Order-preserving streaming of resolved files to an output sink.
//!
//! The orchestrator consumes filenames from a channel, resolves each file in
//! its own task, and writes the resolved bytes to the sink strictly in the
//! order the filenames arrived. Each arriving filename gets a single-shot
//! result slot appended to a FIFO; only the head slot is ever awaited, so a
//! fast file never overtakes a slow predecessor. The consumer downstream is
//! sensitive to object boundaries, so every batch is terminated with its
//! separator before the next one starts.
//!
//! With a change notifier attached, the orchestrator records which bare
//! references each file built and registers them for watching. When the
//! notifier reports affected references, the intersecting build futures are
//! invalidated first and the owning filenames re-enqueued second, so a new
//! resolution can never observe a stale future.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::build::{Caching, Recorder};
use crate::publish::Publisher;
use crate::resolve::{ResolveError, Selector, resolve_documents};
use crate::watch::{ChangeNotifier, WatchError};

/// Separator written after every resolved batch.
///
/// The separator goes out last so the downstream consumer knows the resource
/// is complete and may act on it.
const DOC_SEPARATOR: &[u8] = b"\n---\n";

/// Errors that terminate the stream.
#[derive(Debug, Error)]
pub enum StreamError {
  #[error("error processing import paths in {path:?}: {source}")]
  File {
    path: PathBuf,
    #[source]
    source: ResolveError,
  },

  #[error("unable to read {path:?}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("write to output sink failed: {0}")]
  Sink(#[from] std::io::Error),

  #[error("error watching dependencies: {0}")]
  Watch(#[from] WatchError),
}

/// Options for [`resolve_files_to_writer`].
#[derive(Debug, Default, Clone)]
pub struct StreamOptions {
  /// Require references to carry the `ko://` prefix and be buildable.
  pub strict: bool,

  /// Label selector limiting which documents are resolved.
  pub selector: Option<Selector>,

  /// Keep running after per-file errors instead of failing the stream.
  pub watch: bool,
}

/// Everything the orchestrator needs from watch mode.
pub struct WatchHooks {
  /// Registers built references for filesystem watching.
  pub notifier: Arc<dyn ChangeNotifier>,

  /// Asynchronous notifier failures; a value here is fatal.
  pub errors: mpsc::UnboundedReceiver<WatchError>,
}

/// Map from resolved file to the bare references its resolution built.
///
/// Written by the orchestrator after each resolution; read by the notifier
/// callback to decide which files a changed reference affects. Grows
/// monotonically over the life of a watch.
#[derive(Default)]
pub struct FileRecords {
  map: Mutex<HashMap<PathBuf, Vec<String>>>,
}

impl FileRecords {
  pub fn new() -> Self {
    Self::default()
  }

  fn record(&self, path: &Path, refs: Vec<String>) {
    self.map.lock().unwrap().insert(path.to_path_buf(), refs);
  }

  /// Handle a set of affected references reported by the change notifier.
  ///
  /// For every file whose recorded references intersect `affected`, the
  /// intersecting build futures are invalidated before the filename is
  /// re-sent, so the re-resolution cannot pick up a stale future. The map is
  /// snapshotted first; the callback never runs builder or channel work
  /// under the map lock.
  pub fn on_affected(&self, affected: &HashSet<String>, builder: &Caching, files: &mpsc::UnboundedSender<PathBuf>) {
    let snapshot: Vec<(PathBuf, Vec<String>)> = {
      let map = self.map.lock().unwrap();
      map.iter().map(|(path, refs)| (path.clone(), refs.clone())).collect()
    };

    for (path, refs) in snapshot {
      let mut hit = false;
      for reference in refs.iter().filter(|r| affected.contains(r.as_str())) {
        builder.invalidate(reference);
        hit = true;
      }
      if hit {
        info!(file = %path.display(), "re-resolving after dependency change");
        let _ = files.send(path);
      }
    }
  }
}

/// Build the `on_affected` callback to hand to a change notifier.
pub fn affected_handler(
  records: Arc<FileRecords>,
  builder: Arc<Caching>,
  files: mpsc::UnboundedSender<PathBuf>,
) -> impl Fn(HashSet<String>) + Send + Sync + 'static {
  move |affected| records.on_affected(&affected, &builder, &files)
}

type Slot = oneshot::Receiver<Result<Vec<u8>, StreamError>>;

/// Resolve filenames arriving on `files` and write each resolved batch, in
/// arrival order, to `out` followed by a `\n---\n` separator.
///
/// The loop alternates between accepting new filenames (spawning a resolver
/// task per file) and consuming the head result slot. When the filename
/// channel closes, no new work is accepted but the FIFO drains before the
/// sink is shut down. Cancellation stops intake and drains likewise.
///
/// Error policy: in one-shot mode the first resolver error terminates the
/// stream; in watch mode resolver errors are logged and processing
/// continues. A value on the watch error channel is always fatal.
#[allow(clippy::too_many_arguments)]
pub async fn resolve_files_to_writer<W>(
  builder: Arc<Caching>,
  publisher: Arc<dyn Publisher>,
  mut files: mpsc::UnboundedReceiver<PathBuf>,
  records: Arc<FileRecords>,
  options: StreamOptions,
  mut watch_hooks: Option<WatchHooks>,
  cancel: CancellationToken,
  mut out: W,
) -> Result<(), StreamError>
where
  W: AsyncWrite + Unpin,
{
  let mut pending: VecDeque<Slot> = VecDeque::new();
  let mut open = true;

  loop {
    match pending.pop_front() {
      None if !open => break,

      // Nothing in flight: wait for intake only.
      None => {
        tokio::select! {
          maybe = files.recv() => match maybe {
            Some(path) => {
              let slot = spawn_resolution(path, &builder, &publisher, &records, &options, watch_hooks.as_ref(), &cancel);
              pending.push_back(slot);
            }
            None => open = false,
          },
          Some(err) = next_watch_error(&mut watch_hooks) => return Err(StreamError::Watch(err)),
          () = cancel.cancelled(), if open => {
            debug!("cancelled; draining in-flight resolutions");
            files.close();
            open = false;
          }
        }
      }

      // Listen to the head slot in addition to intake; only the head may
      // write, which is what preserves arrival order.
      Some(mut head) => {
        tokio::select! {
          maybe = files.recv(), if open => {
            match maybe {
              Some(path) => {
                let slot = spawn_resolution(path, &builder, &publisher, &records, &options, watch_hooks.as_ref(), &cancel);
                pending.push_back(slot);
              }
              None => open = false,
            }
            pending.push_front(head);
          }
          result = &mut head => match result {
            Ok(Ok(bytes)) => {
              out.write_all(&bytes).await?;
              out.write_all(DOC_SEPARATOR).await?;
            }
            Ok(Err(err)) => {
              if options.watch {
                // Per-file failures must not disrupt the watch.
                error!(error = %err, "resolution failed");
              } else {
                return Err(err);
              }
            }
            Err(_) => error!("resolution task dropped without reporting"),
          },
          Some(err) = next_watch_error(&mut watch_hooks) => return Err(StreamError::Watch(err)),
          () = cancel.cancelled(), if open => {
            debug!("cancelled; draining in-flight resolutions");
            files.close();
            open = false;
            pending.push_front(head);
          }
        }
      }
    }
  }

  out.shutdown().await?;
  if let Some(hooks) = &watch_hooks {
    hooks.notifier.shutdown();
  }
  Ok(())
}

async fn next_watch_error(hooks: &mut Option<WatchHooks>) -> Option<WatchError> {
  match hooks {
    Some(hooks) => hooks.errors.recv().await,
    None => std::future::pending().await,
  }
}

fn spawn_resolution(
  path: PathBuf,
  builder: &Arc<Caching>,
  publisher: &Arc<dyn Publisher>,
  records: &Arc<FileRecords>,
  options: &StreamOptions,
  watch_hooks: Option<&WatchHooks>,
  cancel: &CancellationToken,
) -> Slot {
  let builder = builder.clone();
  let publisher = publisher.clone();
  let records = records.clone();
  let notifier = watch_hooks.map(|hooks| hooks.notifier.clone());
  let strict = options.strict;
  let selector = options.selector.clone();
  let cancel = cancel.clone();

  let (tx, rx) = oneshot::channel();
  tokio::spawn(async move {
    let result = resolve_one(
      &path,
      builder,
      publisher,
      &records,
      notifier.as_deref(),
      strict,
      selector.as_ref(),
      &cancel,
    )
    .await;
    let _ = tx.send(result);
  });
  rx
}

/// Resolve a single file: read it, resolve its documents, and in watch mode
/// record and register the references its resolution built.
#[allow(clippy::too_many_arguments)]
async fn resolve_one(
  path: &Path,
  builder: Arc<Caching>,
  publisher: Arc<dyn Publisher>,
  records: &FileRecords,
  notifier: Option<&dyn ChangeNotifier>,
  strict: bool,
  selector: Option<&Selector>,
  cancel: &CancellationToken,
) -> Result<Vec<u8>, StreamError> {
  let input = read_input(path).await.map_err(|source| StreamError::Read {
    path: path.to_path_buf(),
    source,
  })?;

  // Record the builds done on behalf of this file.
  let recorder = Arc::new(Recorder::new(builder));
  let bytes = resolve_documents(&input, strict, selector, recorder.clone(), publisher, cancel)
    .await
    .map_err(|source| StreamError::File {
      path: path.to_path_buf(),
      source,
    })?;

  let built = recorder.recorded();
  if let Some(notifier) = notifier {
    for reference in &built {
      notifier.add(reference)?;
    }
  }
  records.record(path, built);

  Ok(bytes)
}

/// Read a file's bytes; the filename `-` means stdin.
async fn read_input(path: &Path) -> std::io::Result<Vec<u8>> {
  if path == Path::new("-") {
    let mut buf = Vec::new();
    tokio::io::stdin().read_to_end(&mut buf).await?;
    return Ok(buf);
  }
  tokio::fs::read(path).await
}
