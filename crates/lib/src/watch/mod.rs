//! Filesystem change notification for watch mode.
//!
//! The orchestrator registers every bare reference it builds; when a file
//! under a registered reference's source root changes, the notifier hands
//! the affected reference set to its callback. The callback (built by
//! `stream::affected_handler`) invalidates the affected build futures and
//! re-enqueues the owning manifest files.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Errors surfaced by the change notifier.
#[derive(Debug, Error)]
pub enum WatchError {
  #[error("watch error: {0}")]
  Notify(#[from] notify::Error),
}

/// Registers bare references for watching.
///
/// Constructed with an `on_affected` callback receiving the set of
/// references touched by a filesystem change. Asynchronous failures arrive
/// on an error channel handed out at construction; a value there is fatal to
/// watch mode.
pub trait ChangeNotifier: Send + Sync {
  /// Register a bare reference for watching.
  fn add(&self, bare_ref: &str) -> Result<(), WatchError>;

  /// Release all filesystem watches.
  fn shutdown(&self);
}

struct Registration {
  root: PathBuf,
  reference: String,
}

/// `notify`-backed change notifier.
///
/// A bare reference names its source root on disk; the root is watched
/// recursively and any event under it marks the reference affected.
/// References whose root does not exist are registered inert: they never
/// fire, they just sit in the table.
pub struct FsNotifier {
  watcher: Mutex<RecommendedWatcher>,
  registered: Arc<Mutex<Vec<Registration>>>,
}

impl FsNotifier {
  /// Create a notifier delivering affected reference sets to `on_affected`.
  ///
  /// The callback runs on the watcher's own thread and must not block on
  /// the orchestrator loop.
  pub fn new(
    on_affected: impl Fn(HashSet<String>) + Send + Sync + 'static,
  ) -> Result<(Self, mpsc::UnboundedReceiver<WatchError>), WatchError> {
    let registered: Arc<Mutex<Vec<Registration>>> = Arc::default();
    let (error_tx, error_rx) = mpsc::unbounded_channel();

    let lookup = registered.clone();
    let watcher = RecommendedWatcher::new(
      move |result: Result<notify::Event, notify::Error>| match result {
        Ok(event) => {
          let affected = affected_refs(&lookup.lock().unwrap(), &event.paths);
          if !affected.is_empty() {
            on_affected(affected);
          }
        }
        Err(err) => {
          let _ = error_tx.send(WatchError::Notify(err));
        }
      },
      notify::Config::default(),
    )?;

    Ok((
      Self {
        watcher: Mutex::new(watcher),
        registered,
      },
      error_rx,
    ))
  }
}

/// Map changed paths to the registered references owning them.
fn affected_refs(registered: &[Registration], paths: &[PathBuf]) -> HashSet<String> {
  let mut affected = HashSet::new();
  for path in paths {
    for registration in registered {
      if path.starts_with(&registration.root) {
        affected.insert(registration.reference.clone());
      }
    }
  }
  affected
}

impl ChangeNotifier for FsNotifier {
  fn add(&self, bare_ref: &str) -> Result<(), WatchError> {
    // Event paths come back canonicalized on some platforms; register the
    // canonical root so prefix matching lines up.
    let root = std::fs::canonicalize(bare_ref).unwrap_or_else(|_| PathBuf::from(bare_ref));

    {
      let mut registered = self.registered.lock().unwrap();
      if registered.iter().any(|r| r.reference == bare_ref) {
        return Ok(());
      }
      registered.push(Registration {
        root: root.clone(),
        reference: bare_ref.to_string(),
      });
    }

    if root.exists() {
      self.watcher.lock().unwrap().watch(&root, RecursiveMode::Recursive)?;
      debug!(reference = bare_ref, root = %root.display(), "watching source root");
    } else {
      warn!(reference = bare_ref, "source root not found; registered without a watch");
    }
    Ok(())
  }

  fn shutdown(&self) {
    let registered = self.registered.lock().unwrap();
    let mut watcher = self.watcher.lock().unwrap();
    for registration in registered.iter() {
      let _ = watcher.unwatch(&registration.root);
    }
  }
}
