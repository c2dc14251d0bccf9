//! Build futures cache.
//!
//! `Caching` wraps a builder so that concurrent requests for the same bare
//! reference share a single underlying build, and so that watch mode can
//! invalidate a reference's result before re-resolving the files that use it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Artifact, BuildError, Builder};

/// Shared outcome of one reference's build.
type Outcome = Result<Artifact, Arc<BuildError>>;

/// Builder wrapper sharing one in-flight build per reference.
///
/// State machine per reference: absent, pending, then ready or failed.
/// `build` creates the future on first call and subscribes later callers to
/// it; all waiters observe the same outcome, including failures, which stay
/// cached until invalidated. `invalidate` returns the reference to absent so
/// the next call starts a fresh build; callers already waiting on the old
/// future still see its eventual outcome.
pub struct Caching {
  inner: Arc<dyn Builder>,
  futures: Mutex<HashMap<String, watch::Receiver<Option<Outcome>>>>,
}

impl Caching {
  pub fn new(inner: Arc<dyn Builder>) -> Self {
    Self {
      inner,
      futures: Mutex::new(HashMap::new()),
    }
  }

  /// Drop the current future for `bare_ref`, if any.
  ///
  /// The next `build` call for the reference starts a new underlying build.
  /// An in-flight build keeps running, but its result is only visible to
  /// callers that subscribed before the invalidation.
  pub fn invalidate(&self, bare_ref: &str) {
    let mut futures = self.futures.lock().unwrap();
    if futures.remove(bare_ref).is_some() {
      debug!(reference = bare_ref, "invalidated build future");
    }
  }

  /// Subscribe to the future for `bare_ref`, creating it if absent.
  ///
  /// Creation and recording of the future happen under the map lock, so two
  /// racing callers never start two builds.
  fn subscribe(&self, bare_ref: &str, cancel: &CancellationToken) -> watch::Receiver<Option<Outcome>> {
    let mut futures = self.futures.lock().unwrap();
    if let Some(rx) = futures.get(bare_ref) {
      return rx.clone();
    }

    let (tx, rx) = watch::channel(None);
    futures.insert(bare_ref.to_string(), rx.clone());

    let inner = self.inner.clone();
    let reference = bare_ref.to_string();
    let cancel = cancel.clone();
    tokio::spawn(async move {
      debug!(reference = %reference, "starting build");
      let outcome = inner.build(&reference, &cancel).await.map_err(Arc::new);
      // Every receiver may be gone by now (batch abandoned); ignore.
      let _ = tx.send(Some(outcome));
    });

    rx
  }
}

#[async_trait]
impl Builder for Caching {
  async fn is_supported(&self, bare_ref: &str) -> bool {
    self.inner.is_supported(bare_ref).await
  }

  async fn build(&self, bare_ref: &str, cancel: &CancellationToken) -> Result<Artifact, BuildError> {
    let mut rx = self.subscribe(bare_ref, cancel);
    let outcome = rx
      .wait_for(|outcome| outcome.is_some())
      .await
      .map_err(|_| BuildError::Lost(bare_ref.to_string()))?;

    match outcome.as_ref() {
      Some(Ok(artifact)) => Ok(artifact.clone()),
      Some(Err(err)) => Err(BuildError::Shared(err.clone())),
      None => Err(BuildError::Lost(bare_ref.to_string())),
    }
  }
}
