//! Test collaborators for kiln-lib.
//!
//! `FakeBuilder` and `FakePublisher` stand in for the external toolchain and
//! registry client, counting calls and optionally injecting latency or
//! failures so tests can assert the pipeline's de-duplication, ordering, and
//! error behavior.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::build::{Artifact, BuildError, Builder};
use crate::publish::{Digest, PublishError, Publisher};

/// Shared call counters for a fake collaborator.
#[derive(Default)]
pub struct Counters {
  calls: AtomicUsize,
  in_flight: AtomicUsize,
  max_in_flight: AtomicUsize,
}

impl Counters {
  fn enter(&self) {
    self.calls.fetch_add(1, Ordering::SeqCst);
    let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    self.max_in_flight.fetch_max(now, Ordering::SeqCst);
  }

  fn exit(&self) {
    self.in_flight.fetch_sub(1, Ordering::SeqCst);
  }

  /// Total `build` calls observed.
  pub fn builds(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  /// Total `publish` calls observed.
  pub fn publishes(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  /// Highest number of calls observed in flight at once.
  pub fn max_in_flight(&self) -> usize {
    self.max_in_flight.load(Ordering::SeqCst)
  }
}

/// Builder test double.
///
/// Artifact identifiers embed a build sequence number, so a reference built
/// twice (after invalidation) yields a distinct artifact.
pub struct FakeBuilder {
  supported: Option<HashSet<String>>,
  failing: HashSet<String>,
  delays: HashMap<String, Duration>,
  default_delay: Option<Duration>,
  counters: Arc<Counters>,
}

impl FakeBuilder {
  /// A builder supporting exactly the given bare references.
  pub fn supporting<I, S>(refs: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      supported: Some(refs.into_iter().map(Into::into).collect()),
      failing: HashSet::new(),
      delays: HashMap::new(),
      default_delay: None,
      counters: Arc::new(Counters::default()),
    }
  }

  /// A builder supporting every reference.
  pub fn supporting_all() -> Self {
    Self {
      supported: None,
      failing: HashSet::new(),
      delays: HashMap::new(),
      default_delay: None,
      counters: Arc::new(Counters::default()),
    }
  }

  /// Fail builds of the given reference.
  pub fn failing(mut self, bare_ref: impl Into<String>) -> Self {
    self.failing.insert(bare_ref.into());
    self
  }

  /// Sleep for `delay` before completing builds of `bare_ref`.
  pub fn with_delay(mut self, bare_ref: impl Into<String>, delay: Duration) -> Self {
    self.delays.insert(bare_ref.into(), delay);
    self
  }

  /// Sleep for `delay` before completing any build without a per-ref delay.
  pub fn with_default_delay(mut self, delay: Duration) -> Self {
    self.default_delay = Some(delay);
    self
  }

  /// Handle to this builder's call counters.
  pub fn counters(&self) -> Arc<Counters> {
    self.counters.clone()
  }
}

#[async_trait]
impl Builder for FakeBuilder {
  async fn is_supported(&self, bare_ref: &str) -> bool {
    match &self.supported {
      Some(supported) => supported.contains(bare_ref),
      None => true,
    }
  }

  async fn build(&self, bare_ref: &str, cancel: &CancellationToken) -> Result<Artifact, BuildError> {
    self.counters.enter();
    let sequence = self.counters.builds();

    let delay = self.delays.get(bare_ref).copied().or(self.default_delay);
    if let Some(delay) = delay {
      tokio::select! {
        () = tokio::time::sleep(delay) => {}
        () = cancel.cancelled() => {
          self.counters.exit();
          return Err(BuildError::Cancelled(bare_ref.to_string()));
        }
      }
    }
    self.counters.exit();

    if self.failing.contains(bare_ref) {
      return Err(BuildError::CommandFailed {
        reference: bare_ref.to_string(),
        code: Some(1),
        stderr: format!("fake build failure for {bare_ref}"),
      });
    }
    Ok(Artifact::new(format!("img-{bare_ref}#{sequence}")))
  }
}

/// Publisher test double.
///
/// Digests embed a publish sequence number, so republishing after a rebuild
/// yields a distinct digest.
pub struct FakePublisher {
  failing: bool,
  delay: Option<Duration>,
  digests: Mutex<HashMap<String, Digest>>,
  counters: Arc<Counters>,
}

impl FakePublisher {
  pub fn new() -> Self {
    Self {
      failing: false,
      delay: None,
      digests: Mutex::new(HashMap::new()),
      counters: Arc::new(Counters::default()),
    }
  }

  /// Fail every publish.
  pub fn failing(mut self) -> Self {
    self.failing = true;
    self
  }

  /// Sleep for `delay` before completing each publish.
  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = Some(delay);
    self
  }

  /// Handle to this publisher's call counters.
  pub fn counters(&self) -> Arc<Counters> {
    self.counters.clone()
  }

  /// The digest most recently published for `bare_ref`.
  pub fn digest_for(&self, bare_ref: &str) -> Option<Digest> {
    self.digests.lock().unwrap().get(bare_ref).cloned()
  }
}

impl Default for FakePublisher {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl Publisher for FakePublisher {
  async fn publish(
    &self,
    _artifact: &Artifact,
    bare_ref: &str,
    cancel: &CancellationToken,
  ) -> Result<Digest, PublishError> {
    self.counters.enter();
    let sequence = self.counters.publishes();

    if let Some(delay) = self.delay {
      tokio::select! {
        () = tokio::time::sleep(delay) => {}
        () = cancel.cancelled() => {
          self.counters.exit();
          return Err(PublishError::Cancelled(bare_ref.to_string()));
        }
      }
    }
    self.counters.exit();

    if self.failing {
      return Err(PublishError::CommandFailed {
        reference: bare_ref.to_string(),
        code: Some(1),
        stderr: format!("fake publish failure for {bare_ref}"),
      });
    }

    let digest = Digest(format!("registry.example.com/{bare_ref}@sha256:{sequence:064x}"));
    self.digests.lock().unwrap().insert(bare_ref.to_string(), digest.clone());
    Ok(digest)
  }
}

/// Write an executable delegate script into `dir` and return its path.
#[cfg(unix)]
pub fn write_delegate_script(dir: &Path, name: &str, body: &str) -> PathBuf {
  use std::os::unix::fs::PermissionsExt;

  let path = dir.join(name);
  std::fs::write(&path, body).unwrap();
  std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
  path
}
