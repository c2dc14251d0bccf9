//! Concurrency limiting for builds.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::{Artifact, BuildError, Builder};

/// Number of CPUs, used as the default build concurrency.
pub fn default_concurrency() -> usize {
  std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4)
}

/// Builder wrapper gating `build` through a semaphore.
///
/// `is_supported` passes through unblocked.
pub struct Limiter {
  inner: Arc<dyn Builder>,
  semaphore: Semaphore,
}

impl Limiter {
  /// Wrap `inner`, allowing at most `concurrency` builds in flight.
  pub fn new(inner: Arc<dyn Builder>, concurrency: usize) -> Self {
    Self {
      inner,
      semaphore: Semaphore::new(concurrency.max(1)),
    }
  }
}

#[async_trait]
impl Builder for Limiter {
  async fn is_supported(&self, bare_ref: &str) -> bool {
    self.inner.is_supported(bare_ref).await
  }

  async fn build(&self, bare_ref: &str, cancel: &CancellationToken) -> Result<Artifact, BuildError> {
    let _permit = self.semaphore.acquire().await.unwrap();
    self.inner.build(bare_ref, cancel).await
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::*;
  use crate::util::testutil::FakeBuilder;

  #[tokio::test]
  async fn caps_concurrent_builds() {
    let inner = FakeBuilder::supporting_all().with_default_delay(Duration::from_millis(20));
    let counters = inner.counters();
    let limiter = Arc::new(Limiter::new(Arc::new(inner), 2));
    let cancel = CancellationToken::new();

    let mut handles = Vec::new();
    for i in 0..6 {
      let limiter = limiter.clone();
      let cancel = cancel.clone();
      handles.push(tokio::spawn(async move {
        limiter.build(&format!("example.com/app-{i}"), &cancel).await
      }));
    }
    for handle in handles {
      handle.await.unwrap().unwrap();
    }

    assert_eq!(counters.builds(), 6);
    assert!(counters.max_in_flight() <= 2, "max in flight was {}", counters.max_in_flight());
  }

  #[tokio::test]
  async fn is_supported_is_not_gated() {
    let inner = FakeBuilder::supporting(["example.com/app"]);
    // Zero would deadlock builds forever; the constructor clamps to one.
    let limiter = Limiter::new(Arc::new(inner), 0);

    assert!(limiter.is_supported("example.com/app").await);
  }

  #[tokio::test]
  async fn errors_pass_through_verbatim() {
    let inner = FakeBuilder::supporting(["example.com/app"]).failing("example.com/app");
    let limiter = Limiter::new(Arc::new(inner), 4);
    let cancel = CancellationToken::new();

    let err = limiter.build("example.com/app", &cancel).await.unwrap_err();
    assert!(matches!(err, BuildError::CommandFailed { .. }));
  }
}
