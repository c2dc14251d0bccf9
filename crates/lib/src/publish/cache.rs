//! Memoizing publisher.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Digest, PublishError, Publisher};
use crate::build::Artifact;

/// Shared outcome of one reference's publish.
type Outcome = Result<Digest, Arc<PublishError>>;

struct Entry {
  artifact: Artifact,
  rx: watch::Receiver<Option<Outcome>>,
}

/// Publisher wrapper that publishes a given (artifact, reference) pair at
/// most once.
///
/// Entries are keyed by bare reference; the artifact for a reference is the
/// product of its cached build, so a repeat call with the same artifact
/// returns the stored digest without contacting the publisher. When the
/// artifact for a reference changes (its build future was invalidated and
/// rebuilt), the entry is replaced and a fresh publish runs.
pub struct Caching {
  inner: Arc<dyn Publisher>,
  entries: Mutex<HashMap<String, Entry>>,
}

impl Caching {
  pub fn new(inner: Arc<dyn Publisher>) -> Self {
    Self {
      inner,
      entries: Mutex::new(HashMap::new()),
    }
  }

  fn subscribe(
    &self,
    artifact: &Artifact,
    bare_ref: &str,
    cancel: &CancellationToken,
  ) -> watch::Receiver<Option<Outcome>> {
    let mut entries = self.entries.lock().unwrap();
    if let Some(entry) = entries.get(bare_ref)
      && entry.artifact == *artifact
    {
      return entry.rx.clone();
    }

    let (tx, rx) = watch::channel(None);
    entries.insert(
      bare_ref.to_string(),
      Entry {
        artifact: artifact.clone(),
        rx: rx.clone(),
      },
    );

    let inner = self.inner.clone();
    let artifact = artifact.clone();
    let reference = bare_ref.to_string();
    let cancel = cancel.clone();
    tokio::spawn(async move {
      debug!(reference = %reference, "starting publish");
      let outcome = inner.publish(&artifact, &reference, &cancel).await.map_err(Arc::new);
      let _ = tx.send(Some(outcome));
    });

    rx
  }
}

#[async_trait]
impl Publisher for Caching {
  async fn publish(
    &self,
    artifact: &Artifact,
    bare_ref: &str,
    cancel: &CancellationToken,
  ) -> Result<Digest, PublishError> {
    let mut rx = self.subscribe(artifact, bare_ref, cancel);
    let outcome = rx
      .wait_for(|outcome| outcome.is_some())
      .await
      .map_err(|_| PublishError::Lost(bare_ref.to_string()))?;

    match outcome.as_ref() {
      Some(Ok(digest)) => Ok(digest.clone()),
      Some(Err(err)) => Err(PublishError::Shared(err.clone())),
      None => Err(PublishError::Lost(bare_ref.to_string())),
    }
  }
}
