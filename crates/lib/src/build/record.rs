//! Recording builder.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{Artifact, BuildError, Builder};

/// Builder wrapper recording the bare references built through it.
///
/// The stream orchestrator uses one per file to learn which references a
/// file's resolution built, which is what watch mode keys re-resolution on.
pub struct Recorder {
  inner: Arc<dyn Builder>,
  refs: Mutex<Vec<String>>,
}

impl Recorder {
  pub fn new(inner: Arc<dyn Builder>) -> Self {
    Self {
      inner,
      refs: Mutex::new(Vec::new()),
    }
  }

  /// Bare references built through this recorder, in call order.
  pub fn recorded(&self) -> Vec<String> {
    self.refs.lock().unwrap().clone()
  }
}

#[async_trait]
impl Builder for Recorder {
  async fn is_supported(&self, bare_ref: &str) -> bool {
    self.inner.is_supported(bare_ref).await
  }

  async fn build(&self, bare_ref: &str, cancel: &CancellationToken) -> Result<Artifact, BuildError> {
    self.refs.lock().unwrap().push(bare_ref.to_string());
    self.inner.build(bare_ref, cancel).await
  }
}
