//! Builder contract and wrappers.
//!
//! The `Builder` trait is the narrow seam to the external toolchain that
//! turns a bare source reference into a container image. The submodules
//! compose around any builder:
//! - `Limiter` caps the number of concurrent builds
//! - `Caching` shares one in-flight build per reference and supports
//!   invalidation
//! - `Recorder` records which references a resolution built
//! - `CommandBuilder` delegates to an external command

pub mod cache;
pub mod command;
pub mod limit;
pub mod record;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use cache::Caching;
pub use command::CommandBuilder;
pub use limit::{Limiter, default_concurrency};
pub use record::Recorder;

/// An opaque, built, not-yet-published container image.
///
/// The identifier's shape is owned by the builder; publishers consume it
/// verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
  id: String,
}

impl Artifact {
  pub fn new(id: impl Into<String>) -> Self {
    Self { id: id.into() }
  }

  /// Builder-assigned identifier for the image.
  pub fn id(&self) -> &str {
    &self.id
  }
}

/// Errors that can occur while building a reference.
#[derive(Debug, Error)]
pub enum BuildError {
  /// The delegate build command exited unsuccessfully.
  #[error("build command exited with {code:?} for {reference}: {stderr}")]
  CommandFailed {
    reference: String,
    code: Option<i32>,
    stderr: String,
  },

  /// The delegate build command printed no artifact identifier.
  #[error("build command produced no artifact for {0}")]
  EmptyArtifact(String),

  /// Failed to spawn or talk to the delegate command.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  /// The build was cancelled before completing.
  #[error("build cancelled for {0}")]
  Cancelled(String),

  /// Outcome shared with other waiters through the build cache.
  #[error("{0}")]
  Shared(Arc<BuildError>),

  /// The build task died without reporting an outcome.
  #[error("build task for {0} ended without an outcome")]
  Lost(String),
}

/// Narrow interface to an external compiler.
///
/// `is_supported` is a cheap predicate deciding whether a bare reference
/// names a buildable source root; `build` may be expensive. Errors are
/// surfaced verbatim and never retried.
#[async_trait]
pub trait Builder: Send + Sync {
  /// Does `bare_ref` name a buildable source root?
  async fn is_supported(&self, bare_ref: &str) -> bool;

  /// Build an image for `bare_ref`.
  ///
  /// Implementations abort promptly when `cancel` fires.
  async fn build(&self, bare_ref: &str, cancel: &CancellationToken) -> Result<Artifact, BuildError>;
}
