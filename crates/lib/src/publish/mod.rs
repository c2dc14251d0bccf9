//! Publisher contract and wrappers.
//!
//! The `Publisher` trait is the narrow seam to an external registry client:
//! it uploads a built artifact and hands back the content-addressed digest
//! that replaces the reference in the manifest. `Caching` memoizes publishes;
//! `CommandPublisher` delegates to an external command.

pub mod cache;
pub mod command;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::build::Artifact;

pub use cache::Caching;
pub use command::CommandPublisher;

/// A content-addressed image identifier, canonically `name@sha256:<hex>`.
///
/// kiln is agnostic to the digest's shape and stores it verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Digest(pub String);

impl fmt::Display for Digest {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Errors that can occur while publishing an artifact.
#[derive(Debug, Error)]
pub enum PublishError {
  /// The delegate publish command exited unsuccessfully.
  #[error("publish command exited with {code:?} for {reference}: {stderr}")]
  CommandFailed {
    reference: String,
    code: Option<i32>,
    stderr: String,
  },

  /// The delegate publish command printed no digest.
  #[error("publish command produced no digest for {0}")]
  EmptyDigest(String),

  /// Failed to spawn or talk to the delegate command.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  /// The publish was cancelled before completing.
  #[error("publish cancelled for {0}")]
  Cancelled(String),

  /// Outcome shared with other waiters through the publish cache.
  #[error("{0}")]
  Shared(Arc<PublishError>),

  /// The publish task died without reporting an outcome.
  #[error("publish task for {0} ended without an outcome")]
  Lost(String),
}

/// Narrow interface to an external registry client.
#[async_trait]
pub trait Publisher: Send + Sync {
  /// Upload `artifact` for `bare_ref`, returning the published digest.
  ///
  /// Implementations abort promptly when `cancel` fires.
  async fn publish(
    &self,
    artifact: &Artifact,
    bare_ref: &str,
    cancel: &CancellationToken,
  ) -> Result<Digest, PublishError>;
}
