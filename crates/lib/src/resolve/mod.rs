//! Per-batch document resolution.
//!
//! A batch is the raw bytes of one input file, holding one or more YAML
//! documents. Resolution runs in phases:
//!
//! 1. Parse the batch into document trees; selector-filter which documents
//!    are in scope (filtered documents still pass through to the output).
//! 2. Discover: walk every in-scope document and index the supported
//!    references by bare reference.
//! 3. Resolve: build and publish each distinct reference in parallel.
//! 4. Rewrite every indexed node with its reference's digest.
//! 5. Re-serialize all documents in input order.
//!
//! The first build or publish failure cancels the remaining sibling tasks
//! and fails the batch; no bytes are produced.

pub mod refs;
pub mod selector;

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_yaml::Value;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::build::{BuildError, Builder};
use crate::publish::{Digest, PublishError, Publisher};

pub use refs::{NodePath, STRICT_PREFIX, string_scalars};
pub use selector::{Selector, SelectorError};

/// Errors that fail a document batch.
#[derive(Debug, Error)]
pub enum ResolveError {
  /// The input is not valid YAML.
  #[error("unable to parse input: {0}")]
  Parse(#[source] serde_yaml::Error),

  /// A strict (`ko://`-prefixed) reference is not buildable.
  #[error("found strict reference but {0} is not a valid import path")]
  InvalidImportPath(String),

  #[error(transparent)]
  Build(#[from] BuildError),

  #[error(transparent)]
  Publish(#[from] PublishError),

  /// A discovered reference produced no digest; indicates a pipeline bug.
  #[error("resolved reference to {0:?} not found")]
  MissingDigest(String),

  /// Re-serialization of a resolved document failed.
  #[error("failed to encode output: {0}")]
  Encode(#[source] serde_yaml::Error),

  /// A build or publish task panicked.
  #[error("resolution task panicked")]
  TaskPanicked,
}

/// Resolve every supported reference in `input` and re-serialize the batch.
///
/// `input` may hold multiple YAML documents separated by `---`. Documents
/// not matching `selector` are emitted unchanged and are excluded from
/// discovery. In strict mode, every walked reference must carry the `ko://`
/// prefix and be buildable.
pub async fn resolve_documents(
  input: &[u8],
  strict: bool,
  selector: Option<&Selector>,
  builder: Arc<dyn Builder>,
  publisher: Arc<dyn Publisher>,
  cancel: &CancellationToken,
) -> Result<Vec<u8>, ResolveError> {
  let (mut docs, in_scope) = parse_documents(input, selector)?;

  // Discover: bare reference -> every node that referenced it.
  let mut index: HashMap<String, Vec<(usize, NodePath)>> = HashMap::new();
  for (doc_index, doc) in docs.iter().enumerate() {
    if !in_scope[doc_index] {
      continue;
    }
    for (path, raw) in string_scalars(doc, strict) {
      let reference = raw.trim();
      let bare = reference.strip_prefix(STRICT_PREFIX).unwrap_or(reference);
      if !bare.is_empty() && builder.is_supported(bare).await {
        index.entry(bare.to_string()).or_default().push((doc_index, path));
      } else if strict {
        return Err(ResolveError::InvalidImportPath(reference.to_string()));
      }
    }
  }
  debug!(documents = docs.len(), references = index.len(), "discovered references");

  let digests = resolve_references(index.keys().cloned().collect(), builder, publisher, cancel).await?;

  // Rewrite every site with its reference's digest.
  for (reference, sites) in &index {
    let digest = digests
      .get(reference)
      .ok_or_else(|| ResolveError::MissingDigest(reference.clone()))?;
    for (doc_index, path) in sites {
      match path.locate(&mut docs[*doc_index]) {
        Some(node) => *node = Value::String(digest.to_string()),
        None => warn!(reference = %reference, "discovered node vanished before rewrite"),
      }
    }
  }

  encode_documents(&docs)
}

/// Parse a batch into document trees plus a per-document in-scope flag.
///
/// Empty documents are dropped. Scope is the selector verdict; without a
/// selector every document is in scope.
fn parse_documents(input: &[u8], selector: Option<&Selector>) -> Result<(Vec<Value>, Vec<bool>), ResolveError> {
  let mut docs = Vec::new();
  let mut in_scope = Vec::new();
  for document in serde_yaml::Deserializer::from_slice(input) {
    let doc = Value::deserialize(document).map_err(ResolveError::Parse)?;
    if doc.is_null() {
      continue;
    }
    in_scope.push(selector.is_none_or(|selector| selector.matches_document(&doc)));
    docs.push(doc);
  }
  Ok((docs, in_scope))
}

/// Build then publish each reference concurrently, collecting digests.
async fn resolve_references(
  references: Vec<String>,
  builder: Arc<dyn Builder>,
  publisher: Arc<dyn Publisher>,
  cancel: &CancellationToken,
) -> Result<HashMap<String, Digest>, ResolveError> {
  let batch_cancel = cancel.child_token();
  let mut tasks: JoinSet<Result<(String, Digest), ResolveError>> = JoinSet::new();

  for reference in references {
    let builder = builder.clone();
    let publisher = publisher.clone();
    let cancel = batch_cancel.clone();
    tasks.spawn(async move {
      let artifact = builder.build(&reference, &cancel).await?;
      let digest = publisher.publish(&artifact, &reference, &cancel).await?;
      Ok((reference, digest))
    });
  }

  let mut digests = HashMap::new();
  let mut first_error: Option<ResolveError> = None;
  while let Some(joined) = tasks.join_next().await {
    let result = match joined {
      Ok(result) => result,
      Err(join_error) => {
        error!(error = %join_error, "resolution task panicked");
        Err(ResolveError::TaskPanicked)
      }
    };
    match result {
      Ok((reference, digest)) => {
        digests.insert(reference, digest);
      }
      Err(err) if first_error.is_none() => {
        // First failure wins; cancel the remaining sibling tasks.
        batch_cancel.cancel();
        first_error = Some(err);
      }
      Err(_) => {}
    }
  }

  match first_error {
    Some(err) => Err(err),
    None => Ok(digests),
  }
}

/// Re-serialize documents in input order, two-space indented, separated by
/// `---` lines.
fn encode_documents(docs: &[Value]) -> Result<Vec<u8>, ResolveError> {
  let mut out = String::new();
  for (index, doc) in docs.iter().enumerate() {
    if index > 0 {
      out.push_str("---\n");
    }
    out.push_str(&serde_yaml::to_string(doc).map_err(ResolveError::Encode)?);
  }
  Ok(out.into_bytes())
}
