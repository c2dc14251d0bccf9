//! kiln-lib: the resolution pipeline behind kiln.
//!
//! kiln rewrites declarative deployment manifests so that symbolic source
//! references embedded in string fields become concrete, content-addressed
//! image digests. The crate is organized around that pipeline:
//!
//! - `build`: the builder contract plus the limiter, futures cache, recorder,
//!   and command-delegate implementations
//! - `publish`: the publisher contract plus the memoizing cache and command
//!   delegate
//! - `resolve`: YAML walking, label selectors, and per-batch resolution
//! - `stream`: order-preserving streaming of resolved files to an output sink
//! - `watch`: filesystem change notification driving selective re-resolution
//!
//! Builders and publishers are narrow seams to external tooling; kiln-lib is
//! oblivious to how images are actually compiled or uploaded.

pub mod build;
pub mod publish;
pub mod resolve;
pub mod stream;
pub mod util;
pub mod watch;
