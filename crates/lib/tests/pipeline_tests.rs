//! End-to-end pipeline tests: limiter, caches, resolver, and orchestrator
//! composed the way the CLI composes them.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use kiln_lib::build::{Caching, Limiter};
use kiln_lib::publish::{self, Publisher};
use kiln_lib::resolve::Selector;
use kiln_lib::stream::{FileRecords, StreamOptions, resolve_files_to_writer};
use kiln_lib::util::testutil::{FakeBuilder, FakePublisher};

struct Harness {
  temp: TempDir,
  builder: Arc<Caching>,
  publisher: Arc<FakePublisher>,
  cached_publisher: Arc<publish::Caching>,
}

impl Harness {
  fn new(builder: FakeBuilder) -> Self {
    let publisher = Arc::new(FakePublisher::new());
    let cached_publisher = Arc::new(publish::Caching::new(publisher.clone()));
    Self {
      temp: TempDir::new().unwrap(),
      builder: Arc::new(Caching::new(Arc::new(Limiter::new(Arc::new(builder), 4)))),
      publisher,
      cached_publisher,
    }
  }

  fn manifest(&self, name: &str, content: &str) -> PathBuf {
    let path = self.temp.path().join(name);
    std::fs::write(&path, content).unwrap();
    path
  }

  async fn run(&self, paths: Vec<PathBuf>, options: StreamOptions) -> Result<String, kiln_lib::stream::StreamError> {
    let (tx, rx) = mpsc::unbounded_channel();
    for path in paths {
      tx.send(path).unwrap();
    }
    drop(tx);

    let mut out = Vec::new();
    resolve_files_to_writer(
      self.builder.clone(),
      self.cached_publisher.clone(),
      rx,
      Arc::new(FileRecords::new()),
      options,
      None,
      CancellationToken::new(),
      &mut out,
    )
    .await?;
    Ok(String::from_utf8(out).unwrap())
  }
}

#[tokio::test]
async fn a_single_document_single_reference_round_trip() {
  let builder = FakeBuilder::supporting(["example.com/a"]);
  let builds = builder.counters();
  let harness = Harness::new(builder);
  let manifest = harness.manifest("app.yaml", "image: ko://example.com/a\n");

  let out = harness.run(vec![manifest], StreamOptions::default()).await.unwrap();

  let digest = harness.publisher.digest_for("example.com/a").unwrap();
  assert_eq!(out, format!("image: {digest}\n\n---\n"));
  assert_eq!(builds.builds(), 1);
}

#[tokio::test]
async fn references_shared_across_files_and_documents_build_and_publish_once() {
  let builder = FakeBuilder::supporting(["example.com/a"]);
  let builds = builder.counters();
  let harness = Harness::new(builder);
  let publishes = harness.publisher.counters();

  let one = harness.manifest(
    "one.yaml",
    "image: example.com/a\n---\nspec:\n  image: example.com/a\n",
  );
  let two = harness.manifest("two.yaml", "image: example.com/a\n");

  let out = harness.run(vec![one, two], StreamOptions::default()).await.unwrap();

  let digest = harness.publisher.digest_for("example.com/a").unwrap();
  assert_eq!(out.matches(&digest.0).count(), 3);
  assert_eq!(builds.builds(), 1);
  assert_eq!(publishes.publishes(), 1);
}

#[tokio::test]
async fn output_order_follows_arrival_order_not_completion_order() {
  let builder = FakeBuilder::supporting(["example.com/slow", "example.com/fast"])
    .with_delay("example.com/slow", Duration::from_millis(200));
  let harness = Harness::new(builder);

  let slow = harness.manifest("slow.yaml", "image: example.com/slow\n");
  let fast = harness.manifest("fast.yaml", "image: example.com/fast\n");

  let out = harness.run(vec![slow, fast], StreamOptions::default()).await.unwrap();

  let slow_digest = harness.publisher.digest_for("example.com/slow").unwrap();
  let fast_digest = harness.publisher.digest_for("example.com/fast").unwrap();
  let slow_at = out.find(&slow_digest.0).expect("slow digest present");
  let fast_at = out.find(&fast_digest.0).expect("fast digest present");
  assert!(slow_at < fast_at, "slow file must be emitted first");
}

#[tokio::test]
async fn strict_violations_fail_the_whole_stream() {
  let harness = Harness::new(FakeBuilder::supporting(["example.com/a"]));
  let manifest = harness.manifest("bad.yaml", "image: ko://unknown/x\n");

  let err = harness
    .run(
      vec![manifest],
      StreamOptions {
        strict: true,
        ..Default::default()
      },
    )
    .await
    .unwrap_err();

  assert!(err.to_string().contains("ko://unknown/x"));
}

#[tokio::test]
async fn selector_filtered_documents_pass_through_untouched() {
  let builder = FakeBuilder::supporting(["example.com/a"]);
  let builds = builder.counters();
  let harness = Harness::new(builder);

  let manifest = harness.manifest(
    "app.yaml",
    "metadata:\n  labels:\n    app: keep\nimage: example.com/a\n---\nmetadata:\n  name: skip\nimage: example.com/a\n",
  );

  let options = StreamOptions {
    selector: Some(Selector::parse("app=keep").unwrap()),
    ..Default::default()
  };
  let out = harness.run(vec![manifest], options).await.unwrap();

  let digest = harness.publisher.digest_for("example.com/a").unwrap();
  assert_eq!(out.matches(&digest.0).count(), 1);
  assert!(out.contains("image: example.com/a"));
  assert_eq!(builds.builds(), 1);
}

#[tokio::test]
async fn cancellation_before_intake_terminates_cleanly() {
  let harness = Harness::new(FakeBuilder::supporting_all());
  let (tx, rx) = mpsc::unbounded_channel::<PathBuf>();
  let cancel = CancellationToken::new();
  cancel.cancel();

  let mut out = Vec::new();
  let result = tokio::time::timeout(
    Duration::from_secs(5),
    resolve_files_to_writer(
      harness.builder.clone(),
      harness.cached_publisher.clone(),
      rx,
      Arc::new(FileRecords::new()),
      StreamOptions::default(),
      None,
      cancel,
      &mut out,
    ),
  )
  .await
  .expect("orchestrator terminated");

  assert!(result.is_ok());
  assert!(out.is_empty());
  drop(tx);
}

#[tokio::test]
async fn the_build_limiter_bounds_concurrency_across_files() {
  let builder = FakeBuilder::supporting_all().with_default_delay(Duration::from_millis(30));
  let counters = builder.counters();

  // A dedicated harness with a tight limit.
  let publisher = Arc::new(FakePublisher::new());
  let cached_publisher = Arc::new(publish::Caching::new(
    publisher.clone() as Arc<dyn Publisher>
  ));
  let caching = Arc::new(Caching::new(Arc::new(Limiter::new(Arc::new(builder), 2))));

  let temp = TempDir::new().unwrap();
  let (tx, rx) = mpsc::unbounded_channel();
  for i in 0..6 {
    let path = temp.path().join(format!("m{i}.yaml"));
    std::fs::write(&path, format!("image: example.com/app-{i}\n")).unwrap();
    tx.send(path).unwrap();
  }
  drop(tx);

  let mut out = Vec::new();
  resolve_files_to_writer(
    caching,
    cached_publisher,
    rx,
    Arc::new(FileRecords::new()),
    StreamOptions::default(),
    None,
    CancellationToken::new(),
    &mut out,
  )
  .await
  .unwrap();

  assert_eq!(counters.builds(), 6);
  assert!(counters.max_in_flight() <= 2, "max in flight was {}", counters.max_in_flight());
}
