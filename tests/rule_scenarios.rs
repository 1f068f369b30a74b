//! End-to-end rule scenarios through the public engine API.

use async_trait::async_trait;
use ruleweave::ast::{
  BinaryOp, Expr, Field, PreparedStatements, SelectStatement, StreamDefinition, StreamOptions,
};
use ruleweave::config::EngineConfig;
use ruleweave::error::SinkError;
use ruleweave::planner::EngineContext;
use ruleweave::processor::{RuleRegistry, RuleStatus};
use ruleweave::sink::{Payload, Sink, SinkContext, SinkRegistry};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

fn select_all(source: &str) -> SelectStatement {
  SelectStatement {
    fields: vec![Field::new(Expr::wildcard())],
    source: source.to_string(),
    ..SelectStatement::default()
  }
}

fn memory_stream(name: &str, shared: bool, props: serde_json::Value) -> StreamDefinition {
  let options = StreamOptions {
    datasource: name.to_string(),
    source_type: "memory".to_string(),
    shared,
    props: serde_json::from_value(props).unwrap(),
    ..StreamOptions::default()
  };
  StreamDefinition::new(name, vec![], options)
}

fn counts(n: i64) -> serde_json::Value {
  serde_json::Value::Array((0..n).map(|i| json!({ "count": i })).collect())
}

/// Records every delivered record's `count`; fails while `failing` is set.
#[derive(Clone, Default)]
struct Recorder {
  delivered: Arc<Mutex<Vec<i64>>>,
  attempts: Arc<AtomicUsize>,
  failing: Arc<AtomicBool>,
  delay: Option<Duration>,
}

impl Recorder {
  fn delivered(&self) -> Vec<i64> {
    self.delivered.lock().unwrap().clone()
  }
}

#[async_trait]
impl Sink for Recorder {
  fn configure(&mut self, _props: &serde_json::Value) -> Result<(), SinkError> {
    Ok(())
  }

  async fn open(&self, _ctx: &SinkContext) -> Result<(), SinkError> {
    Ok(())
  }

  async fn collect(&self, _ctx: &SinkContext, payload: &Payload) -> Result<(), SinkError> {
    self.attempts.fetch_add(1, Ordering::SeqCst);
    if let Some(d) = self.delay {
      tokio::time::sleep(d).await;
    }
    if self.failing.load(Ordering::SeqCst) {
      return Err(SinkError::Delivery("endpoint unavailable".to_string()));
    }
    let mut delivered = self.delivered.lock().unwrap();
    for record in payload {
      delivered.push(record.get("count").and_then(|v| v.as_i64()).unwrap());
    }
    Ok(())
  }

  async fn close(&self, _ctx: &SinkContext) -> Result<(), SinkError> {
    Ok(())
  }
}

struct Harness {
  _dir: TempDir,
  registry: RuleRegistry,
  recorder: Recorder,
}

fn harness(dir: TempDir, recorder: Recorder, streams: Vec<StreamDefinition>) -> Harness {
  let parser = PreparedStatements::new();
  parser.prepare("SELECT * FROM demo", select_all("demo"));
  parser.prepare("SELECT * FROM shared", select_all("shared"));
  parser.prepare(
    "SELECT * FROM demo WHERE count > 49",
    SelectStatement {
      condition: Some(Expr::binary(
        BinaryOp::Gt,
        Expr::field("count"),
        Expr::lit(49i64),
      )),
      ..select_all("demo")
    },
  );
  let mut sinks = SinkRegistry::with_builtins();
  {
    let recorder = recorder.clone();
    sinks.register("recorder", move || Box::new(recorder.clone()));
  }
  let ctx = EngineContext::new(
    EngineConfig::default().with_data_dir(dir.path()),
    Arc::new(parser),
  )
  .with_sinks(sinks);
  let registry = RuleRegistry::open(ctx).unwrap();
  for s in streams {
    registry.streams().create_stream(s).unwrap();
  }
  Harness {
    _dir: dir,
    registry,
    recorder,
  }
}

async fn wait_until_stopped(registry: &RuleRegistry, id: &str) -> RuleStatus {
  tokio::time::timeout(Duration::from_secs(10), async {
    loop {
      let status = registry.rule_status(id).await.unwrap();
      if status != RuleStatus::Running {
        return status;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
  })
  .await
  .expect("rule did not stop")
}

async fn eventually<F, Fut>(mut check: F)
where
  F: FnMut() -> Fut,
  Fut: std::future::Future<Output = bool>,
{
  tokio::time::timeout(Duration::from_secs(10), async {
    while !check().await {
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
  })
  .await
  .expect("condition not reached");
}

#[tokio::test]
async fn filter_keeps_counts_above_threshold() {
  let h = harness(
    TempDir::new().unwrap(),
    Recorder::default(),
    vec![memory_stream("demo", false, json!({ "data": counts(101) }))],
  );
  h.registry
    .rules()
    .create_rule(
      "r1",
      r#"{"sql": "SELECT * FROM demo WHERE count > 49", "actions": [{"recorder": {}}, {"log": {}}]}"#,
    )
    .unwrap();
  h.registry.start_rule("r1").await.unwrap();
  assert_eq!(wait_until_stopped(&h.registry, "r1").await, RuleStatus::Stopped);
  assert_eq!(h.recorder.delivered(), (50..=100).collect::<Vec<_>>());
}

#[tokio::test]
async fn shared_source_is_reference_counted_across_rules() {
  let h = harness(
    TempDir::new().unwrap(),
    Recorder::default(),
    vec![memory_stream(
      "shared",
      true,
      json!({ "data": counts(3), "interval": 60_000 }),
    )],
  );
  let rule = r#"{"sql": "SELECT * FROM shared", "actions": [{"log": {}}]}"#;
  h.registry.rules().create_rule("a", rule).unwrap();
  h.registry.rules().create_rule("b", rule).unwrap();
  let pool = Arc::clone(&h.registry.context().pool);

  h.registry.start_rule("a").await.unwrap();
  h.registry.start_rule("b").await.unwrap();
  eventually(|| {
    let pool = Arc::clone(&pool);
    async move { pool.consumer_count("memory.shared").await == Some(2) }
  })
  .await;
  assert_eq!(pool.len().await, 1);

  h.registry.stop_rule("a").await.unwrap();
  assert_eq!(pool.consumer_count("memory.shared").await, Some(1));
  assert_eq!(h.registry.rule_status("b").await.unwrap(), RuleStatus::Running);

  h.registry.stop_rule("b").await.unwrap();
  assert!(!pool.contains("memory.shared").await);
  assert!(pool.is_empty().await);
}

#[tokio::test]
async fn small_buffers_apply_backpressure_without_loss() {
  let recorder = Recorder {
    delay: Some(Duration::from_millis(1)),
    ..Recorder::default()
  };
  let h = harness(
    TempDir::new().unwrap(),
    recorder,
    vec![memory_stream(
      "demo",
      false,
      json!({ "data": counts(300), "bufferLength": 1 }),
    )],
  );
  h.registry
    .rules()
    .create_rule(
      "slow",
      r#"{"sql": "SELECT * FROM demo", "actions": [{"recorder": {}}], "options": {"bufferLength": 1}}"#,
    )
    .unwrap();
  h.registry.start_rule("slow").await.unwrap();
  assert_eq!(wait_until_stopped(&h.registry, "slow").await, RuleStatus::Stopped);
  assert_eq!(h.recorder.delivered(), (0..300).collect::<Vec<_>>());
}

#[tokio::test]
async fn sink_cache_replays_undelivered_batches_after_restart() {
  let recorder = Recorder::default();
  recorder.failing.store(true, Ordering::SeqCst);
  let h = harness(
    TempDir::new().unwrap(),
    recorder,
    vec![memory_stream("demo", false, json!({ "data": counts(5) }))],
  );
  let rule = json!({
    "sql": "SELECT * FROM demo",
    "actions": [{ "recorder": {
      "enableCache": true,
      "retryCount": 100000,
      "retryInterval": 20,
      "cacheSaveInterval": 10
    }}]
  });
  h.registry
    .rules()
    .create_rule("cached", &rule.to_string())
    .unwrap();

  h.registry.start_rule("cached").await.unwrap();
  let attempts = Arc::clone(&h.recorder.attempts);
  eventually(|| {
    let attempts = Arc::clone(&attempts);
    async move { attempts.load(Ordering::SeqCst) >= 3 }
  })
  .await;
  // Let every record reach the cache while the first batch keeps failing.
  tokio::time::sleep(Duration::from_millis(200)).await;
  h.registry.stop_rule("cached").await.unwrap();
  assert!(h.recorder.delivered().is_empty());

  h.recorder.failing.store(false, Ordering::SeqCst);
  h.registry.start_rule("cached").await.unwrap();
  assert_eq!(
    wait_until_stopped(&h.registry, "cached").await,
    RuleStatus::Stopped
  );
  assert_eq!(h.recorder.delivered(), vec![0, 1, 2, 3, 4]);
}
