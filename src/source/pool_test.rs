//! Tests for the source instance pool.

use crate::error::SourceError;
use crate::message;
use crate::source::*;
use crate::value::{Message, Value};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Waits for `gate`, produces its records, then optionally fails, then idles until
/// cancelled.
struct GatedSource {
  records: Vec<Message>,
  gate: CancellationToken,
  fail_with: Option<String>,
  closes: Arc<AtomicUsize>,
}

#[async_trait]
impl Source for GatedSource {
  fn configure(&mut self, _datasource: &str, _props: &SourceProps) -> Result<(), SourceError> {
    Ok(())
  }

  async fn open(
    &self,
    ctx: SourceContext,
    consumer: mpsc::Sender<SourceTuple>,
    errors: mpsc::Sender<SourceError>,
  ) {
    tokio::select! {
      _ = ctx.cancel.cancelled() => return,
      _ = self.gate.cancelled() => {}
    }
    for r in &self.records {
      if consumer.send(SourceTuple::new(r.clone())).await.is_err() {
        return;
      }
    }
    if let Some(reason) = &self.fail_with {
      let _ = errors.send(SourceError::Connection(reason.clone())).await;
    }
    ctx.cancel.cancelled().await;
  }

  async fn close(&self) -> Result<(), SourceError> {
    self.closes.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }
}

struct Fixture {
  pool: SourcePool,
  gate: CancellationToken,
  closes: Arc<AtomicUsize>,
}

fn fixture(records: Vec<Message>, fail_with: Option<&str>) -> Fixture {
  let gate = CancellationToken::new();
  let closes = Arc::new(AtomicUsize::new(0));
  let mut registry = SourceRegistry::with_builtins();
  {
    let gate = gate.clone();
    let closes = Arc::clone(&closes);
    let fail_with = fail_with.map(str::to_string);
    registry.register("gated", move || {
      Box::new(GatedSource {
        records: records.clone(),
        gate: gate.clone(),
        fail_with: fail_with.clone(),
        closes: Arc::clone(&closes),
      })
    });
  }
  Fixture {
    pool: SourcePool::new(Arc::new(registry)),
    gate,
    closes,
  }
}

fn spec(source_type: &str, shared: bool) -> SourceSpec {
  SourceSpec {
    source_type: source_type.to_string(),
    datasource: "demo".to_string(),
    shared,
    props: SourceProps::new(),
    buffer_length: 16,
  }
}

async fn recv(handle: &mut SourceHandle) -> Option<SourceTuple> {
  tokio::time::timeout(Duration::from_secs(5), handle.data.recv())
    .await
    .expect("timed out waiting for a record")
}

// ============================================================================
// Reference counting
// ============================================================================

#[tokio::test]
async fn test_shared_entry_is_ref_counted_and_closed_once() {
  let f = fixture(vec![], None);
  let spec = spec("gated", true);
  let mut handles = Vec::new();
  for rule in ["r1", "r2", "r3"] {
    handles.push(
      f.pool
        .acquire(&spec, ConsumerId::new(rule, "demo", 0), None)
        .await
        .unwrap(),
    );
  }
  let key = "gated.demo";
  assert_eq!(f.pool.len().await, 1);
  assert_eq!(f.pool.consumer_count(key).await, Some(3));

  f.pool.release("r1", "demo").await;
  f.pool.release("r2", "demo").await;
  assert!(f.pool.contains(key).await);
  assert_eq!(f.pool.consumer_count(key).await, Some(1));
  assert_eq!(f.closes.load(Ordering::SeqCst), 0);

  f.pool.release("r3", "demo").await;
  assert!(!f.pool.contains(key).await);
  assert_eq!(f.pool.consumer_count(key).await, None);
  assert_eq!(f.closes.load(Ordering::SeqCst), 1);

  // Releasing again is a no-op.
  f.pool.release("r3", "demo").await;
  assert_eq!(f.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_exclusive_instances_get_their_own_connection() {
  let f = fixture(vec![], None);
  let spec = spec("gated", false);
  let _a = f.pool.acquire(&spec, ConsumerId::new("r1", "demo", 0), None).await.unwrap();
  let _b = f.pool.acquire(&spec, ConsumerId::new("r1", "demo", 1), None).await.unwrap();
  let _c = f.pool.acquire(&spec, ConsumerId::new("r2", "demo", 0), None).await.unwrap();
  assert_eq!(f.pool.len().await, 3);
  assert!(f.pool.contains("gated.demo.r1.demo.1").await);

  f.pool.release("r1", "demo").await;
  assert_eq!(f.pool.len().await, 1);
  assert_eq!(f.closes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_unknown_source_type() {
  let f = fixture(vec![], None);
  let err = f
    .pool
    .acquire(&spec("mqtt", true), ConsumerId::new("r1", "demo", 0), None)
    .await
    .err()
    .unwrap();
  assert!(matches!(err, SourceError::UnknownType(t) if t == "mqtt"));
  assert!(f.pool.is_empty().await);
}

// ============================================================================
// Delivery
// ============================================================================

#[tokio::test]
async fn test_every_consumer_receives_every_record() {
  let records: Vec<Message> = (0..5i64).map(|i| message! { "i" => i }).collect();
  let f = fixture(records.clone(), None);
  let spec = spec("gated", true);
  let mut a = f.pool.acquire(&spec, ConsumerId::new("r1", "demo", 0), None).await.unwrap();
  let mut b = f.pool.acquire(&spec, ConsumerId::new("r2", "demo", 0), None).await.unwrap();
  f.gate.cancel();

  for expected in &records {
    assert_eq!(&recv(&mut a).await.unwrap().message, expected);
    assert_eq!(&recv(&mut b).await.unwrap().message, expected);
  }
  f.pool.release("r1", "demo").await;
  f.pool.release("r2", "demo").await;
  assert_eq!(f.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_connection_error_reaches_every_consumer() {
  let f = fixture(vec![message! { "i" => 1i64 }], Some("broker gone"));
  let spec = spec("gated", true);
  let mut a = f.pool.acquire(&spec, ConsumerId::new("r1", "demo", 0), None).await.unwrap();
  let mut b = f.pool.acquire(&spec, ConsumerId::new("r2", "demo", 0), None).await.unwrap();
  f.gate.cancel();

  for h in [&mut a, &mut b] {
    let err = tokio::time::timeout(Duration::from_secs(5), h.errors.recv())
      .await
      .unwrap()
      .unwrap();
    assert!(err.to_string().contains("broker gone"));
  }
  let late = f.pool.acquire(&spec, ConsumerId::new("r3", "demo", 0), None).await;
  assert!(matches!(late, Err(SourceError::Connection(_))));

  f.pool.release("r1", "demo").await;
  f.pool.release("r2", "demo").await;
  assert_eq!(f.closes.load(Ordering::SeqCst), 1);
  assert!(f.pool.is_empty().await);
}

#[tokio::test]
async fn test_finished_source_closes_consumer_queues() {
  let f = fixture(vec![], None);
  let mut props = SourceProps::new();
  props.insert("data".into(), serde_json::json!([{ "a": 1 }, { "a": 2 }]));
  let spec = SourceSpec {
    props,
    ..spec("memory", true)
  };
  let mut h = f.pool.acquire(&spec, ConsumerId::new("r1", "demo", 0), None).await.unwrap();
  assert_eq!(recv(&mut h).await.unwrap().message, message! { "a" => 1i64 });
  assert_eq!(recv(&mut h).await.unwrap().message, message! { "a" => 2i64 });
  assert!(recv(&mut h).await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_first_consumer_sees_records_read_at_connection_start() {
  let mut props = SourceProps::new();
  let data: Vec<_> = (0..5).map(|i| serde_json::json!({ "i": i })).collect();
  props.insert("data".into(), serde_json::Value::Array(data));
  let spec = SourceSpec {
    props,
    ..spec("memory", true)
  };
  for run in 0..300 {
    let f = fixture(vec![], None);
    let mut h = f.pool.acquire(&spec, ConsumerId::new("r1", "demo", 0), None).await.unwrap();
    let mut received = 0;
    while recv(&mut h).await.is_some() {
      received += 1;
    }
    assert_eq!(received, 5, "run {} lost records", run);
    f.pool.release("r1", "demo").await;
  }
}

#[tokio::test]
async fn test_exclusive_rewindable_source_resumes_from_offset() {
  let f = fixture(vec![], None);
  let mut props = SourceProps::new();
  props.insert("data".into(), serde_json::json!([{ "a": 0 }, { "a": 1 }, { "a": 2 }]));
  let spec = SourceSpec {
    props,
    ..spec("memory", false)
  };
  let mut h = f
    .pool
    .acquire(&spec, ConsumerId::new("r1", "demo", 0), Some(&Value::Int(2)))
    .await
    .unwrap();
  assert_eq!(recv(&mut h).await.unwrap().message, message! { "a" => 2i64 });
  assert!(recv(&mut h).await.is_none());
  assert_eq!(h.rewindable().unwrap().offset().unwrap(), Value::Int(3));
}
