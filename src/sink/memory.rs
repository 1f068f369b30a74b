//! In-process sink used by ad-hoc queries and tests.

use super::{Payload, Sink, SinkContext};
use crate::error::SinkError;
use crate::value::Message;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

/// Default topic of a memory sink.
pub const DEFAULT_TOPIC: &str = "default";

/// Records collected by memory sinks, in delivery order.
#[derive(Clone, Default)]
pub struct MemoryCollector {
  records: Arc<Mutex<Vec<Message>>>,
  notify: Arc<Notify>,
}

impl MemoryCollector {
  /// An empty collector.
  pub fn new() -> Self {
    Self::default()
  }

  fn guard(&self) -> MutexGuard<'_, Vec<Message>> {
    self.records.lock().unwrap_or_else(|p| p.into_inner())
  }

  fn push_all(&self, records: &[Message]) {
    self.guard().extend_from_slice(records);
    self.notify.notify_waiters();
  }

  /// A copy of everything collected so far.
  pub fn records(&self) -> Vec<Message> {
    self.guard().clone()
  }

  /// Number of records collected.
  pub fn len(&self) -> usize {
    self.guard().len()
  }

  /// Returns true when nothing was collected.
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Waits until at least `n` records have been collected.
  pub async fn wait_for(&self, n: usize) {
    loop {
      let notified = self.notify.notified();
      if self.len() >= n {
        return;
      }
      notified.await;
    }
  }
}

/// Collectors of the built-in `memory` action, by topic.
#[derive(Clone, Default)]
pub struct MemoryHub {
  topics: Arc<Mutex<HashMap<String, MemoryCollector>>>,
}

impl MemoryHub {
  /// The collector of `topic`, created on first use.
  pub fn collector(&self, topic: &str) -> MemoryCollector {
    self
      .topics
      .lock()
      .unwrap_or_else(|p| p.into_inner())
      .entry(topic.to_string())
      .or_default()
      .clone()
  }
}

/// Appends every delivered record to a [`MemoryCollector`].
pub struct MemorySink {
  hub: Option<MemoryHub>,
  collector: MemoryCollector,
}

impl MemorySink {
  /// A sink writing into `collector`.
  pub fn new(collector: MemoryCollector) -> Self {
    Self {
      hub: None,
      collector,
    }
  }

  /// A sink writing into the hub collector named by its `topic` property.
  pub fn in_hub(hub: MemoryHub) -> Self {
    let collector = hub.collector(DEFAULT_TOPIC);
    Self {
      hub: Some(hub),
      collector,
    }
  }
}

#[async_trait]
impl Sink for MemorySink {
  fn configure(&mut self, props: &serde_json::Value) -> Result<(), SinkError> {
    if let Some(hub) = &self.hub {
      let topic = props
        .get("topic")
        .and_then(|t| t.as_str())
        .unwrap_or(DEFAULT_TOPIC);
      self.collector = hub.collector(topic);
    }
    Ok(())
  }

  async fn open(&self, _ctx: &SinkContext) -> Result<(), SinkError> {
    Ok(())
  }

  async fn collect(&self, _ctx: &SinkContext, payload: &Payload) -> Result<(), SinkError> {
    self.collector.push_all(payload);
    Ok(())
  }

  async fn close(&self, _ctx: &SinkContext) -> Result<(), SinkError> {
    Ok(())
  }
}
