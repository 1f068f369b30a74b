//! In-memory, rewindable source.

use super::{Rewindable, Source, SourceContext, SourceProps, SourceTuple, millis_prop};
use crate::error::SourceError;
use crate::value::{Message, Value};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Replays a fixed list of records.
///
/// Records come from the constructor or from the `data` property (a JSON array of
/// objects). With `interval` set, the source waits that many milliseconds before each
/// record. The offset is the index of the next record to produce.
#[derive(Debug, Default)]
pub struct MemorySource {
  records: Vec<Message>,
  interval: Option<Duration>,
  position: AtomicUsize,
}

impl MemorySource {
  /// An empty source, to be filled by `configure`.
  pub fn new() -> Self {
    Self::default()
  }

  /// A source producing `records` in order.
  pub fn with_records(records: Vec<Message>) -> Self {
    Self {
      records,
      ..Self::default()
    }
  }

  /// Waits `interval` before each record.
  pub fn with_interval(mut self, interval: Duration) -> Self {
    self.interval = Some(interval);
    self
  }
}

#[async_trait]
impl Source for MemorySource {
  fn configure(&mut self, _datasource: &str, props: &SourceProps) -> Result<(), SourceError> {
    if let Some(data) = props.get("data") {
      let items = data
        .as_array()
        .ok_or_else(|| SourceError::Config("data must be an array".to_string()))?;
      self.records = items
        .iter()
        .map(|v| {
          Message::from_json(v.clone())
            .ok_or_else(|| SourceError::Config(format!("record {} is not an object", v)))
        })
        .collect::<Result<_, _>>()?;
    }
    if let Some(ms) = millis_prop(props, "interval")? {
      self.interval = Some(Duration::from_millis(ms));
    }
    Ok(())
  }

  async fn open(
    &self,
    ctx: SourceContext,
    consumer: mpsc::Sender<SourceTuple>,
    _errors: mpsc::Sender<SourceError>,
  ) {
    loop {
      let i = self.position.load(Ordering::SeqCst);
      let Some(record) = self.records.get(i) else {
        debug!(key = %ctx.key, records = self.records.len(), "memory source exhausted");
        return;
      };
      if let Some(interval) = self.interval {
        tokio::select! {
          _ = ctx.cancel.cancelled() => return,
          _ = tokio::time::sleep(interval) => {}
        }
      }
      tokio::select! {
        _ = ctx.cancel.cancelled() => return,
        sent = consumer.send(SourceTuple::new(record.clone())) => {
          if sent.is_err() {
            return;
          }
        }
      }
      self.position.store(i + 1, Ordering::SeqCst);
    }
  }

  async fn close(&self) -> Result<(), SourceError> {
    Ok(())
  }

  fn as_rewindable(&self) -> Option<&dyn Rewindable> {
    Some(self)
  }
}

impl Rewindable for MemorySource {
  fn offset(&self) -> Result<Value, SourceError> {
    Ok(Value::Int(self.position.load(Ordering::SeqCst) as i64))
  }

  fn rewind(&self, offset: &Value) -> Result<(), SourceError> {
    let pos = offset
      .as_i64()
      .filter(|p| *p >= 0)
      .ok_or_else(|| SourceError::Offset(format!("invalid offset {}", offset)))?;
    self.position.store(pos as usize, Ordering::SeqCst);
    Ok(())
  }
}
