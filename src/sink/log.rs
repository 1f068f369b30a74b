//! Sink that logs records.

use super::{Payload, Sink, SinkContext};
use crate::error::SinkError;
use async_trait::async_trait;
use tracing::info;

/// Writes every record as JSON through `tracing` at info level.
#[derive(Debug, Default)]
pub struct LogSink;

impl LogSink {
  /// Creates a log sink.
  pub fn new() -> Self {
    Self
  }
}

#[async_trait]
impl Sink for LogSink {
  fn configure(&mut self, _props: &serde_json::Value) -> Result<(), SinkError> {
    Ok(())
  }

  async fn open(&self, ctx: &SinkContext) -> Result<(), SinkError> {
    info!(rule = %ctx.rule_id, op = %ctx.op_id, "log sink opened");
    Ok(())
  }

  async fn collect(&self, ctx: &SinkContext, payload: &Payload) -> Result<(), SinkError> {
    for record in payload {
      info!(rule = %ctx.rule_id, op = %ctx.op_id, record = %record.to_json(), "sink record");
    }
    Ok(())
  }

  async fn close(&self, _ctx: &SinkContext) -> Result<(), SinkError> {
    Ok(())
  }
}
