//! Source node: turns pooled source records into tuples.

use super::node::{Emitter, Inbox, Node, NodeContext};
use crate::ast::StreamDefinition;
use crate::clock::ClockRef;
use crate::error::{EngineError, EngineResult};
use crate::source::{ConsumerId, SourcePool, SourceSpec};
use crate::tuple::{StreamItem, Tuple};
use async_trait::async_trait;
use futures::future::try_join_all;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// State key under which a rewindable source's offset is persisted.
pub const OFFSET_KEY: &str = "$$offset";

/// Reads one stream through the [`SourcePool`].
///
/// The node runs `concurrency` workers, each registered as its own pool consumer. Every
/// record becomes a [`Tuple`] emitted by the node, stamped with the clock's current time.
/// When the connection is rewindable, the worker persists the offset after each emitted
/// tuple on the blocking pool; a failed write stops the node. On exit the node releases its pool registrations.
pub struct SourceNode {
  name: String,
  spec: SourceSpec,
  concurrency: usize,
  pool: Arc<SourcePool>,
  clock: ClockRef,
}

impl SourceNode {
  /// Creates a source node for `stream`.
  ///
  /// `concurrency` and `bufferLength` are read from the stream properties; values that
  /// are not positive integers are logged and ignored.
  ///
  /// # Arguments
  ///
  /// * `stream` - The stream definition; its name becomes the node name.
  /// * `pool` - Shared source connections.
  /// * `clock` - Time source for tuple timestamps.
  /// * `buffer_length` - Default consumer queue capacity.
  pub fn new(
    stream: &StreamDefinition,
    pool: Arc<SourcePool>,
    clock: ClockRef,
    buffer_length: usize,
  ) -> Self {
    let concurrency = positive_prop(stream, "concurrency").unwrap_or(1);
    let buffer_length = positive_prop(stream, "bufferLength").unwrap_or(buffer_length);
    Self {
      name: stream.name.clone(),
      spec: SourceSpec::from_stream(stream, buffer_length),
      concurrency,
      pool,
      clock,
    }
  }

  /// Number of pool consumers the node registers.
  pub fn instances(&self) -> usize {
    self.concurrency
  }

  /// Consumer queue capacity.
  pub fn buffer_length(&self) -> usize {
    self.spec.buffer_length
  }

  fn offset_key(instance: usize) -> String {
    if instance == 0 {
      OFFSET_KEY.to_string()
    } else {
      format!("{}/{}", OFFSET_KEY, instance)
    }
  }

  async fn worker(&self, ctx: &NodeContext, instance: usize, emitter: &Emitter) -> EngineResult<()> {
    let offset_key = Self::offset_key(instance);
    let offset = ctx.state.get_state(&offset_key)?;
    let consumer = ConsumerId::new(ctx.rule_id.clone(), self.name.clone(), instance);
    let mut handle = self.pool.acquire(&self.spec, consumer, offset.as_ref()).await?;
    debug!(op = %self.name, instance, key = %handle.key, "source worker attached");

    loop {
      tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => return Ok(()),
        Some(err) = handle.errors.recv() => return Err(EngineError::from(err)),
        record = handle.data.recv() => {
          let Some(record) = record else {
            debug!(op = %self.name, instance, "source stream ended");
            return Ok(());
          };
          let tuple = Tuple {
            emitter: self.name.clone(),
            message: record.message,
            timestamp: self.clock.now_ms(),
            metadata: record.metadata,
          };
          trace!(op = %self.name, ts = tuple.timestamp, "source tuple");
          if !emitter.emit_item(StreamItem::Tuple(Arc::new(tuple))).await {
            return Ok(());
          }
          if let Some(rewindable) = handle.rewindable() {
            let offset = rewindable.offset()?;
            let state = Arc::clone(&ctx.state);
            let key = offset_key.clone();
            tokio::task::spawn_blocking(move || state.put_state(&key, &offset)).await??;
          }
        }
      }
    }
  }
}

fn positive_prop(stream: &StreamDefinition, key: &str) -> Option<usize> {
  let v = stream.options.props.get(key)?;
  match v.as_u64().filter(|n| *n > 0) {
    Some(n) => Some(n as usize),
    None => {
      warn!(stream = %stream.name, key, value = %v, "invalid source property ignored");
      None
    }
  }
}

#[async_trait]
impl Node for SourceNode {
  fn name(&self) -> &str {
    &self.name
  }

  async fn run(&self, ctx: NodeContext, _inbox: Inbox, emitter: Emitter) -> EngineResult<()> {
    info!(rule = %ctx.rule_id, op = %self.name, instances = self.concurrency, "source starting");
    let result = try_join_all((0..self.concurrency).map(|i| self.worker(&ctx, i, &emitter))).await;
    self.pool.release(&ctx.rule_id, &self.name).await;
    debug!(rule = %ctx.rule_id, op = %self.name, "source released");
    result.map(|_| ())
  }
}
