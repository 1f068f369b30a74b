//! Node shell around a pure [`Operation`].

use super::node::{Emitter, Inbox, Node, NodeContext};
use crate::error::EngineResult;
use crate::metrics;
use crate::operators::Operation;
use crate::tuple::StreamItem;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, trace};

/// Runs an [`Operation`] over every input item.
///
/// Error items are forwarded untouched. An evaluation error raised by the operation
/// becomes an error item prefixed with the operation name; the node keeps running.
pub struct OperatorNode {
  name: String,
  op: Arc<dyn Operation>,
  concurrency: usize,
}

impl OperatorNode {
  /// Creates a node running `op` with one instance.
  pub fn new(name: impl Into<String>, op: Arc<dyn Operation>) -> Self {
    Self {
      name: name.into(),
      op,
      concurrency: 1,
    }
  }

  /// Sets the number of parallel instances.
  pub fn with_concurrency(mut self, n: usize) -> Self {
    self.concurrency = n.max(1);
    self
  }
}

#[async_trait]
impl Node for OperatorNode {
  fn name(&self) -> &str {
    &self.name
  }

  fn concurrency(&self) -> usize {
    self.concurrency
  }

  async fn run(&self, ctx: NodeContext, inbox: Inbox, emitter: Emitter) -> EngineResult<()> {
    while let Some(item) = inbox.next_or_cancel(&ctx.cancel).await {
      metrics::record_records_in(&ctx.rule_id, &ctx.op_id, 1);
      let delivered = if item.is_error() {
        trace!(op = %self.name, "forwarding error item");
        emitter.emit(item).await
      } else {
        match self.op.apply(&item) {
          Ok(Some(out)) => {
            trace!(op = %self.name, kind = out.kind(), "emitting");
            emitter.emit_item(out).await
          }
          Ok(None) => true,
          Err(e) => {
            debug!(op = %self.name, error = %e, "evaluation error");
            emitter
              .emit_item(StreamItem::Error(e.context(self.op.name())))
              .await
          }
        }
      };
      if !delivered {
        break;
      }
    }
    debug!(rule = %ctx.rule_id, op = %self.name, instance = ctx.instance, "operator exits");
    Ok(())
  }
}
