//! # Node capability
//!
//! Every vertex of a rule topology implements the single [`Node`] trait, whether it is a
//! source, an operator or a sink. The topology hands each node:
//!
//! - an [`Inbox`]: the merged stream of every upstream edge (empty for sources);
//! - an [`Emitter`]: one bounded sender per downstream edge;
//! - a [`NodeContext`]: rule and operator identity, the rule's cancellation token and
//!   the operator's state store.
//!
//! ## Zero-copy fan-out
//!
//! Items travel as `Arc<StreamItem>`. [`Emitter::emit`] hands the same `Arc` to every
//! consumer, so fan-out costs one reference count increment per edge and consumers
//! never see each other's mutations (there are none: items are immutable).
//!
//! ## Backpressure and cancellation
//!
//! Edge queues are bounded. `emit` awaits each consumer's queue in turn, which blocks
//! the producer while any consumer is full. The wait races the rule's cancellation token,
//! so a cancelled rule never stays stuck on a full queue.

use crate::error::EngineResult;
use crate::metrics;
use crate::store::StateStore;
use crate::tuple::StreamItem;
use async_trait::async_trait;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// The unit of data on every topology edge.
pub type Item = Arc<StreamItem>;

/// Merged input stream of a node.
pub type InputStream = Pin<Box<dyn Stream<Item = Item> + Send>>;

/// Identity and services available to a running node instance.
#[derive(Clone)]
pub struct NodeContext {
  /// Rule the node belongs to.
  pub rule_id: String,
  /// Operator id (the node name).
  pub op_id: String,
  /// Parallel instance index, starting at 0.
  pub instance: usize,
  /// Rule-scoped cancellation.
  pub cancel: CancellationToken,
  /// State of this operator.
  pub state: Arc<dyn StateStore>,
}

impl NodeContext {
  /// Returns true once the rule has been cancelled.
  pub fn is_cancelled(&self) -> bool {
    self.cancel.is_cancelled()
  }
}

/// The merged input of a node, shared by its parallel instances.
#[derive(Clone)]
pub struct Inbox {
  stream: Arc<Mutex<InputStream>>,
}

impl Inbox {
  /// Wraps a merged input stream.
  pub fn new(stream: InputStream) -> Self {
    Self {
      stream: Arc::new(Mutex::new(stream)),
    }
  }

  /// An inbox that is immediately exhausted, for source nodes.
  pub fn empty() -> Self {
    Self::new(Box::pin(tokio_stream::empty()))
  }

  /// Pulls the next item, or `None` once every upstream edge has closed.
  pub async fn next(&self) -> Option<Item> {
    self.stream.lock().await.next().await
  }

  /// Pulls the next item unless `cancel` fires first.
  pub async fn next_or_cancel(&self, cancel: &CancellationToken) -> Option<Item> {
    tokio::select! {
      biased;
      _ = cancel.cancelled() => None,
      item = self.next() => item,
    }
  }
}

/// Broadcasts a node's output to every downstream edge.
#[derive(Clone)]
pub struct Emitter {
  rule_id: String,
  op_id: String,
  outputs: Vec<mpsc::Sender<Item>>,
  cancel: CancellationToken,
}

impl Emitter {
  /// Creates an emitter over downstream edge senders.
  pub fn new(
    rule_id: impl Into<String>,
    op_id: impl Into<String>,
    outputs: Vec<mpsc::Sender<Item>>,
    cancel: CancellationToken,
  ) -> Self {
    Self {
      rule_id: rule_id.into(),
      op_id: op_id.into(),
      outputs,
      cancel,
    }
  }

  /// Number of downstream edges.
  pub fn fan_out(&self) -> usize {
    self.outputs.len()
  }

  /// Sends `item` to every consumer, waiting for queue space.
  ///
  /// # Returns
  ///
  /// `false` if the rule was cancelled before every consumer accepted the item. A
  /// consumer that has already exited is skipped.
  pub async fn emit(&self, item: Item) -> bool {
    if item.is_error() {
      metrics::record_node_error(&self.rule_id, &self.op_id);
    }
    for tx in &self.outputs {
      tokio::select! {
        biased;
        _ = self.cancel.cancelled() => return false,
        sent = tx.send(Arc::clone(&item)) => {
          if sent.is_err() {
            trace!(rule = %self.rule_id, op = %self.op_id, "downstream consumer closed");
          }
        }
      }
    }
    metrics::record_records_out(&self.rule_id, &self.op_id, 1);
    true
  }

  /// Wraps and sends a freshly built item.
  pub async fn emit_item(&self, item: StreamItem) -> bool {
    self.emit(Arc::new(item)).await
  }
}

/// A topology vertex.
#[async_trait]
pub trait Node: Send + Sync {
  /// Unique name of the node within its topology; used as the operator id.
  fn name(&self) -> &str;

  /// Number of parallel instances the topology should run.
  ///
  /// Source nodes report 1 and run their own per-connection workers.
  fn concurrency(&self) -> usize {
    1
  }

  /// Runs one instance until its input is exhausted or the rule is cancelled.
  ///
  /// # Arguments
  ///
  /// * `ctx` - Identity, cancellation and state of this instance.
  /// * `inbox` - Merged input shared with the node's other instances.
  /// * `emitter` - Downstream edges.
  ///
  /// # Returns
  ///
  /// `Ok(())` on a clean exit. An `Err` is a fatal node error: the topology logs it and
  /// reports it on its error channel.
  async fn run(&self, ctx: NodeContext, inbox: Inbox, emitter: Emitter) -> EngineResult<()>;
}
