//! # Topology
//!
//! The DAG container of a running rule. Nodes are added in dependency order: a node's
//! inputs must already be part of the topology when it is added, so the graph is acyclic
//! by construction and insertion order is a valid topological order.
//!
//! [`Topology::open`] creates one bounded queue per producer-consumer edge, spawns
//! `concurrency` tasks per node and returns a [`TopologyErrors`] handle. A node task
//! that fails reports its error there; the first fatal error also cancels the topology
//! unless `cancel_on_error` is off.
//!
//! ## Example
//!
//! ```rust,no_run
//! # use ruleweave::topo::{Topology, TopologyOptions};
//! # async fn demo(source: std::sync::Arc<dyn ruleweave::topo::Node>,
//! #               sink: std::sync::Arc<dyn ruleweave::topo::Node>) -> ruleweave::error::EngineResult<()> {
//! let mut topo = Topology::new("rule1", TopologyOptions::default());
//! topo.add_source(source)?;
//! topo.add_sink(&["demo"], sink)?;
//! let mut errors = topo.open()?;
//! if let Some(err) = errors.recv().await {
//!   eprintln!("rule failed: {}", err);
//! }
//! topo.cancel();
//! topo.wait_for_completion().await?;
//! # Ok(())
//! # }
//! ```

use super::node::{Emitter, Inbox, InputStream, Item, Node, NodeContext};
use crate::error::{EngineError, EngineResult};
use crate::metrics;
use crate::store::{KeyValueStore, KvStateStore, MemoryStateStore, StateStore};
use futures::stream::select_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capacity of the topology error channel.
const ERROR_CHANNEL_CAPACITY: usize = 16;

/// Topology-wide settings.
#[derive(Debug, Clone)]
pub struct TopologyOptions {
  /// Capacity of every edge queue.
  pub buffer_length: usize,
  /// Cancel the topology on the first fatal node error.
  pub cancel_on_error: bool,
}

impl Default for TopologyOptions {
  fn default() -> Self {
    Self {
      buffer_length: 1024,
      cancel_on_error: true,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
  Source,
  Operator,
  Sink,
}

struct NodeEntry {
  node: Arc<dyn Node>,
  inputs: Vec<String>,
  kind: NodeKind,
}

/// Receives fatal node errors of an open topology.
pub struct TopologyErrors {
  rx: mpsc::Receiver<EngineError>,
}

impl TopologyErrors {
  /// Waits for the next fatal error.
  ///
  /// # Returns
  ///
  /// `None` once every node task has exited without further errors.
  pub async fn recv(&mut self) -> Option<EngineError> {
    self.rx.recv().await
  }

  /// Returns an error that is already queued, without waiting.
  pub fn try_recv(&mut self) -> Option<EngineError> {
    self.rx.try_recv().ok()
  }
}

/// Routes node failures to the error channel.
#[derive(Clone)]
struct ErrorReporter {
  rule_id: String,
  tx: mpsc::Sender<EngineError>,
  cancel: CancellationToken,
  cancel_on_error: bool,
}

impl ErrorReporter {
  fn report(&self, op_id: &str, err: EngineError) {
    metrics::record_node_error(&self.rule_id, op_id);
    if self.cancel.is_cancelled() {
      debug!(rule = %self.rule_id, op = %op_id, error = %err, "dropping error of cancelled topology");
      return;
    }
    error!(rule = %self.rule_id, op = %op_id, error = %err, "node failed");
    if self.tx.try_send(err).is_err() {
      warn!(rule = %self.rule_id, op = %op_id, "error channel full, error dropped");
    }
    if self.cancel_on_error {
      self.cancel.cancel();
    }
  }
}

/// A rule's DAG of nodes.
pub struct Topology {
  rule_id: String,
  options: TopologyOptions,
  nodes: Vec<NodeEntry>,
  cancel: CancellationToken,
  state: Option<Arc<dyn KeyValueStore>>,
  handles: Mutex<Vec<JoinHandle<()>>>,
  opened: bool,
}

impl Topology {
  /// Creates an empty topology.
  ///
  /// # Arguments
  ///
  /// * `rule_id` - Id of the rule this topology runs.
  /// * `options` - Queue sizing and error policy.
  pub fn new(rule_id: impl Into<String>, options: TopologyOptions) -> Self {
    Self {
      rule_id: rule_id.into(),
      options,
      nodes: Vec::new(),
      cancel: CancellationToken::new(),
      state: None,
      handles: Mutex::new(Vec::new()),
      opened: false,
    }
  }

  /// Persists operator state in `store` instead of in memory.
  pub fn with_state_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
    self.state = Some(store);
    self
  }

  /// Id of the rule.
  pub fn rule_id(&self) -> &str {
    &self.rule_id
  }

  /// Node names in insertion order.
  pub fn node_names(&self) -> Vec<&str> {
    self.nodes.iter().map(|n| n.node.name()).collect()
  }

  /// Names of the nodes feeding `name`.
  pub fn inputs_of(&self, name: &str) -> Option<&[String]> {
    self
      .nodes
      .iter()
      .find(|n| n.node.name() == name)
      .map(|n| n.inputs.as_slice())
  }

  /// The rule's cancellation token.
  pub fn cancel_token(&self) -> CancellationToken {
    self.cancel.clone()
  }

  /// Adds a node without inputs.
  pub fn add_source(&mut self, node: Arc<dyn Node>) -> EngineResult<()> {
    self.add(node, &[], NodeKind::Source)
  }

  /// Adds an operator fed by `inputs`.
  pub fn add_operator(&mut self, inputs: &[&str], node: Arc<dyn Node>) -> EngineResult<()> {
    self.add(node, inputs, NodeKind::Operator)
  }

  /// Adds a sink fed by `inputs`.
  pub fn add_sink(&mut self, inputs: &[&str], node: Arc<dyn Node>) -> EngineResult<()> {
    self.add(node, inputs, NodeKind::Sink)
  }

  fn add(&mut self, node: Arc<dyn Node>, inputs: &[&str], kind: NodeKind) -> EngineResult<()> {
    if self.opened {
      return Err(EngineError::Topology(
        "cannot add nodes to an open topology".to_string(),
      ));
    }
    let name = node.name().to_string();
    if self.nodes.iter().any(|n| n.node.name() == name) {
      return Err(EngineError::Topology(format!(
        "node '{}' already exists",
        name
      )));
    }
    if kind != NodeKind::Source && inputs.is_empty() {
      return Err(EngineError::Topology(format!(
        "node '{}' needs at least one input",
        name
      )));
    }
    for input in inputs {
      match self.nodes.iter().find(|n| n.node.name() == *input) {
        None => {
          return Err(EngineError::Topology(format!(
            "input node '{}' of '{}' does not exist",
            input, name
          )));
        }
        Some(n) if n.kind == NodeKind::Sink => {
          return Err(EngineError::Topology(format!(
            "sink node '{}' cannot feed '{}'",
            input, name
          )));
        }
        Some(_) => {}
      }
    }
    self.nodes.push(NodeEntry {
      node,
      inputs: inputs.iter().map(|s| s.to_string()).collect(),
      kind,
    });
    Ok(())
  }

  fn state_for(&self, op_id: &str) -> Arc<dyn StateStore> {
    match &self.state {
      Some(kv) => Arc::new(KvStateStore::new(Arc::clone(kv), op_id)),
      None => Arc::new(MemoryStateStore::new()),
    }
  }

  /// Wires the edges and starts every node.
  ///
  /// # Returns
  ///
  /// The error handle of the running topology, or an error if the topology was already
  /// opened or has no node.
  pub fn open(&mut self) -> EngineResult<TopologyErrors> {
    if self.opened {
      return Err(EngineError::Topology(format!(
        "topology of rule {} is already open",
        self.rule_id
      )));
    }
    if self.nodes.is_empty() {
      return Err(EngineError::Topology(format!(
        "topology of rule {} has no nodes",
        self.rule_id
      )));
    }
    self.opened = true;

    let mut senders: HashMap<String, Vec<mpsc::Sender<Item>>> = HashMap::new();
    let mut receivers: HashMap<String, Vec<ReceiverStream<Item>>> = HashMap::new();
    for entry in &self.nodes {
      for input in &entry.inputs {
        let (tx, rx) = mpsc::channel(self.options.buffer_length.max(1));
        senders.entry(input.clone()).or_default().push(tx);
        receivers
          .entry(entry.node.name().to_string())
          .or_default()
          .push(ReceiverStream::new(rx));
      }
    }

    let (err_tx, err_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
    let reporter = ErrorReporter {
      rule_id: self.rule_id.clone(),
      tx: err_tx,
      cancel: self.cancel.clone(),
      cancel_on_error: self.options.cancel_on_error,
    };

    let mut spawned = Vec::new();
    for entry in &self.nodes {
      let name = entry.node.name().to_string();
      let inbox = match receivers.remove(&name) {
        Some(streams) => {
          let merged: InputStream = Box::pin(select_all(streams));
          Inbox::new(merged)
        }
        None => Inbox::empty(),
      };
      let emitter = Emitter::new(
        self.rule_id.clone(),
        name.clone(),
        senders.remove(&name).unwrap_or_default(),
        self.cancel.clone(),
      );
      if entry.kind != NodeKind::Sink && emitter.fan_out() == 0 {
        warn!(rule = %self.rule_id, op = %name, "node output is not consumed");
      }
      let state = self.state_for(&name);
      let concurrency = entry.node.concurrency().max(1);
      for instance in 0..concurrency {
        let ctx = NodeContext {
          rule_id: self.rule_id.clone(),
          op_id: name.clone(),
          instance,
          cancel: self.cancel.clone(),
          state: Arc::clone(&state),
        };
        let node = Arc::clone(&entry.node);
        let inbox = inbox.clone();
        let emitter = emitter.clone();
        let reporter = reporter.clone();
        spawned.push(tokio::spawn(async move {
          let op_id = ctx.op_id.clone();
          debug!(rule = %ctx.rule_id, op = %op_id, instance, "node started");
          match node.run(ctx, inbox, emitter).await {
            Ok(()) => debug!(op = %op_id, instance, "node finished"),
            Err(e) => reporter.report(&op_id, e),
          }
        }));
      }
    }
    info!(rule = %self.rule_id, nodes = self.nodes.len(), "topology opened");

    // Only node tasks hold reporters from here on.
    drop(reporter);
    self.handles.get_mut().extend(spawned);
    Ok(TopologyErrors { rx: err_rx })
  }

  /// Broadcasts cancellation to every node. Idempotent.
  pub fn cancel(&self) {
    if !self.cancel.is_cancelled() {
      info!(rule = %self.rule_id, "cancelling topology");
    }
    self.cancel.cancel();
  }

  /// Returns true once [`Topology::cancel`] was called or a fatal error cancelled it.
  pub fn is_cancelled(&self) -> bool {
    self.cancel.is_cancelled()
  }

  /// Waits until every node task has exited.
  ///
  /// # Errors
  ///
  /// Returns [`EngineError::Join`] if a node task panicked.
  pub async fn wait_for_completion(&self) -> EngineResult<()> {
    let handles = {
      let mut guard = self.handles.lock().await;
      std::mem::take(&mut *guard)
    };
    let mut first = None;
    for handle in handles {
      if let Err(e) = handle.await {
        error!(rule = %self.rule_id, error = %e, "node task panicked");
        first.get_or_insert(EngineError::from(e));
      }
    }
    match first {
      Some(e) => Err(e),
      None => Ok(()),
    }
  }
}
