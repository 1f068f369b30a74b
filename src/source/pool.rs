//! # Source instance pool
//!
//! Rules that read the same shared stream share one physical connection. The pool keys
//! connections by `"{type}.{datasource}"` for shared streams; an exclusive stream gets a
//! connection per source node instance, keyed
//! `"{type}.{datasource}.{rule}.{op}.{instance}"`.
//!
//! Each connection has a distributor task that copies every record into the bounded
//! queue of each registered consumer, so a slow consumer slows the connection down
//! instead of losing records. The registry lock is only taken to add or remove
//! consumers and connections; record delivery never touches it.
//!
//! A connection is closed exactly once, by the [`SourcePool::release`] call that removes
//! its last consumer.

use super::{Rewindable, Source, SourceContext, SourceProps, SourceRegistry, SourceTuple};
use crate::ast::StreamDefinition;
use crate::error::SourceError;
use crate::value::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of each consumer's error queue.
const ERROR_QUEUE_LENGTH: usize = 8;

/// What a source node asks the pool for.
#[derive(Debug, Clone)]
pub struct SourceSpec {
  /// Registered source type.
  pub source_type: String,
  /// Source specific address.
  pub datasource: String,
  /// Share one connection across rules.
  pub shared: bool,
  /// Source properties.
  pub props: SourceProps,
  /// Capacity of the consumer queue.
  pub buffer_length: usize,
}

impl SourceSpec {
  /// Builds the request for a stream definition.
  pub fn from_stream(stream: &StreamDefinition, buffer_length: usize) -> Self {
    Self {
      source_type: stream.options.source_type.clone(),
      datasource: stream.options.datasource.clone(),
      shared: stream.options.shared,
      props: stream.options.props.clone(),
      buffer_length,
    }
  }

  /// Pool key of the connection serving `consumer`.
  pub fn key(&self, consumer: &ConsumerId) -> String {
    if self.shared {
      format!("{}.{}", self.source_type, self.datasource)
    } else {
      format!(
        "{}.{}.{}.{}.{}",
        self.source_type, self.datasource, consumer.rule_id, consumer.op_id, consumer.instance
      )
    }
  }
}

/// A consumer of a pooled connection: one instance of one source node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerId {
  /// Rule of the source node.
  pub rule_id: String,
  /// Source node name.
  pub op_id: String,
  /// Worker instance of the node.
  pub instance: usize,
}

impl ConsumerId {
  /// Creates a consumer id.
  pub fn new(rule_id: impl Into<String>, op_id: impl Into<String>, instance: usize) -> Self {
    Self {
      rule_id: rule_id.into(),
      op_id: op_id.into(),
      instance,
    }
  }
}

/// A consumer's end of a pooled connection.
pub struct SourceHandle {
  /// Pool key of the connection.
  pub key: String,
  /// Records, in source order. Closed when the source ends.
  pub data: mpsc::Receiver<SourceTuple>,
  /// Connection errors.
  pub errors: mpsc::Receiver<SourceError>,
  source: Arc<dyn Source>,
}

impl SourceHandle {
  /// The connection's rewind capability, if it has one.
  pub fn rewindable(&self) -> Option<&dyn Rewindable> {
    self.source.as_rewindable()
  }
}

#[derive(Debug, Clone, PartialEq)]
enum Status {
  Running,
  Ended,
  Failed(String),
}

struct Consumer {
  data: Option<mpsc::Sender<SourceTuple>>,
  errors: mpsc::Sender<SourceError>,
}

struct Shared {
  consumers: HashMap<ConsumerId, Consumer>,
  status: Status,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
  shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct PoolEntry {
  source: Arc<dyn Source>,
  shared: Arc<Mutex<Shared>>,
  cancel: CancellationToken,
  tasks: Vec<JoinHandle<()>>,
}

/// Reference-counted registry of live source connections.
pub struct SourcePool {
  registry: Arc<SourceRegistry>,
  entries: tokio::sync::Mutex<HashMap<String, PoolEntry>>,
}

impl SourcePool {
  /// Creates an empty pool that builds sources from `registry`.
  pub fn new(registry: Arc<SourceRegistry>) -> Self {
    Self {
      registry,
      entries: tokio::sync::Mutex::new(HashMap::new()),
    }
  }

  /// The source types this pool can open.
  pub fn registry(&self) -> &SourceRegistry {
    &self.registry
  }

  /// Registers `consumer` on the connection for `spec`, opening it if needed.
  ///
  /// # Arguments
  ///
  /// * `spec` - Source type, address and queue size.
  /// * `consumer` - The source node instance asking.
  /// * `offset` - Position to rewind a newly opened exclusive connection to.
  ///
  /// # Errors
  ///
  /// Fails when the source type is unknown, the source rejects its configuration or
  /// offset, or the existing connection has already failed.
  pub async fn acquire(
    &self,
    spec: &SourceSpec,
    consumer: ConsumerId,
    offset: Option<&Value>,
  ) -> Result<SourceHandle, SourceError> {
    let key = spec.key(&consumer);
    let mut entries = self.entries.lock().await;
    let (data_tx, data_rx) = mpsc::channel(spec.buffer_length.max(1));
    let (err_tx, err_rx) = mpsc::channel(ERROR_QUEUE_LENGTH);
    let registration = Consumer {
      data: Some(data_tx),
      errors: err_tx,
    };

    let source = match entries.get(&key) {
      Some(entry) => {
        let failure = {
          let mut shared = lock(&entry.shared);
          match shared.status.clone() {
            Status::Failed(reason) => Some((reason, shared.consumers.is_empty())),
            status => {
              let mut registration = registration;
              if status != Status::Running {
                registration.data = None;
              }
              shared.consumers.insert(consumer.clone(), registration);
              None
            }
          }
        };
        if let Some((reason, orphaned)) = failure {
          if orphaned {
            if let Some(entry) = entries.remove(&key) {
              shutdown(&key, entry).await;
            }
          }
          return Err(SourceError::Connection(reason));
        }
        Arc::clone(&entry.source)
      }
      None => {
        let entry = self.start(&key, spec, offset, consumer.clone(), registration)?;
        let source = Arc::clone(&entry.source);
        entries.insert(key.clone(), entry);
        source
      }
    };
    debug!(key = %key, consumer = ?consumer, "source consumer registered");
    Ok(SourceHandle {
      key,
      data: data_rx,
      errors: err_rx,
      source,
    })
  }

  /// Opens a connection with `first` already registered, so no record is read before a
  /// consumer can receive it.
  fn start(
    &self,
    key: &str,
    spec: &SourceSpec,
    offset: Option<&Value>,
    id: ConsumerId,
    first: Consumer,
  ) -> Result<PoolEntry, SourceError> {
    let mut source = self.registry.create(&spec.source_type)?;
    source.configure(&spec.datasource, &spec.props)?;
    let source: Arc<dyn Source> = Arc::from(source);
    if let (false, Some(offset)) = (spec.shared, offset) {
      if let Some(rewindable) = source.as_rewindable() {
        rewindable.rewind(offset)?;
        info!(key = %key, offset = %offset, "source rewound");
      }
    }

    let cancel = CancellationToken::new();
    let shared = Arc::new(Mutex::new(Shared {
      consumers: HashMap::from([(id, first)]),
      status: Status::Running,
    }));
    let (data_tx, data_rx) = mpsc::channel(spec.buffer_length.max(1));
    let (err_tx, err_rx) = mpsc::channel(ERROR_QUEUE_LENGTH);
    let ctx = SourceContext {
      key: key.to_string(),
      cancel: cancel.clone(),
    };
    let reader_source = Arc::clone(&source);
    let reader = tokio::spawn(async move {
      reader_source.open(ctx, data_tx, err_tx).await;
    });
    let distributor = tokio::spawn(distribute(
      key.to_string(),
      Arc::clone(&shared),
      data_rx,
      err_rx,
      cancel.clone(),
    ));
    info!(key = %key, source_type = %spec.source_type, "source instance opened");
    Ok(PoolEntry {
      source,
      shared,
      cancel,
      tasks: vec![reader, distributor],
    })
  }

  /// Removes every consumer registered by the node `op_id` of `rule_id`.
  ///
  /// Connections left without consumers are cancelled, closed and forgotten.
  pub async fn release(&self, rule_id: &str, op_id: &str) {
    let mut entries = self.entries.lock().await;
    let mut emptied = Vec::new();
    for (key, entry) in entries.iter() {
      let mut shared = lock(&entry.shared);
      shared
        .consumers
        .retain(|id, _| !(id.rule_id == rule_id && id.op_id == op_id));
      if shared.consumers.is_empty() {
        emptied.push(key.clone());
      }
    }
    for key in emptied {
      if let Some(entry) = entries.remove(&key) {
        shutdown(&key, entry).await;
      }
    }
  }

  /// Number of consumers of the connection `key`, if it exists.
  pub async fn consumer_count(&self, key: &str) -> Option<usize> {
    let entries = self.entries.lock().await;
    entries.get(key).map(|e| lock(&e.shared).consumers.len())
  }

  /// Returns true if the connection `key` is open.
  pub async fn contains(&self, key: &str) -> bool {
    self.entries.lock().await.contains_key(key)
  }

  /// Number of open connections.
  pub async fn len(&self) -> usize {
    self.entries.lock().await.len()
  }

  /// Returns true when no connection is open.
  pub async fn is_empty(&self) -> bool {
    self.len().await == 0
  }
}

async fn shutdown(key: &str, entry: PoolEntry) {
  entry.cancel.cancel();
  if let Err(e) = entry.source.close().await {
    warn!(key = %key, error = %e, "closing source failed");
  }
  for task in entry.tasks {
    task.abort();
  }
  info!(key = %key, "source instance closed");
}

async fn distribute(
  key: String,
  shared: Arc<Mutex<Shared>>,
  mut data: mpsc::Receiver<SourceTuple>,
  mut errors: mpsc::Receiver<SourceError>,
  cancel: CancellationToken,
) {
  loop {
    tokio::select! {
      biased;
      _ = cancel.cancelled() => return,
      Some(err) = errors.recv() => {
        warn!(key = %key, error = %err, "source connection failed");
        let targets: Vec<_> = {
          let mut s = lock(&shared);
          s.status = Status::Failed(err.to_string());
          s.consumers.values().map(|c| c.errors.clone()).collect()
        };
        for tx in targets {
          let _ = tx.try_send(err.clone());
        }
        cancel.cancel();
        return;
      }
      record = data.recv() => {
        let Some(record) = record else {
          let mut s = lock(&shared);
          s.status = Status::Ended;
          for c in s.consumers.values_mut() {
            c.data = None;
          }
          debug!(key = %key, "source stream ended");
          return;
        };
        let targets: Vec<_> = lock(&shared)
          .consumers
          .values()
          .filter_map(|c| c.data.clone())
          .collect();
        for tx in targets {
          tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tx.send(record.clone()) => {}
          }
        }
      }
    }
  }
}
