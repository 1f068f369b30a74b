//! Sink node: batching, retries and the durable cache in front of a [`Sink`].

use super::node::{Emitter, Inbox, Node, NodeContext};
use crate::config::SinkConf;
use crate::error::{EngineError, EngineResult, SinkError, StoreError};
use crate::message;
use crate::metrics;
use crate::sink::{Cache, Payload, Sink, SinkContext, SinkRegistry};
use crate::store::KeyValueStore;
use crate::tuple::StreamItem;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Delivers the rule's output through one action.
///
/// Each input item becomes one batch (or one batch per record with `sendSingle`); empty
/// batches are skipped with `omitIfEmpty`. Error items are delivered as
/// `{"error": message}` records. A failed delivery is retried `retryCount` times,
/// `retryInterval` apart.
///
/// Without the cache an undeliverable batch is logged and dropped. With `enableCache`
/// every batch is recorded in a [`Cache`] before delivery, the cache is saved on its
/// save interval and at shutdown, and batches left over from a previous run are
/// delivered first. A delivery that still fails after its retries stops the node.
pub struct SinkNode {
  name: String,
  action: String,
  props: serde_json::Value,
  conf: SinkConf,
  registry: Arc<SinkRegistry>,
  cache_store: Option<Arc<dyn KeyValueStore>>,
}

impl SinkNode {
  /// Creates a sink node.
  ///
  /// # Arguments
  ///
  /// * `name` - Node name, used as the operator id.
  /// * `action` - Registered sink type.
  /// * `props` - Action properties: the common [`SinkConf`] keys plus sink specific ones.
  /// * `registry` - Sink factories.
  /// * `cache_store` - Store for the sink cache; required when `enableCache` is set.
  ///
  /// # Errors
  ///
  /// Fails for an unknown action, invalid properties, or a cache without a store.
  pub fn new(
    name: impl Into<String>,
    action: impl Into<String>,
    props: serde_json::Value,
    registry: Arc<SinkRegistry>,
    cache_store: Option<Arc<dyn KeyValueStore>>,
  ) -> EngineResult<Self> {
    let action = action.into();
    let conf = SinkConf::from_props(&props)?;
    registry.create(&action)?.configure(&props)?;
    if conf.enable_cache && cache_store.is_none() {
      return Err(EngineError::validation(format!(
        "sink {} enables the cache but no store is available",
        action
      )));
    }
    Ok(Self {
      name: name.into(),
      action,
      props,
      conf,
      registry,
      cache_store,
    })
  }

  /// The parsed common settings.
  pub fn conf(&self) -> &SinkConf {
    &self.conf
  }

  fn payloads(&self, item: &StreamItem) -> Vec<Payload> {
    let records = match item {
      StreamItem::Rows(rows) => rows.clone(),
      StreamItem::Error(e) => vec![message! { "error" => e.message.clone() }],
      StreamItem::Tuple(t) => vec![t.message.clone()],
      other => {
        warn!(op = %self.name, kind = other.kind(), "sink ignores unprojected input");
        return Vec::new();
      }
    };
    if records.is_empty() && self.conf.omit_if_empty {
      return Vec::new();
    }
    if self.conf.send_single {
      records.into_iter().map(|r| vec![r]).collect()
    } else {
      vec![records]
    }
  }

  async fn run_direct(
    &self,
    ctx: &NodeContext,
    inbox: &Inbox,
    sink: &dyn Sink,
    sctx: &SinkContext,
  ) -> EngineResult<()> {
    while let Some(item) = inbox.next_or_cancel(&ctx.cancel).await {
      metrics::record_records_in(&ctx.rule_id, &ctx.op_id, 1);
      for payload in self.payloads(&item) {
        match deliver(sink, sctx, &self.conf, &payload, &ctx.cancel).await {
          Ok(true) => {}
          Ok(false) => return Ok(()),
          Err(e) => warn!(op = %self.name, error = %e, records = payload.len(), "delivery failed, batch dropped"),
        }
      }
    }
    Ok(())
  }

  async fn run_cached(
    &self,
    ctx: &NodeContext,
    inbox: &Inbox,
    sink: Arc<dyn Sink>,
    sctx: SinkContext,
    store: Arc<dyn KeyValueStore>,
  ) -> EngineResult<()> {
    let key = format!("{}{}{}", ctx.rule_id, ctx.op_id, ctx.instance);
    let mut cache = Cache::load(store, key)?;
    let (queue_tx, queue_rx) = mpsc::channel::<(u64, Payload)>(self.conf.cache_length.max(1));
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<u64>();
    let (save_err_tx, mut save_err_rx) = mpsc::unbounded_channel::<StoreError>();
    let mut worker = tokio::spawn(delivery_worker(
      sink,
      sctx,
      self.conf.clone(),
      queue_rx,
      done_tx,
      ctx.cancel.clone(),
    ));

    let replay: Vec<(u64, Payload)> = cache.pending().map(|(i, p)| (i, p.clone())).collect();
    if !replay.is_empty() {
      info!(op = %self.name, batches = replay.len(), "replaying cached batches");
    }
    for entry in replay {
      if !offer(&queue_tx, entry, &ctx.cancel).await {
        break;
      }
    }

    let mut queue = Some(queue_tx);
    let period = self.conf.cache_save_interval();
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    let outcome: EngineResult<()> = loop {
      tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => break Ok(()),
        Some(err) = save_err_rx.recv() => break Err(err.into()),
        Some(index) = done_rx.recv() => {
          cache.complete(index);
          metrics::record_cache_pending(&ctx.rule_id, &ctx.op_id, cache.len());
        }
        joined = &mut worker => {
          break match joined {
            Ok(r) => r.map_err(EngineError::from),
            Err(e) => Err(e.into()),
          };
        }
        _ = ticker.tick() => {
          if let Some(job) = cache.tick() {
            let tx = save_err_tx.clone();
            tokio::task::spawn_blocking(move || {
              if let Err(e) = job.write() {
                let _ = tx.send(e);
              }
            });
          }
        }
        item = inbox.next(), if queue.is_some() => {
          let Some(item) = item else {
            debug!(op = %self.name, pending = cache.len(), "input closed, draining cache");
            queue = None;
            continue;
          };
          metrics::record_records_in(&ctx.rule_id, &ctx.op_id, 1);
          for payload in self.payloads(&item) {
            let index = cache.add(payload.clone());
            let Some(tx) = &queue else { break };
            if !offer(tx, (index, payload), &ctx.cancel).await {
              break;
            }
          }
          metrics::record_cache_pending(&ctx.rule_id, &ctx.op_id, cache.len());
        }
      }
    };

    while let Ok(index) = done_rx.try_recv() {
      cache.complete(index);
    }
    worker.abort();
    let saved = cache.save_now().map_err(EngineError::from);
    debug!(op = %self.name, pending = cache.len(), "sink cache closed");
    outcome.and(saved)
  }
}

/// Sends to the delivery queue unless cancelled first.
async fn offer(
  tx: &mpsc::Sender<(u64, Payload)>,
  entry: (u64, Payload),
  cancel: &CancellationToken,
) -> bool {
  tokio::select! {
    biased;
    _ = cancel.cancelled() => false,
    sent = tx.send(entry) => sent.is_ok(),
  }
}

/// Delivers one batch with retries.
///
/// # Returns
///
/// `Ok(true)` once delivered, `Ok(false)` if cancelled while waiting to retry, or the
/// last error after the retries are exhausted.
async fn deliver(
  sink: &dyn Sink,
  sctx: &SinkContext,
  conf: &SinkConf,
  payload: &Payload,
  cancel: &CancellationToken,
) -> Result<bool, SinkError> {
  let mut attempt = 0;
  loop {
    match sink.collect(sctx, payload).await {
      Ok(()) => return Ok(true),
      Err(e) if attempt < conf.retry_count => {
        attempt += 1;
        debug!(op = %sctx.op_id, attempt, error = %e, "delivery failed, retrying");
        tokio::select! {
          _ = cancel.cancelled() => return Ok(false),
          _ = tokio::time::sleep(conf.retry_interval()) => {}
        }
      }
      Err(e) => return Err(e),
    }
  }
}

async fn delivery_worker(
  sink: Arc<dyn Sink>,
  sctx: SinkContext,
  conf: SinkConf,
  mut queue: mpsc::Receiver<(u64, Payload)>,
  done: mpsc::UnboundedSender<u64>,
  cancel: CancellationToken,
) -> Result<(), SinkError> {
  loop {
    let next = tokio::select! {
      biased;
      _ = cancel.cancelled() => return Ok(()),
      next = queue.recv() => next,
    };
    let Some((index, payload)) = next else {
      return Ok(());
    };
    if !deliver(sink.as_ref(), &sctx, &conf, &payload, &cancel).await? {
      return Ok(());
    }
    let _ = done.send(index);
  }
}

#[async_trait]
impl Node for SinkNode {
  fn name(&self) -> &str {
    &self.name
  }

  fn concurrency(&self) -> usize {
    self.conf.concurrency
  }

  async fn run(&self, ctx: NodeContext, inbox: Inbox, _emitter: Emitter) -> EngineResult<()> {
    let mut sink = self.registry.create(&self.action)?;
    sink.configure(&self.props)?;
    let sink: Arc<dyn Sink> = Arc::from(sink);
    let sctx = SinkContext {
      rule_id: ctx.rule_id.clone(),
      op_id: ctx.op_id.clone(),
      instance: ctx.instance,
    };
    sink.open(&sctx).await?;
    info!(rule = %ctx.rule_id, op = %self.name, action = %self.action, cached = self.conf.enable_cache, "sink opened");

    let result = match (&self.cache_store, self.conf.enable_cache) {
      (Some(store), true) => {
        self
          .run_cached(&ctx, &inbox, Arc::clone(&sink), sctx.clone(), Arc::clone(store))
          .await
      }
      _ => self.run_direct(&ctx, &inbox, sink.as_ref(), &sctx).await,
    };
    if let Err(e) = sink.close(&sctx).await {
      warn!(op = %self.name, error = %e, "closing sink failed");
    }
    debug!(rule = %ctx.rule_id, op = %self.name, instance = ctx.instance, "sink exits");
    result
  }
}
