//! Async shell around [`WindowState`].

use super::node::{Emitter, Inbox, Node, NodeContext};
use crate::clock::ClockRef;
use crate::error::EngineResult;
use crate::metrics;
use crate::operators::{WindowConfig, WindowState};
use crate::tuple::{StreamItem, WindowTuplesSet};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Runs a window operator.
///
/// The node feeds arriving tuples into the state machine, sleeps until the next
/// processing-time deadline reported by [`WindowState::next_deadline`], and flushes open
/// windows when every upstream edge has closed. Times come from the injected clock.
pub struct WindowNode {
  name: String,
  config: WindowConfig,
  clock: ClockRef,
}

impl WindowNode {
  /// Creates a window node.
  pub fn new(name: impl Into<String>, config: WindowConfig, clock: ClockRef) -> Self {
    Self {
      name: name.into(),
      config,
      clock,
    }
  }

  async fn emit_all(&self, emitter: &Emitter, sets: Vec<WindowTuplesSet>) -> bool {
    for set in sets {
      trace!(op = %self.name, range = ?set.range, tuples = set.len(), "window fired");
      if !emitter.emit_item(StreamItem::Window(set)).await {
        return false;
      }
    }
    true
  }
}

async fn sleep_until_due(wait: Option<Duration>) {
  match wait {
    Some(d) => tokio::time::sleep(d).await,
    None => std::future::pending::<()>().await,
  }
}

#[async_trait]
impl Node for WindowNode {
  fn name(&self) -> &str {
    &self.name
  }

  async fn run(&self, ctx: NodeContext, inbox: Inbox, emitter: Emitter) -> EngineResult<()> {
    let mut state = WindowState::new(self.config.clone());
    loop {
      let wait = state.next_deadline().map(|deadline| {
        let ms = deadline.saturating_sub(self.clock.now_ms()).max(0);
        Duration::from_millis(ms as u64)
      });
      tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => break,
        _ = sleep_until_due(wait) => {
          let fired = state.on_tick(self.clock.now_ms());
          if !self.emit_all(&emitter, fired).await {
            break;
          }
        }
        item = inbox.next() => {
          let Some(item) = item else {
            debug!(op = %self.name, "input closed, flushing windows");
            let rest = state.flush();
            self.emit_all(&emitter, rest).await;
            break;
          };
          metrics::record_records_in(&ctx.rule_id, &ctx.op_id, 1);
          let delivered = match item.as_ref() {
            StreamItem::Tuple(t) => {
              let out = state.on_tuple(t.clone(), self.clock.now_ms());
              if out.late_dropped {
                metrics::record_late_drop(&ctx.rule_id, &ctx.op_id);
                debug!(op = %self.name, ts = t.timestamp, watermark = ?state.watermark(), "late tuple dropped");
              }
              self.emit_all(&emitter, out.fired).await
            }
            StreamItem::Error(_) => emitter.emit(item.clone()).await,
            other => {
              warn!(op = %self.name, kind = other.kind(), "window received non-tuple input");
              emitter.emit(item.clone()).await
            }
          };
          if !delivered {
            break;
          }
        }
      }
    }
    debug!(rule = %ctx.rule_id, op = %self.name, "window exits");
    Ok(())
  }
}
