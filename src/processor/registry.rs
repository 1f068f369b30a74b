//! Rule lifecycle: start, stop, status and ad-hoc queries.

use super::{RuleProcessor, StreamProcessor};
use crate::error::{EngineError, EngineResult};
use crate::planner::{EngineContext, Planner};
use crate::sink::MemoryCollector;
use crate::topo::{SinkNode, Topology, TopologyErrors};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Observed state of a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleStatus {
  /// The topology is running.
  Running,
  /// The rule is not running.
  Stopped,
  /// The rule stopped because of a fatal error.
  Failed(String),
}

impl fmt::Display for RuleStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RuleStatus::Running => write!(f, "Running"),
      RuleStatus::Stopped => write!(f, "Stopped"),
      RuleStatus::Failed(e) => write!(f, "Stopped: {}", e),
    }
  }
}

#[derive(Default)]
struct RunState {
  first_error: Option<String>,
  finished: bool,
}

fn lock(state: &Mutex<RunState>) -> MutexGuard<'_, RunState> {
  state.lock().unwrap_or_else(|p| p.into_inner())
}

struct RunningRule {
  topology: Arc<Topology>,
  state: Arc<Mutex<RunState>>,
  supervisor: JoinHandle<()>,
}

impl RunningRule {
  fn status(&self) -> RuleStatus {
    let state = lock(&self.state);
    match (&state.first_error, state.finished) {
      (Some(e), true) => RuleStatus::Failed(e.clone()),
      (None, true) => RuleStatus::Stopped,
      _ => RuleStatus::Running,
    }
  }

  fn is_active(&self) -> bool {
    !lock(&self.state).finished
  }

  async fn stop(self) -> EngineResult<()> {
    self.topology.cancel();
    let waited = self.topology.wait_for_completion().await;
    if let Err(e) = self.supervisor.await {
      warn!(rule = %self.topology.rule_id(), error = %e, "rule supervisor failed");
    }
    waited
  }
}

/// Records the first fatal error of a topology until every node has exited.
async fn supervise(topology: Arc<Topology>, mut errors: TopologyErrors, state: Arc<Mutex<RunState>>) {
  while let Some(err) = errors.recv().await {
    let mut guard = lock(&state);
    if guard.first_error.is_none() {
      error!(rule = %topology.rule_id(), error = %err, "rule failed");
      guard.first_error = Some(err.to_string());
    }
  }
  lock(&state).finished = true;
  info!(rule = %topology.rule_id(), "rule exited");
}

/// A running ad-hoc query.
pub struct QueryHandle {
  topology: Arc<Topology>,
  results: MemoryCollector,
  supervisor: JoinHandle<()>,
}

impl QueryHandle {
  /// Records produced so far.
  pub fn results(&self) -> &MemoryCollector {
    &self.results
  }

  /// The query's topology.
  pub fn topology(&self) -> &Topology {
    &self.topology
  }

  /// Cancels the query and waits for it to exit.
  pub async fn stop(self) -> EngineResult<()> {
    self.topology.cancel();
    let waited = self.topology.wait_for_completion().await;
    let _ = self.supervisor.await;
    waited
  }
}

/// Runs rules stored in a [`RuleProcessor`].
pub struct RuleRegistry {
  ctx: EngineContext,
  streams: StreamProcessor,
  rules: RuleProcessor,
  running: tokio::sync::Mutex<HashMap<String, RunningRule>>,
}

impl RuleRegistry {
  /// Creates a registry over existing processors.
  pub fn new(ctx: EngineContext, streams: StreamProcessor, rules: RuleProcessor) -> Self {
    Self {
      ctx,
      streams,
      rules,
      running: tokio::sync::Mutex::new(HashMap::new()),
    }
  }

  /// Opens the stream and rule stores under the configured data directory.
  pub fn open(ctx: EngineContext) -> EngineResult<Self> {
    let dir = ctx.config.data_dir.clone();
    let streams = StreamProcessor::open(&dir)?;
    let rules = RuleProcessor::open(&dir)?;
    Ok(Self::new(ctx, streams, rules))
  }

  /// The engine context.
  pub fn context(&self) -> &EngineContext {
    &self.ctx
  }

  /// Stream definitions.
  pub fn streams(&self) -> &StreamProcessor {
    &self.streams
  }

  /// Rule definitions.
  pub fn rules(&self) -> &RuleProcessor {
    &self.rules
  }

  /// Plans and opens a stored rule.
  ///
  /// # Errors
  ///
  /// Fails if the rule does not exist, is already running, or cannot be planned.
  pub async fn start_rule(&self, id: &str) -> EngineResult<String> {
    let mut running = self.running.lock().await;
    if running.get(id).is_some_and(RunningRule::is_active) {
      return Err(EngineError::validation(format!(
        "Rule {} is already running.",
        id
      )));
    }
    if let Some(previous) = running.remove(id) {
      previous.stop().await?;
    }
    let rule = self.rules.get_rule(id)?;
    let mut topology = Planner::new(&self.ctx, &self.streams).plan_rule(&rule)?;
    let errors = topology.open()?;
    let topology = Arc::new(topology);
    let state = Arc::new(Mutex::new(RunState::default()));
    let supervisor = tokio::spawn(supervise(
      Arc::clone(&topology),
      errors,
      Arc::clone(&state),
    ));
    running.insert(
      id.to_string(),
      RunningRule {
        topology,
        state,
        supervisor,
      },
    );
    info!(rule = %id, "rule started");
    Ok(format!("Rule {} was started.", id))
  }

  /// Cancels a running rule and waits until its nodes have exited.
  pub async fn stop_rule(&self, id: &str) -> EngineResult<String> {
    let entry = self.running.lock().await.remove(id);
    let Some(entry) = entry else {
      return Err(EngineError::validation(format!("Rule {} is not running.", id)));
    };
    entry.stop().await?;
    info!(rule = %id, "rule stopped");
    Ok(format!("Rule {} was stopped.", id))
  }

  /// Reports whether a rule runs, and the fatal error that stopped it if any.
  pub async fn rule_status(&self, id: &str) -> EngineResult<RuleStatus> {
    if let Some(entry) = self.running.lock().await.get(id) {
      return Ok(entry.status());
    }
    self.rules.get_rule(id)?;
    Ok(RuleStatus::Stopped)
  }

  /// Stops the rule if it runs, then removes its definition.
  pub async fn drop_rule(&self, id: &str) -> EngineResult<String> {
    let entry = self.running.lock().await.remove(id);
    if let Some(entry) = entry {
      entry.stop().await?;
    }
    self.rules.drop_rule(id)
  }

  /// Runs a statement without storing a rule. Results go to the `memory` topic named
  /// after `rule_id`; operator state is kept in memory.
  pub async fn exec_query(&self, rule_id: &str, sql: &str) -> EngineResult<QueryHandle> {
    let planner = Planner::new(&self.ctx, &self.streams);
    let mut pipeline = planner.plan_pipeline(rule_id, sql, &serde_json::Map::new(), None)?;
    let sink = SinkNode::new(
      "memory_0",
      "memory",
      serde_json::json!({ "topic": rule_id }),
      Arc::clone(&self.ctx.sinks),
      None,
    )?;
    pipeline
      .topology
      .add_sink(&[pipeline.output.as_str()], Arc::new(sink))?;
    let errors = pipeline.topology.open()?;
    let topology = Arc::new(pipeline.topology);
    let supervisor = tokio::spawn(supervise(
      Arc::clone(&topology),
      errors,
      Arc::new(Mutex::new(RunState::default())),
    ));
    info!(query = %rule_id, "query started");
    Ok(QueryHandle {
      topology,
      results: self.ctx.sinks.memory_hub().collector(rule_id),
      supervisor,
    })
  }

  /// Stops every running rule.
  pub async fn shutdown(&self) {
    let entries: Vec<(String, RunningRule)> = self.running.lock().await.drain().collect();
    for (id, entry) in entries {
      if let Err(e) = entry.stop().await {
        warn!(rule = %id, error = %e, "rule did not stop cleanly");
      }
    }
  }
}
