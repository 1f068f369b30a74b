//! # Rule planning
//!
//! Turns a [`Rule`] into a [`Topology`]. For every stream the statement reads, the
//! planner adds a source node followed by a preprocessor, then chains the optional
//! stages in a fixed order:
//!
//! ```text
//! source -> preprocessor -> window -> join -> filter -> aggregate -> having -> order -> project -> sinks
//! ```
//!
//! A stage is only added when the statement needs it. Every action of the rule becomes a
//! sink node fed by the last stage.
//!
//! Planning is synchronous and does all validation up front: unknown streams, source
//! types and actions, unsupported joins and malformed options fail here rather than
//! inside a running topology.

use crate::ast::{Expr, JoinType, SelectStatement, SqlParser};
use crate::clock::{ClockRef, SystemClock};
use crate::config::{EngineConfig, RuleOptions};
use crate::error::{EngineError, EngineResult};
use crate::function::FunctionRegistry;
use crate::operators::{
  AggregateOp, FilterOp, HavingOp, JoinOp, OrderOp, PreprocessorOp, ProjectOp, WindowConfig,
};
use crate::processor::StreamProcessor;
use crate::sink::SinkRegistry;
use crate::source::{SourcePool, SourceRegistry};
use crate::store::{FileKvStore, KeyValueStore};
use crate::topo::{Node, OperatorNode, SinkNode, SourceNode, Topology, TopologyOptions, WindowNode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// A rule as submitted by users.
///
/// ```json
/// {
///   "id": "rule1",
///   "sql": "SELECT * FROM demo WHERE count > 49",
///   "actions": [{ "log": {} }, { "file": { "path": "out.jsonl" } }],
///   "options": { "isEventTime": false }
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rule {
  /// Rule id.
  #[serde(default)]
  pub id: String,
  /// The select statement.
  #[serde(default)]
  pub sql: String,
  /// Actions, each an object with a single `{action: properties}` entry.
  #[serde(default)]
  pub actions: Vec<serde_json::Map<String, serde_json::Value>>,
  /// Rule options, see [`RuleOptions`].
  #[serde(default)]
  pub options: serde_json::Map<String, serde_json::Value>,
}

impl Rule {
  /// Creates a rule without actions or options.
  pub fn new(id: impl Into<String>, sql: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      sql: sql.into(),
      ..Self::default()
    }
  }

  /// Appends an action.
  pub fn with_action(mut self, action: &str, props: serde_json::Value) -> Self {
    let mut entry = serde_json::Map::new();
    entry.insert(action.to_string(), props);
    self.actions.push(entry);
    self
  }

  /// Sets an option.
  pub fn with_option(mut self, key: &str, value: serde_json::Value) -> Self {
    self.options.insert(key.to_string(), value);
    self
  }

  /// Actions flattened into `(action, properties)` pairs, in declaration order.
  pub fn action_list(&self) -> Vec<(&str, &serde_json::Value)> {
    self
      .actions
      .iter()
      .flat_map(|m| m.iter().map(|(k, v)| (k.as_str(), v)))
      .collect()
  }
}

/// Services shared by every rule of an engine.
///
/// The context replaces process-wide singletons: the source pool, the registries, the
/// clock and the parser are all injected here and handed to the nodes that need them.
#[derive(Clone)]
pub struct EngineContext {
  /// Engine settings.
  pub config: EngineConfig,
  /// Shared source connections.
  pub pool: Arc<SourcePool>,
  /// Sink actions.
  pub sinks: Arc<SinkRegistry>,
  /// Scalar and aggregate functions.
  pub functions: Arc<FunctionRegistry>,
  /// Time source for sources and windows.
  pub clock: ClockRef,
  /// SQL parser.
  pub parser: Arc<dyn SqlParser>,
}

impl EngineContext {
  /// Creates a context with the built-in sources, sinks and functions and the system
  /// clock.
  pub fn new(config: EngineConfig, parser: Arc<dyn SqlParser>) -> Self {
    Self {
      config,
      pool: Arc::new(SourcePool::new(Arc::new(SourceRegistry::with_builtins()))),
      sinks: Arc::new(SinkRegistry::with_builtins()),
      functions: Arc::new(FunctionRegistry::with_builtins()),
      clock: Arc::new(SystemClock),
      parser,
    }
  }

  /// Replaces the source registry. Creates a fresh pool.
  pub fn with_sources(mut self, registry: SourceRegistry) -> Self {
    self.pool = Arc::new(SourcePool::new(Arc::new(registry)));
    self
  }

  /// Replaces the sink registry.
  pub fn with_sinks(mut self, registry: SinkRegistry) -> Self {
    self.sinks = Arc::new(registry);
    self
  }

  /// Replaces the function registry.
  pub fn with_functions(mut self, registry: FunctionRegistry) -> Self {
    self.functions = Arc::new(registry);
    self
  }

  /// Replaces the clock.
  pub fn with_clock(mut self, clock: ClockRef) -> Self {
    self.clock = clock;
    self
  }

  /// Opens the key/value store holding a rule's operator state.
  pub fn rule_store(&self, rule_id: &str) -> EngineResult<Arc<dyn KeyValueStore>> {
    let store = FileKvStore::open_at(self.config.data_dir.join("state"), rule_id)?;
    Ok(Arc::new(store))
  }

  /// Opens the key/value store holding a rule's sink caches.
  pub fn cache_store(&self, rule_id: &str) -> EngineResult<Arc<dyn KeyValueStore>> {
    let store = FileKvStore::open_at(self.config.data_dir.join("cache"), rule_id)?;
    Ok(Arc::new(store))
  }
}

/// A topology whose operator stages are wired but which has no sink yet.
pub struct Pipeline {
  /// The topology under construction.
  pub topology: Topology,
  /// Name of the node the sinks attach to.
  pub output: String,
  /// Store for operator state, if the rule is durable.
  pub store: Option<Arc<dyn KeyValueStore>>,
}

/// Builds topologies for rules and queries.
pub struct Planner<'a> {
  ctx: &'a EngineContext,
  streams: &'a StreamProcessor,
}

impl<'a> Planner<'a> {
  /// Creates a planner resolving stream names through `streams`.
  pub fn new(ctx: &'a EngineContext, streams: &'a StreamProcessor) -> Self {
    Self { ctx, streams }
  }

  /// Plans a rule: the operator pipeline plus one sink node per action.
  ///
  /// Operator state and sink caches live in separate stores under the data directory.
  ///
  /// # Errors
  ///
  /// Returns a validation, parse or not-found error describing the first problem found.
  pub fn plan_rule(&self, rule: &Rule) -> EngineResult<Topology> {
    if rule.actions.is_empty() {
      return Err(EngineError::validation("Missing rule actions."));
    }
    let store = self.ctx.rule_store(&rule.id)?;
    let mut pipeline = self.plan_pipeline(&rule.id, &rule.sql, &rule.options, Some(store))?;
    let cache_store = self.ctx.cache_store(&rule.id)?;
    for (i, (action, props)) in rule.action_list().into_iter().enumerate() {
      let name = format!("{}_{}", action.to_lowercase(), i);
      let sink = SinkNode::new(
        name,
        action,
        props.clone(),
        Arc::clone(&self.ctx.sinks),
        Some(Arc::clone(&cache_store)),
      )?;
      debug!(rule = %rule.id, action, "sink planned");
      pipeline
        .topology
        .add_sink(&[pipeline.output.as_str()], Arc::new(sink))?;
    }
    info!(rule = %rule.id, nodes = pipeline.topology.node_names().len(), "rule planned");
    Ok(pipeline.topology)
  }

  /// Plans the operator stages of a statement.
  ///
  /// # Arguments
  ///
  /// * `rule_id` - Id of the rule or query.
  /// * `sql` - The select statement.
  /// * `options` - The rule's `options` object.
  /// * `store` - Durable state store; `None` keeps state in memory.
  pub fn plan_pipeline(
    &self,
    rule_id: &str,
    sql: &str,
    options: &serde_json::Map<String, serde_json::Value>,
    store: Option<Arc<dyn KeyValueStore>>,
  ) -> EngineResult<Pipeline> {
    if sql.trim().is_empty() {
      return Err(EngineError::validation("Missing rule SQL."));
    }
    let options = RuleOptions::from_json(&self.ctx.config.rule, options)?;
    let stmt = self
      .ctx
      .parser
      .parse_select(sql)
      .map_err(|reason| EngineError::Parse {
        sql: sql.to_string(),
        reason,
      })?;
    validate_statement(&stmt)?;

    let mut topology = Topology::new(
      rule_id,
      TopologyOptions {
        buffer_length: options.buffer_length,
        cancel_on_error: options.cancel_on_error,
      },
    );
    if let Some(store) = &store {
      topology = topology.with_state_store(Arc::clone(store));
    }

    let streams = stmt.streams();
    let mut inputs = Vec::with_capacity(streams.len());
    for name in &streams {
      inputs.push(self.add_stream(&mut topology, name, &options)?);
    }

    let functions = &self.ctx.functions;
    if let Some(spec) = stmt.window {
      let config = WindowConfig {
        spec,
        is_event_time: options.is_event_time,
        late_tolerance: options.late_tolerance,
        streams: streams.clone(),
      };
      let node = WindowNode::new("window", config, Arc::clone(&self.ctx.clock));
      inputs = vec![add_operator(&mut topology, &inputs, Arc::new(node))?];
    }
    if !stmt.joins.is_empty() {
      let op = JoinOp::new(stmt.source.clone(), stmt.joins.clone(), Arc::clone(functions));
      inputs = vec![add_stage(&mut topology, &inputs, "join", Arc::new(op), options.concurrency)?];
    }
    if let Some(cond) = &stmt.condition {
      let op = FilterOp::new(cond.clone(), Arc::clone(functions));
      inputs = vec![add_stage(&mut topology, &inputs, "filter", Arc::new(op), options.concurrency)?];
    }
    if is_aggregate(&stmt, functions) {
      let op = AggregateOp::new(stmt.group_by.clone(), Arc::clone(functions));
      inputs = vec![add_stage(&mut topology, &inputs, "aggregate", Arc::new(op), options.concurrency)?];
    }
    if let Some(cond) = &stmt.having {
      let op = HavingOp::new(cond.clone(), Arc::clone(functions));
      inputs = vec![add_stage(&mut topology, &inputs, "having", Arc::new(op), options.concurrency)?];
    }
    if !stmt.sort_fields.is_empty() {
      let op = OrderOp::new(stmt.sort_fields.clone(), Arc::clone(functions));
      inputs = vec![add_stage(&mut topology, &inputs, "order", Arc::new(op), options.concurrency)?];
    }
    let op = ProjectOp::new(
      stmt.fields.clone(),
      options.send_meta_to_sink,
      Arc::clone(functions),
    );
    let output = add_stage(&mut topology, &inputs, "project", Arc::new(op), options.concurrency)?;

    Ok(Pipeline {
      topology,
      output,
      store,
    })
  }

  /// Adds the source and preprocessor of one stream and returns the preprocessor name.
  fn add_stream(
    &self,
    topology: &mut Topology,
    name: &str,
    options: &RuleOptions,
  ) -> EngineResult<String> {
    let stream = self.streams.get_stream(name).map_err(|e| match e {
      EngineError::NotFound { .. } => EngineError::validation(format!(
        "fail to get stream {}, please check if stream is created",
        name
      )),
      other => other,
    })?;
    if !self.ctx.pool.registry().contains(&stream.options.source_type) {
      return Err(EngineError::validation(format!(
        "unknown source type {} of stream {}",
        stream.options.source_type, stream.name
      )));
    }
    let event_time_field = if options.is_event_time {
      let field = stream.options.timestamp.clone().ok_or_else(|| {
        EngineError::validation(format!(
          "stream {} needs a timestamp field for event-time rules",
          stream.name
        ))
      })?;
      Some(field)
    } else {
      None
    };

    let source = SourceNode::new(
      &stream,
      Arc::clone(&self.ctx.pool),
      Arc::clone(&self.ctx.clock),
      self.ctx.config.buffer_length,
    );
    topology.add_source(Arc::new(source))?;
    let op = PreprocessorOp::new(stream.clone(), event_time_field);
    add_stage(
      topology,
      &[stream.name.clone()],
      &format!("preprocessor_{}", stream.name),
      Arc::new(op),
      options.concurrency,
    )
  }
}

fn add_operator(
  topology: &mut Topology,
  inputs: &[String],
  node: Arc<dyn Node>,
) -> EngineResult<String> {
  let name = node.name().to_string();
  let inputs: Vec<&str> = inputs.iter().map(String::as_str).collect();
  topology.add_operator(&inputs, node)?;
  Ok(name)
}

fn add_stage(
  topology: &mut Topology,
  inputs: &[String],
  name: &str,
  op: Arc<dyn crate::operators::Operation>,
  concurrency: usize,
) -> EngineResult<String> {
  let node = OperatorNode::new(name, op).with_concurrency(concurrency);
  add_operator(topology, inputs, Arc::new(node))
}

/// Rejects statements the engine cannot run.
fn validate_statement(stmt: &SelectStatement) -> EngineResult<()> {
  if stmt.fields.is_empty() {
    return Err(EngineError::validation("the select statement has no fields"));
  }
  for join in &stmt.joins {
    match join.join_type {
      JoinType::Inner | JoinType::Cross => {}
      other => {
        return Err(EngineError::validation(format!(
          "{:?} join of stream {} is not supported",
          other, join.stream
        )));
      }
    }
  }
  if !stmt.joins.is_empty() && stmt.window.is_none() {
    return Err(EngineError::validation(
      "a join requires a window in the GROUP BY clause",
    ));
  }
  if let Some(w) = &stmt.window {
    if w.length <= 0 || w.interval < 0 {
      return Err(EngineError::validation(format!(
        "invalid window length {} and interval {}",
        w.length, w.interval
      )));
    }
  }
  Ok(())
}

/// Returns true if the statement groups rows: it has dimensions, a `HAVING` clause or
/// calls an aggregate function in its select list or sort fields.
pub fn is_aggregate(stmt: &SelectStatement, functions: &FunctionRegistry) -> bool {
  if !stmt.group_by.is_empty() || stmt.having.is_some() {
    return true;
  }
  stmt
    .fields
    .iter()
    .map(|f| &f.expr)
    .chain(stmt.sort_fields.iter().map(|s| &s.expr))
    .any(|e| calls_aggregate(e, functions))
}

fn calls_aggregate(expr: &Expr, functions: &FunctionRegistry) -> bool {
  let mut found = false;
  expr.walk(&mut |e| {
    if let Expr::Call { name, .. } = e {
      found |= functions.is_aggregate(name);
    }
  });
  found
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ast::{
    BinaryOp, Field, Join, PreparedStatements, StreamDefinition, StreamOptions, TimeUnit,
    WindowSpec,
  };
  use serde_json::json;
  use tempfile::TempDir;

  fn stream(name: &str) -> StreamDefinition {
    StreamDefinition::new(
      name,
      vec![],
      StreamOptions {
        datasource: name.to_string(),
        source_type: "memory".to_string(),
        ..StreamOptions::default()
      },
    )
  }

  fn setup(dir: &TempDir, stmts: &[(&str, SelectStatement)]) -> (EngineContext, StreamProcessor) {
    let parser = PreparedStatements::new();
    for (sql, stmt) in stmts {
      parser.prepare(sql, stmt.clone());
    }
    let ctx = EngineContext::new(
      EngineConfig::default().with_data_dir(dir.path()),
      Arc::new(parser),
    );
    let streams = StreamProcessor::open(dir.path()).unwrap();
    streams.create_stream(stream("demo")).unwrap();
    streams.create_stream(stream("other")).unwrap();
    (ctx, streams)
  }

  fn select_all(source: &str) -> SelectStatement {
    SelectStatement {
      fields: vec![Field::new(Expr::wildcard())],
      source: source.to_string(),
      ..SelectStatement::default()
    }
  }

  #[test]
  fn test_plans_stages_in_order() {
    let dir = TempDir::new().unwrap();
    let stmt = SelectStatement {
      fields: vec![
        Field::new(Expr::field("color")),
        Field::aliased(Expr::call("count", vec![Expr::wildcard()]), "c"),
      ],
      condition: Some(Expr::binary(BinaryOp::Gt, Expr::field("size"), Expr::lit(1i64))),
      window: Some(WindowSpec::tumbling(TimeUnit::Ss, 10)),
      group_by: vec![Expr::field("color")],
      sort_fields: vec![crate::ast::SortField {
        expr: Expr::field("color"),
        ascending: true,
      }],
      ..select_all("demo")
    };
    let (ctx, streams) = setup(&dir, &[("SELECT color FROM demo", stmt)]);
    let rule = Rule::new("r1", "SELECT color FROM demo").with_action("log", json!({}));
    let topo = Planner::new(&ctx, &streams).plan_rule(&rule).unwrap();
    assert_eq!(
      topo.node_names(),
      vec![
        "demo",
        "preprocessor_demo",
        "window",
        "filter",
        "aggregate",
        "order",
        "project",
        "log_0"
      ]
    );
  }

  #[test]
  fn test_state_and_cache_use_separate_stores() {
    let dir = TempDir::new().unwrap();
    let (ctx, streams) = setup(&dir, &[("SELECT * FROM demo", select_all("demo"))]);
    let rule = Rule::new("r1", "SELECT * FROM demo")
      .with_action("log", json!({ "enableCache": true }));
    Planner::new(&ctx, &streams).plan_rule(&rule).unwrap();
    assert!(dir.path().join("state").is_dir());
    assert!(dir.path().join("cache").is_dir());

    let state = ctx.rule_store("r1").unwrap();
    let cache = ctx.cache_store("r1").unwrap();
    state.replace("demo/$$offset", json!(3)).unwrap();
    assert_eq!(cache.get("demo/$$offset").unwrap(), None);
  }

  #[test]
  fn test_join_reads_every_stream() {
    let dir = TempDir::new().unwrap();
    let stmt = SelectStatement {
      joins: vec![Join {
        stream: "other".to_string(),
        join_type: JoinType::Inner,
        condition: Some(Expr::binary(
          BinaryOp::Eq,
          Expr::qualified("demo", "id"),
          Expr::qualified("other", "id"),
        )),
      }],
      window: Some(WindowSpec::tumbling(TimeUnit::Ss, 1)),
      ..select_all("demo")
    };
    let (ctx, streams) = setup(&dir, &[("q", stmt)]);
    let pipeline = Planner::new(&ctx, &streams)
      .plan_pipeline("r1", "q", &serde_json::Map::new(), None)
      .unwrap();
    assert_eq!(
      pipeline.topology.inputs_of("window"),
      Some(&["preprocessor_demo".to_string(), "preprocessor_other".to_string()][..])
    );
    assert_eq!(pipeline.topology.inputs_of("join"), Some(&["window".to_string()][..]));
    assert_eq!(pipeline.output, "project");
  }

  #[test]
  fn test_rejects_invalid_rules() {
    let dir = TempDir::new().unwrap();
    let left = SelectStatement {
      joins: vec![Join {
        stream: "other".to_string(),
        join_type: JoinType::Left,
        condition: None,
      }],
      window: Some(WindowSpec::tumbling(TimeUnit::Ss, 1)),
      ..select_all("demo")
    };
    let unwindowed = SelectStatement {
      joins: vec![Join {
        stream: "other".to_string(),
        join_type: JoinType::Cross,
        condition: None,
      }],
      ..select_all("demo")
    };
    let (ctx, streams) = setup(
      &dir,
      &[
        ("left", left),
        ("unwindowed", unwindowed),
        ("missing", select_all("nope")),
        ("ok", select_all("demo")),
      ],
    );
    let planner = Planner::new(&ctx, &streams);
    let plan = |rule: Rule| planner.plan_rule(&rule).map(|_| ()).unwrap_err().to_string();

    assert!(plan(Rule::new("r", "left").with_action("log", json!({}))).contains("not supported"));
    assert!(plan(Rule::new("r", "unwindowed").with_action("log", json!({}))).contains("requires a window"));
    assert_eq!(
      plan(Rule::new("r", "missing").with_action("log", json!({}))),
      "fail to get stream nope, please check if stream is created"
    );
    assert_eq!(
      plan(Rule::new("r", "ok").with_action("kafka", json!({}))),
      "unsupported action: kafka"
    );
    assert_eq!(plan(Rule::new("r", "ok")), "Missing rule actions.");
    assert_eq!(
      plan(
        Rule::new("r", "ok")
          .with_action("log", json!({}))
          .with_option("isEventTime", json!("yes"))
      ),
      "Invalid rule option isEventTime \"yes\", bool type is required."
    );
    assert_eq!(
      plan(
        Rule::new("r", "ok")
          .with_action("log", json!({}))
          .with_option("isEventTime", json!(true))
      ),
      "stream demo needs a timestamp field for event-time rules"
    );
    assert!(plan(Rule::new("r", "unknown sql").with_action("log", json!({}))).starts_with("Parse SQL unknown sql error"));
  }

  #[test]
  fn test_aggregate_detection() {
    let functions = FunctionRegistry::with_builtins();
    let plain = select_all("demo");
    assert!(!is_aggregate(&plain, &functions));
    let counted = SelectStatement {
      fields: vec![Field::new(Expr::call("count", vec![Expr::wildcard()]))],
      ..select_all("demo")
    };
    assert!(is_aggregate(&counted, &functions));
    let scalar = SelectStatement {
      fields: vec![Field::new(Expr::call("upper", vec![Expr::field("color")]))],
      ..select_all("demo")
    };
    assert!(!is_aggregate(&scalar, &functions));
  }
}
