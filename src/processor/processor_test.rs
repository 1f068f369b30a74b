//! Tests for the stream and rule processors and the rule registry.

use crate::ast::{
  BinaryOp, Expr, Field, FieldType, PreparedStatements, SelectStatement, StreamDefinition,
  StreamField, StreamOptions,
};
use crate::config::EngineConfig;
use crate::error::{EngineError, SourceError};
use crate::planner::EngineContext;
use crate::processor::*;
use crate::source::{Source, SourceContext, SourceProps, SourceRegistry, SourceTuple};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

fn memory_stream(name: &str, data: serde_json::Value) -> StreamDefinition {
  let mut options = StreamOptions {
    datasource: name.to_string(),
    source_type: "memory".to_string(),
    ..StreamOptions::default()
  };
  options.props.insert("data".to_string(), data);
  StreamDefinition::new(name, vec![], options)
}

fn select_all(source: &str) -> SelectStatement {
  SelectStatement {
    fields: vec![Field::new(Expr::wildcard())],
    source: source.to_string(),
    ..SelectStatement::default()
  }
}

fn parser() -> Arc<PreparedStatements> {
  let parser = PreparedStatements::new();
  parser.prepare("SELECT * FROM demo", select_all("demo"));
  parser.prepare("SELECT * FROM broken", select_all("broken"));
  parser.prepare(
    "SELECT * FROM demo WHERE count > 1",
    SelectStatement {
      condition: Some(Expr::binary(BinaryOp::Gt, Expr::field("count"), Expr::lit(1i64))),
      ..select_all("demo")
    },
  );
  Arc::new(parser)
}

/// Reports a connection error as soon as it is opened.
struct RefusingSource;

#[async_trait]
impl Source for RefusingSource {
  fn configure(&mut self, _datasource: &str, _props: &SourceProps) -> Result<(), SourceError> {
    Ok(())
  }

  async fn open(
    &self,
    ctx: SourceContext,
    _consumer: mpsc::Sender<SourceTuple>,
    errors: mpsc::Sender<SourceError>,
  ) {
    let _ = errors
      .send(SourceError::Connection("connection refused".to_string()))
      .await;
    ctx.cancel.cancelled().await;
  }

  async fn close(&self) -> Result<(), SourceError> {
    Ok(())
  }
}

fn registry(dir: &TempDir) -> RuleRegistry {
  let mut sources = SourceRegistry::with_builtins();
  sources.register("refusing", || Box::new(RefusingSource));
  let ctx = EngineContext::new(EngineConfig::default().with_data_dir(dir.path()), parser())
    .with_sources(sources);
  let registry = RuleRegistry::open(ctx).unwrap();
  let data = json!([{ "count": 0 }, { "count": 1 }, { "count": 2 }, { "count": 3 }]);
  registry
    .streams()
    .create_stream(memory_stream("demo", data))
    .unwrap();
  let broken = StreamDefinition::new(
    "broken",
    vec![],
    StreamOptions {
      datasource: "nowhere".to_string(),
      source_type: "refusing".to_string(),
      ..StreamOptions::default()
    },
  );
  registry.streams().create_stream(broken).unwrap();
  registry
}

async fn wait_until_stopped(registry: &RuleRegistry, id: &str) -> RuleStatus {
  tokio::time::timeout(Duration::from_secs(5), async {
    loop {
      let status = registry.rule_status(id).await.unwrap();
      if status != RuleStatus::Running {
        return status;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
  })
  .await
  .expect("rule did not stop")
}

// ============================================================================
// Streams
// ============================================================================

#[test]
fn test_stream_lifecycle() {
  let dir = TempDir::new().unwrap();
  let streams = StreamProcessor::open(dir.path()).unwrap();
  assert_eq!(
    streams.show_streams().unwrap(),
    vec!["No stream definitions are found."]
  );

  let mut def = memory_stream("demo", json!([]));
  def.fields = vec![
    StreamField::new("count", FieldType::Bigint),
    StreamField::new("tags", FieldType::Array(Box::new(FieldType::String))),
  ];
  assert_eq!(streams.create_stream(def.clone()).unwrap(), "Stream demo is created.");
  assert!(streams.create_stream(def.clone()).is_err());
  assert_eq!(streams.get_stream("demo").unwrap(), def);
  assert_eq!(streams.show_streams().unwrap(), vec!["demo"]);

  let described = streams.describe_stream("demo").unwrap();
  assert!(described.starts_with("Fields\n"));
  assert!(described.contains("count\tbigint\n"));
  assert!(described.contains("tags\tarray(string)\n"));
  assert!(described.contains("TYPE: memory\n"));

  assert_eq!(streams.drop_stream("demo").unwrap(), "Stream demo is dropped.");
  assert_eq!(
    streams.describe_stream("demo").unwrap_err().to_string(),
    "Stream demo is not found."
  );
  assert!(matches!(
    streams.drop_stream("demo"),
    Err(EngineError::NotFound { kind: "Stream", .. })
  ));
}

#[test]
fn test_stream_requires_name_and_type() {
  let dir = TempDir::new().unwrap();
  let streams = StreamProcessor::open(dir.path()).unwrap();
  let unnamed = memory_stream("", json!([]));
  assert_eq!(
    streams.create_stream(unnamed).unwrap_err().to_string(),
    "Missing stream name."
  );
  let untyped = StreamDefinition::new("s", vec![], StreamOptions::default());
  assert!(streams.create_stream(untyped).is_err());
}

// ============================================================================
// Rules
// ============================================================================

#[test]
fn test_rule_validation_messages() {
  let dir = TempDir::new().unwrap();
  let rules = RuleProcessor::open(dir.path()).unwrap();
  let err = |id: &str, json: &str| rules.create_rule(id, json).unwrap_err().to_string();

  assert_eq!(
    err("", r#"{"sql": "SELECT * FROM demo", "actions": [{"log": {}}]}"#),
    "Missing rule id."
  );
  assert_eq!(err("r1", r#"{"actions": [{"log": {}}]}"#), "Missing rule SQL.");
  assert_eq!(err("r1", r#"{"sql": "SELECT * FROM demo"}"#), "Missing rule actions.");
  assert_eq!(
    err("r1", r#"{"sql": "SELECT * FROM demo", "actions": []}"#),
    "Missing rule actions."
  );
  assert!(err("r1", "not json").starts_with("Parse rule not json error"));
}

#[test]
fn test_rule_lifecycle() {
  let dir = TempDir::new().unwrap();
  let rules = RuleProcessor::open(dir.path()).unwrap();
  assert_eq!(rules.show_rules().unwrap(), vec!["No rule definitions are found."]);

  let json = r#"{"id": "ignored", "sql": "SELECT * FROM demo", "actions": [{"log": {}}], "options": {"bufferLength": 8}}"#;
  let rule = rules.create_rule("r1", json).unwrap();
  assert_eq!(rule.id, "r1");
  assert_eq!(rule.action_list()[0].0, "log");
  assert!(rules.create_rule("r1", json).is_err());

  let loaded = rules.get_rule("r1").unwrap();
  assert_eq!(loaded, rule);
  assert_eq!(loaded.options.get("bufferLength"), Some(&json!(8)));

  let described = rules.describe_rule("r1").unwrap();
  assert!(described.contains("\n  \"sql\": \"SELECT * FROM demo\""));
  assert!(described.ends_with("}\n"));

  assert_eq!(rules.show_rules().unwrap(), vec!["r1"]);
  assert_eq!(rules.drop_rule("r1").unwrap(), "Rule r1 is dropped.");
  assert_eq!(
    rules.get_rule("r1").unwrap_err().to_string(),
    "Rule r1 is not found."
  );
  assert!(rules.drop_rule("r1").is_err());
}

// ============================================================================
// Registry
// ============================================================================

#[tokio::test]
async fn test_start_runs_rule_to_completion() {
  let dir = TempDir::new().unwrap();
  let registry = registry(&dir);
  registry
    .rules()
    .create_rule(
      "r1",
      r#"{"sql": "SELECT * FROM demo WHERE count > 1", "actions": [{"memory": {"topic": "r1"}}]}"#,
    )
    .unwrap();

  assert_eq!(registry.start_rule("r1").await.unwrap(), "Rule r1 was started.");
  let collector = registry.context().sinks.memory_hub().collector("r1");
  collector.wait_for(2).await;
  assert_eq!(wait_until_stopped(&registry, "r1").await, RuleStatus::Stopped);

  let counts: Vec<i64> = collector
    .records()
    .iter()
    .map(|m| m.get("count").and_then(|v| v.as_i64()).unwrap())
    .collect();
  assert_eq!(counts, vec![2, 3]);
  assert_eq!(registry.stop_rule("r1").await.unwrap(), "Rule r1 was stopped.");
  assert_eq!(registry.rule_status("r1").await.unwrap(), RuleStatus::Stopped);
}

#[tokio::test]
async fn test_start_stop_and_status_errors() {
  let dir = TempDir::new().unwrap();
  let registry = registry(&dir);
  assert_eq!(
    registry.start_rule("nope").await.unwrap_err().to_string(),
    "Rule nope is not found."
  );
  assert!(registry.rule_status("nope").await.is_err());
  assert_eq!(
    registry.stop_rule("nope").await.unwrap_err().to_string(),
    "Rule nope is not running."
  );
}

#[tokio::test]
async fn test_failed_rule_reports_first_error() {
  let dir = TempDir::new().unwrap();
  let registry = registry(&dir);
  registry
    .rules()
    .create_rule(
      "bad",
      r#"{"sql": "SELECT * FROM broken", "actions": [{"log": {}}]}"#,
    )
    .unwrap();
  registry.start_rule("bad").await.unwrap();

  let status = wait_until_stopped(&registry, "bad").await;
  assert_eq!(
    status,
    RuleStatus::Failed("source connection error: connection refused".to_string())
  );
  assert_eq!(
    status.to_string(),
    "Stopped: source connection error: connection refused"
  );

  // A stopped rule can be started again.
  registry.start_rule("bad").await.unwrap();
  assert_eq!(registry.drop_rule("bad").await.unwrap(), "Rule bad is dropped.");
  assert!(registry.rule_status("bad").await.is_err());
}

#[tokio::test]
async fn test_exec_query_collects_into_memory() {
  let dir = TempDir::new().unwrap();
  let registry = registry(&dir);
  let query = registry
    .exec_query("q1", "SELECT * FROM demo")
    .await
    .unwrap();
  query.results().wait_for(4).await;
  assert_eq!(query.results().len(), 4);
  assert_eq!(
    query.topology().node_names(),
    vec!["demo", "preprocessor_demo", "project", "memory_0"]
  );
  query.stop().await.unwrap();
  assert!(registry.rules().show_rules().unwrap()[0].starts_with("No rule"));
}
