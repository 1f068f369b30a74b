//! Tests for the expression evaluator.

use crate::ast::{BinaryOp, Expr};
use crate::expr::*;
use crate::function::FunctionRegistry;
use crate::message;
use crate::tuple::{JoinTuple, Row, Tuple};
use crate::value::Value;
use std::sync::Arc;

fn tuple(emitter: &str, count: i64) -> Arc<Tuple> {
  Arc::new(Tuple::new(
    emitter,
    message! { "count" => count, "name" => format!("dev{}", count) },
    0,
  ))
}

// ============================================================================
// Scalar evaluation
// ============================================================================

#[test]
fn test_comparison_and_arithmetic() {
  let f = FunctionRegistry::default();
  let ev = Evaluator::new(&f);
  let t = tuple("demo", 50);

  let gt = Expr::binary(BinaryOp::Gt, Expr::field("count"), Expr::lit(49i64));
  assert!(ev.eval_condition(&gt, &*t).unwrap());

  let sum = Expr::binary(BinaryOp::Add, Expr::field("count"), Expr::lit(0.5));
  assert_eq!(ev.eval(&sum, &*t).unwrap(), Value::Float(50.5));

  let div = Expr::binary(BinaryOp::Div, Expr::field("count"), Expr::lit(0i64));
  assert_eq!(ev.eval(&div, &*t).unwrap_err().message, "divided by zero");
}

#[test]
fn test_null_semantics() {
  let f = FunctionRegistry::default();
  let ev = Evaluator::new(&f);
  let t = tuple("demo", 1);

  let cmp = Expr::binary(BinaryOp::Eq, Expr::field("missing"), Expr::lit(1i64));
  assert_eq!(ev.eval(&cmp, &*t).unwrap(), Value::Bool(false));

  let add = Expr::binary(BinaryOp::Add, Expr::field("missing"), Expr::lit(1i64));
  assert_eq!(ev.eval(&add, &*t).unwrap(), Value::Null);

  // A null condition does not match.
  assert!(!ev.eval_condition(&Expr::field("missing"), &*t).unwrap());
}

#[test]
fn test_invalid_operation_is_error() {
  let f = FunctionRegistry::default();
  let ev = Evaluator::new(&f);
  let t = tuple("demo", 1);
  let bad = Expr::binary(BinaryOp::Gt, Expr::field("name"), Expr::field("count"));
  let err = ev.eval(&bad, &*t).unwrap_err();
  assert_eq!(err.message, "invalid operation string > bigint");

  let non_bool = ev.eval_condition(&Expr::field("count"), &*t).unwrap_err();
  assert!(non_bool.message.contains("non-bool"));
}

#[test]
fn test_qualified_fields_on_join_rows() {
  let f = FunctionRegistry::default();
  let ev = Evaluator::new(&f);
  let row = JoinTuple {
    tuples: vec![tuple("left", 1), tuple("right", 2)],
  };
  assert_eq!(
    ev.eval(&Expr::qualified("right", "count"), &row).unwrap(),
    Value::Int(2)
  );
  // Unqualified references resolve against the first stream that has the field.
  assert_eq!(ev.eval(&Expr::field("count"), &row).unwrap(), Value::Int(1));
  let all = ev
    .eval(&Expr::Wildcard { stream: Some("right".into()) }, &row)
    .unwrap();
  assert_eq!(all, Value::Map(message! { "count" => 2i64, "name" => "dev2" }));
}

#[test]
fn test_row_resolves_fields_through_valuer() {
  let t = tuple("demo", 7);
  assert_eq!(t.field("count"), Some(&Value::Int(7)));

  let row = Row::Tuple(Arc::clone(&t));
  assert_eq!(row.value(Some("demo"), "count"), Some(Value::Int(7)));
  assert_eq!(row.value(None, "name"), Some(Value::from("dev7")));
  assert_eq!(row.value(Some("other"), "count"), None);

  let joined = Row::Join(JoinTuple {
    tuples: vec![t, tuple("right", 9)],
  });
  assert_eq!(joined.value(Some("right"), "count"), Some(Value::Int(9)));
  assert_eq!(joined.value(None, "count"), Some(Value::Int(7)));
}

#[test]
fn test_meta_function() {
  let f = FunctionRegistry::default();
  let ev = Evaluator::new(&f);
  let t = Tuple::new("demo", message! { "a" => 1i64 }, 0)
    .with_metadata(message! { "topic" => "sensors/1" });
  let e = Expr::call("meta", vec![Expr::field("topic")]);
  assert_eq!(ev.eval(&e, &t).unwrap(), Value::from("sensors/1"));
}

// ============================================================================
// Group evaluation
// ============================================================================

#[test]
fn test_aggregates_over_group() {
  let f = FunctionRegistry::default();
  let ev = Evaluator::new(&f);
  let rows: Vec<Row> = (1..=4).map(|i| Row::Tuple(tuple("demo", i))).collect();

  let count = Expr::call("count", vec![Expr::wildcard()]);
  assert_eq!(ev.eval_group(&count, &rows).unwrap(), Value::Int(4));

  let avg = Expr::call("avg", vec![Expr::field("count")]);
  assert_eq!(ev.eval_group(&avg, &rows).unwrap(), Value::Float(2.5));

  // Plain fields resolve against the first row of the group.
  assert_eq!(ev.eval_group(&Expr::field("count"), &rows).unwrap(), Value::Int(1));

  let having = Expr::binary(
    BinaryOp::Gt,
    Expr::call("sum", vec![Expr::field("count")]),
    Expr::lit(9i64),
  );
  assert!(ev.eval_group_condition(&having, &rows).unwrap());
}

#[test]
fn test_aggregate_outside_group_is_error() {
  let f = FunctionRegistry::default();
  let ev = Evaluator::new(&f);
  let t = tuple("demo", 1);
  let e = Expr::call("max", vec![Expr::field("count")]);
  assert!(ev.eval(&e, &*t).is_err());
  assert!(ev.is_aggregate(&Expr::binary(BinaryOp::Add, e, Expr::lit(1i64))));
  assert!(!ev.is_aggregate(&Expr::call("abs", vec![Expr::field("count")])));
}
