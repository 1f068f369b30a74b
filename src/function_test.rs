//! Tests for built-in and user registered functions.

use crate::error::EvalError;
use crate::function::*;
use crate::value::Value;

#[test]
fn test_scalar_builtins() {
  let f = FunctionRegistry::default();
  assert_eq!(f.call_scalar("ABS", &[Value::Int(-3)]).unwrap(), Value::Int(3));
  assert_eq!(f.call_scalar("round", &[Value::Float(2.5)]).unwrap(), Value::Float(3.0));
  assert_eq!(f.call_scalar("floor", &[Value::Float(2.7)]).unwrap(), Value::Float(2.0));
  assert_eq!(f.call_scalar("ceil", &[Value::Int(2)]).unwrap(), Value::Int(2));
  assert_eq!(f.call_scalar("upper", &[Value::from("ab")]).unwrap(), Value::from("AB"));
  assert_eq!(f.call_scalar("length", &[Value::from("héllo")]).unwrap(), Value::Int(5));
  assert_eq!(
    f.call_scalar("concat", &[Value::from("a"), Value::Int(1), Value::Null]).unwrap(),
    Value::from("a1")
  );
  assert_eq!(f.call_scalar("lower", &[Value::Null]).unwrap(), Value::Null);
}

#[test]
fn test_scalar_errors() {
  let f = FunctionRegistry::default();
  assert!(f.call_scalar("abs", &[Value::from("x")]).is_err());
  assert!(f.call_scalar("abs", &[]).is_err());
  assert_eq!(
    f.call_scalar("nope", &[]).unwrap_err().message,
    "unknown function nope"
  );
  assert!(f.call_scalar("count", &[]).is_err());
}

#[test]
fn test_aggregate_builtins() {
  let f = FunctionRegistry::default();
  let col = vec![vec![Value::Int(3), Value::Null, Value::Int(1), Value::Float(2.0)]];
  assert_eq!(f.call_aggregate("count", &col).unwrap(), Value::Int(3));
  assert_eq!(f.call_aggregate("sum", &col).unwrap(), Value::Float(6.0));
  assert_eq!(f.call_aggregate("avg", &col).unwrap(), Value::Float(2.0));
  assert_eq!(f.call_aggregate("min", &col).unwrap(), Value::Int(1));
  assert_eq!(f.call_aggregate("max", &col).unwrap(), Value::Int(3));
  assert_eq!(
    f.call_aggregate("collect", &[vec![Value::Int(1), Value::Int(2)]]).unwrap(),
    Value::Array(vec![Value::Int(1), Value::Int(2)])
  );
  assert_eq!(f.call_aggregate("sum", &[vec![]]).unwrap(), Value::Null);
  assert_eq!(
    f.call_aggregate("sum", &[vec![Value::Int(1), Value::Int(2)]]).unwrap(),
    Value::Int(3)
  );
}

#[test]
fn test_register_user_function() {
  let mut f = FunctionRegistry::empty();
  assert!(!f.contains("double"));
  f.register_scalar("Double", |args| match args {
    [Value::Int(i)] => Ok(Value::Int(i * 2)),
    _ => Err(EvalError::new("double expects one bigint")),
  });
  f.register_aggregate("last", |cols| {
    Ok(cols.first().and_then(|c| c.last()).cloned().unwrap_or_default())
  });
  assert_eq!(f.call_scalar("double", &[Value::Int(4)]).unwrap(), Value::Int(8));
  assert!(f.is_aggregate("LAST"));
  assert_eq!(
    f.call_aggregate("last", &[vec![Value::Int(1), Value::Int(9)]]).unwrap(),
    Value::Int(9)
  );
}
