//! Function registry.
//!
//! Functions are looked up by case-insensitive name. Scalar functions receive the
//! evaluated arguments of one row; aggregate functions receive one column of values per
//! argument, each column holding the argument evaluated for every row of the group.

use crate::error::EvalError;
use crate::value::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

/// A scalar function.
pub type ScalarFn = Arc<dyn Fn(&[Value]) -> Result<Value, EvalError> + Send + Sync>;

/// An aggregate function over argument columns.
pub type AggregateFn = Arc<dyn Fn(&[Vec<Value>]) -> Result<Value, EvalError> + Send + Sync>;

#[derive(Clone)]
enum Function {
  Scalar(ScalarFn),
  Aggregate(AggregateFn),
}

/// Registry of callable functions.
#[derive(Clone)]
pub struct FunctionRegistry {
  functions: HashMap<String, Function>,
}

impl Default for FunctionRegistry {
  fn default() -> Self {
    Self::with_builtins()
  }
}

impl FunctionRegistry {
  /// Creates a registry with no functions.
  pub fn empty() -> Self {
    Self {
      functions: HashMap::new(),
    }
  }

  /// Creates a registry holding the built-in scalar and aggregate functions.
  pub fn with_builtins() -> Self {
    let mut r = Self::empty();
    r.register_scalar("abs", |args| {
      numeric_unary("abs", args, |i| i.checked_abs(), f64::abs)
    });
    r.register_scalar("round", |args| {
      numeric_unary("round", args, Some, f64::round)
    });
    r.register_scalar("floor", |args| {
      numeric_unary("floor", args, Some, f64::floor)
    });
    r.register_scalar("ceil", |args| numeric_unary("ceil", args, Some, f64::ceil));
    r.register_scalar("upper", |args| string_unary("upper", args, |s| s.to_uppercase()));
    r.register_scalar("lower", |args| string_unary("lower", args, |s| s.to_lowercase()));
    r.register_scalar("length", |args| {
      arity("length", args, 1)?;
      match &args[0] {
        Value::Null => Ok(Value::Null),
        Value::String(s) => Ok(Value::Int(s.chars().count() as i64)),
        Value::Array(a) => Ok(Value::Int(a.len() as i64)),
        Value::Map(m) => Ok(Value::Int(m.len() as i64)),
        Value::Bytes(b) => Ok(Value::Int(b.len() as i64)),
        other => Err(type_error("length", "string", other)),
      }
    });
    r.register_scalar("concat", |args| {
      let joined: String = args
        .iter()
        .filter(|v| !v.is_null())
        .map(|v| v.to_string())
        .collect();
      Ok(Value::String(joined))
    });

    r.register_aggregate("count", |cols| {
      Ok(Value::Int(
        first_column("count", cols)?
          .iter()
          .filter(|v| !v.is_null())
          .count() as i64,
      ))
    });
    r.register_aggregate("sum", |cols| sum("sum", first_column("sum", cols)?));
    r.register_aggregate("avg", |cols| {
      let values = first_column("avg", cols)?;
      let n = values.iter().filter(|v| !v.is_null()).count();
      if n == 0 {
        return Ok(Value::Null);
      }
      let total = sum("avg", values)?.as_f64().unwrap_or_default();
      Ok(Value::Float(total / n as f64))
    });
    r.register_aggregate("min", |cols| {
      extreme("min", first_column("min", cols)?, Ordering::Less)
    });
    r.register_aggregate("max", |cols| {
      extreme("max", first_column("max", cols)?, Ordering::Greater)
    });
    r.register_aggregate("collect", |cols| {
      Ok(Value::Array(first_column("collect", cols)?.to_vec()))
    });
    r
  }

  /// Registers (or replaces) a scalar function.
  pub fn register_scalar<F>(&mut self, name: &str, f: F)
  where
    F: Fn(&[Value]) -> Result<Value, EvalError> + Send + Sync + 'static,
  {
    self
      .functions
      .insert(name.to_lowercase(), Function::Scalar(Arc::new(f)));
  }

  /// Registers (or replaces) an aggregate function.
  pub fn register_aggregate<F>(&mut self, name: &str, f: F)
  where
    F: Fn(&[Vec<Value>]) -> Result<Value, EvalError> + Send + Sync + 'static,
  {
    self
      .functions
      .insert(name.to_lowercase(), Function::Aggregate(Arc::new(f)));
  }

  /// Returns true if `name` is a registered aggregate function.
  pub fn is_aggregate(&self, name: &str) -> bool {
    matches!(
      self.functions.get(&name.to_lowercase()),
      Some(Function::Aggregate(_))
    )
  }

  /// Returns true if `name` is registered.
  pub fn contains(&self, name: &str) -> bool {
    self.functions.contains_key(&name.to_lowercase())
  }

  /// Calls a scalar function.
  pub fn call_scalar(&self, name: &str, args: &[Value]) -> Result<Value, EvalError> {
    match self.functions.get(&name.to_lowercase()) {
      Some(Function::Scalar(f)) => f(args),
      Some(Function::Aggregate(_)) => Err(EvalError::new(format!(
        "{} is an aggregate function",
        name
      ))),
      None => Err(EvalError::new(format!("unknown function {}", name))),
    }
  }

  /// Calls an aggregate function over argument columns.
  pub fn call_aggregate(&self, name: &str, columns: &[Vec<Value>]) -> Result<Value, EvalError> {
    match self.functions.get(&name.to_lowercase()) {
      Some(Function::Aggregate(f)) => f(columns),
      Some(Function::Scalar(_)) => Err(EvalError::new(format!(
        "{} is not an aggregate function",
        name
      ))),
      None => Err(EvalError::new(format!("unknown function {}", name))),
    }
  }
}

fn arity(name: &str, args: &[Value], n: usize) -> Result<(), EvalError> {
  if args.len() != n {
    return Err(EvalError::new(format!(
      "{} function expects {} arguments but got {}",
      name,
      n,
      args.len()
    )));
  }
  Ok(())
}

fn type_error(name: &str, expected: &str, got: &Value) -> EvalError {
  EvalError::new(format!(
    "{} function expects {} but got {}",
    name,
    expected,
    got.type_name()
  ))
}

fn numeric_unary(
  name: &str,
  args: &[Value],
  int_op: impl Fn(i64) -> Option<i64>,
  float_op: impl Fn(f64) -> f64,
) -> Result<Value, EvalError> {
  arity(name, args, 1)?;
  match &args[0] {
    Value::Null => Ok(Value::Null),
    Value::Int(i) => int_op(*i)
      .map(Value::Int)
      .ok_or_else(|| EvalError::new(format!("{} function overflow on {}", name, i))),
    Value::Float(f) => Ok(Value::Float(float_op(*f))),
    other => Err(type_error(name, "number", other)),
  }
}

fn string_unary(
  name: &str,
  args: &[Value],
  op: impl Fn(&str) -> String,
) -> Result<Value, EvalError> {
  arity(name, args, 1)?;
  match &args[0] {
    Value::Null => Ok(Value::Null),
    Value::String(s) => Ok(Value::String(op(s))),
    other => Err(type_error(name, "string", other)),
  }
}

fn first_column<'c>(name: &str, cols: &'c [Vec<Value>]) -> Result<&'c [Value], EvalError> {
  cols
    .first()
    .map(Vec::as_slice)
    .ok_or_else(|| EvalError::new(format!("{} function expects 1 arguments but got 0", name)))
}

fn sum(name: &str, values: &[Value]) -> Result<Value, EvalError> {
  let mut int_total: i64 = 0;
  let mut float_total: f64 = 0.0;
  let mut is_float = false;
  let mut seen = false;
  for v in values {
    match v {
      Value::Null => continue,
      Value::Int(i) if !is_float => match int_total.checked_add(*i) {
        Some(t) => int_total = t,
        None => {
          is_float = true;
          float_total = int_total as f64 + *i as f64;
        }
      },
      Value::Int(i) => float_total += *i as f64,
      Value::Float(f) => {
        if !is_float {
          is_float = true;
          float_total = int_total as f64;
        }
        float_total += f;
      }
      other => return Err(type_error(name, "number", other)),
    }
    seen = true;
  }
  Ok(match (seen, is_float) {
    (false, _) => Value::Null,
    (true, true) => Value::Float(float_total),
    (true, false) => Value::Int(int_total),
  })
}

fn extreme(name: &str, values: &[Value], want: Ordering) -> Result<Value, EvalError> {
  let mut best: Option<&Value> = None;
  for v in values.iter().filter(|v| !v.is_null()) {
    best = match best {
      None => Some(v),
      Some(b) => match v.compare(b) {
        Some(ord) if ord == want => Some(v),
        Some(_) => Some(b),
        None => {
          return Err(EvalError::new(format!(
            "{} function cannot compare {} with {}",
            name,
            v.type_name(),
            b.type_name()
          )));
        }
      },
    };
  }
  Ok(best.cloned().unwrap_or_default())
}
