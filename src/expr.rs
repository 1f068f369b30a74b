//! Expression evaluation over tuples, joined rows and groups.
//!
//! Rows expose their fields through the [`Valuer`] trait; the [`Evaluator`] walks an
//! [`Expr`] against a valuer and, for aggregate calls, against the rows of a group.
//!
//! Null semantics:
//! - comparisons with a null operand are `false`;
//! - arithmetic with a null operand is null;
//! - a null condition does not match.

use crate::ast::{BinaryOp, Expr};
use crate::error::EvalError;
use crate::function::FunctionRegistry;
use crate::tuple::{JoinTuple, Row, Tuple};
use crate::value::{Message, Value};
use std::cmp::Ordering;

/// Field access for something an expression can be evaluated against.
pub trait Valuer {
  /// Resolves a field, optionally qualified by stream name.
  fn value(&self, stream: Option<&str>, key: &str) -> Option<Value>;

  /// Resolves a metadata key.
  fn meta(&self, stream: Option<&str>, key: &str) -> Option<Value>;

  /// All fields, for `*` and `stream.*`.
  fn all(&self, stream: Option<&str>) -> Message;
}

fn same_stream(stream: Option<&str>, emitter: &str) -> bool {
  stream.is_none_or(|s| s.eq_ignore_ascii_case(emitter))
}

impl Valuer for Tuple {
  fn value(&self, stream: Option<&str>, key: &str) -> Option<Value> {
    if !same_stream(stream, &self.emitter) {
      return None;
    }
    self.message.lookup(key).cloned()
  }

  fn meta(&self, stream: Option<&str>, key: &str) -> Option<Value> {
    if !same_stream(stream, &self.emitter) {
      return None;
    }
    self.metadata.lookup(key).cloned()
  }

  fn all(&self, stream: Option<&str>) -> Message {
    if same_stream(stream, &self.emitter) {
      self.message.clone()
    } else {
      Message::new()
    }
  }
}

impl Valuer for JoinTuple {
  fn value(&self, stream: Option<&str>, key: &str) -> Option<Value> {
    match stream {
      Some(s) => self.tuple_of(s).and_then(|t| t.value(None, key)),
      None => self.tuples.iter().find_map(|t| t.value(None, key)),
    }
  }

  fn meta(&self, stream: Option<&str>, key: &str) -> Option<Value> {
    match stream {
      Some(s) => self.tuple_of(s).and_then(|t| t.meta(None, key)),
      None => self.tuples.iter().find_map(|t| t.meta(None, key)),
    }
  }

  fn all(&self, stream: Option<&str>) -> Message {
    match stream {
      Some(s) => self.tuple_of(s).map(|t| t.message.clone()).unwrap_or_default(),
      None => {
        // The first stream wins on duplicate field names.
        let mut merged = Message::new();
        for t in self.tuples.iter().rev() {
          for (k, v) in t.message.iter() {
            merged.insert(k.clone(), v.clone());
          }
        }
        merged
      }
    }
  }
}

impl Valuer for Row {
  fn value(&self, stream: Option<&str>, key: &str) -> Option<Value> {
    match self {
      Row::Tuple(t) => t.value(stream, key),
      Row::Join(j) => j.value(stream, key),
    }
  }

  fn meta(&self, stream: Option<&str>, key: &str) -> Option<Value> {
    match self {
      Row::Tuple(t) => t.meta(stream, key),
      Row::Join(j) => j.meta(stream, key),
    }
  }

  fn all(&self, stream: Option<&str>) -> Message {
    match self {
      Row::Tuple(t) => t.all(stream),
      Row::Join(j) => j.all(stream),
    }
  }
}

struct EmptyRow;

impl Valuer for EmptyRow {
  fn value(&self, _: Option<&str>, _: &str) -> Option<Value> {
    None
  }

  fn meta(&self, _: Option<&str>, _: &str) -> Option<Value> {
    None
  }

  fn all(&self, _: Option<&str>) -> Message {
    Message::new()
  }
}

/// Evaluates expressions using a function registry.
#[derive(Clone, Copy)]
pub struct Evaluator<'a> {
  functions: &'a FunctionRegistry,
}

impl<'a> Evaluator<'a> {
  /// Creates an evaluator.
  pub fn new(functions: &'a FunctionRegistry) -> Self {
    Self { functions }
  }

  /// Evaluates a scalar expression against one row.
  ///
  /// Aggregate calls are rejected outside a group.
  pub fn eval(&self, expr: &Expr, row: &dyn Valuer) -> Result<Value, EvalError> {
    self.eval_in(expr, row, None)
  }

  /// Evaluates an expression in the context of a group.
  ///
  /// Aggregate calls run over every row of the group; plain field references resolve
  /// against the first row.
  pub fn eval_group(&self, expr: &Expr, rows: &[Row]) -> Result<Value, EvalError> {
    match rows.first() {
      Some(first) => self.eval_in(expr, first, Some(rows)),
      None => self.eval_in(expr, &EmptyRow, Some(rows)),
    }
  }

  /// Evaluates a condition against one row. Null means "no match".
  pub fn eval_condition(&self, expr: &Expr, row: &dyn Valuer) -> Result<bool, EvalError> {
    as_condition(self.eval(expr, row)?)
  }

  /// Evaluates a condition in the context of a group.
  pub fn eval_group_condition(&self, expr: &Expr, rows: &[Row]) -> Result<bool, EvalError> {
    as_condition(self.eval_group(expr, rows)?)
  }

  /// Returns true if the expression contains an aggregate call.
  pub fn is_aggregate(&self, expr: &Expr) -> bool {
    let mut found = false;
    expr.walk(&mut |e| {
      if let Expr::Call { name, .. } = e {
        found |= self.functions.is_aggregate(name);
      }
    });
    found
  }

  fn eval_in(
    &self,
    expr: &Expr,
    row: &dyn Valuer,
    group: Option<&[Row]>,
  ) -> Result<Value, EvalError> {
    match expr {
      Expr::Literal(v) => Ok(v.clone()),
      Expr::Field { stream, name } => Ok(row.value(stream.as_deref(), name).unwrap_or_default()),
      Expr::Wildcard { stream } => Ok(Value::Map(row.all(stream.as_deref()))),
      Expr::Not(inner) => match self.eval_in(inner, row, group)? {
        Value::Bool(b) => Ok(Value::Bool(!b)),
        Value::Null => Ok(Value::Null),
        other => Err(EvalError::new(format!(
          "invalid operation NOT {}",
          other.type_name()
        ))),
      },
      Expr::Binary { op, lhs, rhs } => {
        let l = self.eval_in(lhs, row, group)?;
        let r = self.eval_in(rhs, row, group)?;
        binary(*op, l, r)
      }
      Expr::Call { name, args } => self.call(name, args, row, group),
    }
  }

  fn call(
    &self,
    name: &str,
    args: &[Expr],
    row: &dyn Valuer,
    group: Option<&[Row]>,
  ) -> Result<Value, EvalError> {
    if name.eq_ignore_ascii_case("meta") {
      return match args {
        [Expr::Field { stream, name }] => {
          Ok(row.meta(stream.as_deref(), name).unwrap_or_default())
        }
        _ => Err(EvalError::new("meta function expects one field argument")),
      };
    }
    if self.functions.is_aggregate(name) {
      let rows = group.ok_or_else(|| {
        EvalError::new(format!(
          "aggregate function {} is not allowed outside an aggregate context",
          name
        ))
      })?;
      let mut columns = Vec::with_capacity(args.len());
      for arg in args {
        let mut column = Vec::with_capacity(rows.len());
        for r in rows {
          column.push(self.eval_in(arg, r, None)?);
        }
        columns.push(column);
      }
      return self.functions.call_aggregate(name, &columns);
    }
    let mut values = Vec::with_capacity(args.len());
    for arg in args {
      values.push(self.eval_in(arg, row, group)?);
    }
    self.functions.call_scalar(name, &values)
  }
}

fn as_condition(v: Value) -> Result<bool, EvalError> {
  match v {
    Value::Bool(b) => Ok(b),
    Value::Null => Ok(false),
    other => Err(EvalError::new(format!(
      "invalid condition that returns non-bool value {}",
      other
    ))),
  }
}

fn invalid(op: BinaryOp, l: &Value, r: &Value) -> EvalError {
  EvalError::new(format!(
    "invalid operation {} {} {}",
    l.type_name(),
    op.symbol(),
    r.type_name()
  ))
}

/// Applies a binary operator to two evaluated operands.
pub fn binary(op: BinaryOp, l: Value, r: Value) -> Result<Value, EvalError> {
  match op {
    BinaryOp::And | BinaryOp::Or => {
      let lb = logical(op, &l, &r, &l)?;
      let rb = logical(op, &l, &r, &r)?;
      Ok(Value::Bool(if op == BinaryOp::And {
        lb && rb
      } else {
        lb || rb
      }))
    }
    BinaryOp::Eq
    | BinaryOp::Neq
    | BinaryOp::Lt
    | BinaryOp::Lte
    | BinaryOp::Gt
    | BinaryOp::Gte => {
      if l.is_null() || r.is_null() {
        return Ok(Value::Bool(false));
      }
      let ord = l.compare(&r).ok_or_else(|| invalid(op, &l, &r))?;
      let result = match op {
        BinaryOp::Eq => ord == Ordering::Equal,
        BinaryOp::Neq => ord != Ordering::Equal,
        BinaryOp::Lt => ord == Ordering::Less,
        BinaryOp::Lte => ord != Ordering::Greater,
        BinaryOp::Gt => ord == Ordering::Greater,
        _ => ord != Ordering::Less,
      };
      Ok(Value::Bool(result))
    }
    _ => arithmetic(op, l, r),
  }
}

fn logical(op: BinaryOp, l: &Value, r: &Value, side: &Value) -> Result<bool, EvalError> {
  match side {
    Value::Bool(b) => Ok(*b),
    Value::Null => Ok(false),
    _ => Err(invalid(op, l, r)),
  }
}

fn arithmetic(op: BinaryOp, l: Value, r: Value) -> Result<Value, EvalError> {
  if l.is_null() || r.is_null() {
    return Ok(Value::Null);
  }
  match (&l, &r) {
    (Value::Int(a), Value::Int(b)) => {
      let (a, b) = (*a, *b);
      let result = match op {
        BinaryOp::Add => a.checked_add(b),
        BinaryOp::Sub => a.checked_sub(b),
        BinaryOp::Mul => a.checked_mul(b),
        BinaryOp::Div | BinaryOp::Mod if b == 0 => {
          return Err(EvalError::new("divided by zero"));
        }
        BinaryOp::Div => a.checked_div(b),
        BinaryOp::Mod => a.checked_rem(b),
        _ => return Err(invalid(op, &l, &r)),
      };
      result
        .map(Value::Int)
        .ok_or_else(|| EvalError::new(format!("integer overflow in {} {} {}", a, op.symbol(), b)))
    }
    (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
      let (a, b) = match (l.as_f64(), r.as_f64()) {
        (Some(a), Some(b)) => (a, b),
        _ => return Err(invalid(op, &l, &r)),
      };
      let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div if b == 0.0 => return Err(EvalError::new("divided by zero")),
        BinaryOp::Div => a / b,
        BinaryOp::Mod if b == 0.0 => return Err(EvalError::new("divided by zero")),
        BinaryOp::Mod => a % b,
        _ => return Err(invalid(op, &l, &r)),
      };
      Ok(Value::Float(result))
    }
    _ => Err(invalid(op, &l, &r)),
  }
}
