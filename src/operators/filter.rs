//! `WHERE` filtering.

use super::{Operation, unexpected};
use crate::ast::Expr;
use crate::error::EvalError;
use crate::expr::Evaluator;
use crate::function::FunctionRegistry;
use crate::tuple::{JoinTupleSet, StreamItem, WindowTuples, WindowTuplesSet};
use std::sync::Arc;

/// Drops tuples (or rows of a set) that do not satisfy the condition.
///
/// A set that ends up empty produces no output. If the condition fails to evaluate for
/// any tuple, the whole item becomes an error.
pub struct FilterOp {
  condition: Expr,
  functions: Arc<FunctionRegistry>,
}

impl FilterOp {
  /// Creates a filter.
  pub fn new(condition: Expr, functions: Arc<FunctionRegistry>) -> Self {
    Self {
      condition,
      functions,
    }
  }
}

impl Operation for FilterOp {
  fn name(&self) -> &str {
    "filter"
  }

  fn apply(&self, item: &StreamItem) -> Result<Option<StreamItem>, EvalError> {
    let ev = Evaluator::new(&self.functions);
    match item {
      StreamItem::Tuple(t) => {
        if ev.eval_condition(&self.condition, &**t)? {
          Ok(Some(item.clone()))
        } else {
          Ok(None)
        }
      }
      StreamItem::Window(set) => {
        let mut out = WindowTuplesSet::new(set.range);
        for w in &set.content {
          let mut kept = Vec::new();
          for t in &w.tuples {
            if ev.eval_condition(&self.condition, &**t)? {
              kept.push(t.clone());
            }
          }
          if !kept.is_empty() {
            out.content.push(WindowTuples {
              emitter: w.emitter.clone(),
              tuples: kept,
            });
          }
        }
        Ok((!out.is_empty()).then_some(StreamItem::Window(out)))
      }
      StreamItem::Join(set) => {
        let mut content = Vec::new();
        for row in &set.content {
          if ev.eval_condition(&self.condition, row)? {
            content.push(row.clone());
          }
        }
        Ok((!content.is_empty()).then_some(StreamItem::Join(JoinTupleSet {
          content,
          range: set.range,
        })))
      }
      _ => Err(unexpected("filter", item)),
    }
  }
}
