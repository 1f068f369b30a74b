//! `HAVING` filtering over groups.

use super::{Operation, unexpected};
use crate::ast::Expr;
use crate::error::EvalError;
use crate::expr::Evaluator;
use crate::function::FunctionRegistry;
use crate::tuple::{GroupedTuplesSet, StreamItem};
use std::sync::Arc;

/// Keeps the groups whose condition, evaluated with aggregates over the group, holds.
pub struct HavingOp {
  condition: Expr,
  functions: Arc<FunctionRegistry>,
}

impl HavingOp {
  /// Creates a having filter.
  pub fn new(condition: Expr, functions: Arc<FunctionRegistry>) -> Self {
    Self {
      condition,
      functions,
    }
  }
}

impl Operation for HavingOp {
  fn name(&self) -> &str {
    "having"
  }

  fn apply(&self, item: &StreamItem) -> Result<Option<StreamItem>, EvalError> {
    let StreamItem::Grouped(set) = item else {
      return Err(unexpected("having", item));
    };
    let ev = Evaluator::new(&self.functions);
    let mut groups = Vec::with_capacity(set.groups.len());
    for g in &set.groups {
      if ev.eval_group_condition(&self.condition, &g.rows)? {
        groups.push(g.clone());
      }
    }
    if groups.is_empty() {
      return Ok(None);
    }
    Ok(Some(StreamItem::Grouped(GroupedTuplesSet { groups })))
  }
}
