//! Inner and cross joins inside one window.

use super::{Operation, unexpected};
use crate::ast::{Join, JoinType};
use crate::error::EvalError;
use crate::expr::Evaluator;
use crate::function::FunctionRegistry;
use crate::tuple::{JoinTuple, JoinTupleSet, StreamItem};
use std::sync::Arc;

/// Joins the per-stream tuple lists of a window.
///
/// Starting from the `FROM` stream, each join clause combines every row built so far with
/// every tuple of the joined stream and keeps the combinations that satisfy its condition.
/// `CROSS` joins keep every combination.
pub struct JoinOp {
  from: String,
  joins: Vec<Join>,
  functions: Arc<FunctionRegistry>,
}

impl JoinOp {
  /// Creates a join over `from` and the join clauses in statement order.
  pub fn new(from: impl Into<String>, joins: Vec<Join>, functions: Arc<FunctionRegistry>) -> Self {
    Self {
      from: from.into(),
      joins,
      functions,
    }
  }
}

impl Operation for JoinOp {
  fn name(&self) -> &str {
    "join"
  }

  fn apply(&self, item: &StreamItem) -> Result<Option<StreamItem>, EvalError> {
    let StreamItem::Window(set) = item else {
      return Err(unexpected("join", item));
    };
    let ev = Evaluator::new(&self.functions);
    let mut rows: Vec<JoinTuple> = set
      .tuples_of(&self.from)
      .iter()
      .map(|t| JoinTuple {
        tuples: vec![t.clone()],
      })
      .collect();

    for join in &self.joins {
      let right = set.tuples_of(&join.stream);
      let mut next = Vec::with_capacity(rows.len() * right.len().max(1));
      for row in &rows {
        for t in right {
          let mut candidate = row.clone();
          candidate.tuples.push(t.clone());
          let keep = match (&join.join_type, &join.condition) {
            (JoinType::Cross, _) | (_, None) => true,
            (_, Some(cond)) => ev.eval_condition(cond, &candidate)?,
          };
          if keep {
            next.push(candidate);
          }
        }
      }
      rows = next;
    }

    Ok(Some(StreamItem::Join(JoinTupleSet {
      content: rows,
      range: set.range,
    })))
  }
}
