//! `GROUP BY` partitioning.

use super::{Operation, rows_of, unexpected};
use crate::ast::Expr;
use crate::error::EvalError;
use crate::expr::{Evaluator, Valuer};
use crate::function::FunctionRegistry;
use crate::tuple::{GroupedTuples, GroupedTuplesSet, StreamItem};
use std::collections::HashMap;
use std::sync::Arc;

/// Delimiter written after each dimension value of a grouping key.
pub const KEY_DELIMITER: char = ',';

/// Builds the grouping key of a row: each dimension's key string followed by
/// [`KEY_DELIMITER`], in declared order.
pub fn grouping_key(
  ev: &Evaluator<'_>,
  dimensions: &[Expr],
  row: &dyn Valuer,
) -> Result<String, EvalError> {
  let mut key = String::new();
  for dim in dimensions {
    key.push_str(&ev.eval(dim, row)?.key_string());
    key.push(KEY_DELIMITER);
  }
  Ok(key)
}

/// Partitions rows into groups.
///
/// Without dimensions every row lands in one implicit group. Groups are emitted in order
/// of first appearance; rows keep their arrival order.
pub struct AggregateOp {
  dimensions: Vec<Expr>,
  functions: Arc<FunctionRegistry>,
}

impl AggregateOp {
  /// Creates an aggregate over the given dimensions.
  pub fn new(dimensions: Vec<Expr>, functions: Arc<FunctionRegistry>) -> Self {
    Self {
      dimensions,
      functions,
    }
  }
}

impl Operation for AggregateOp {
  fn name(&self) -> &str {
    "aggregate"
  }

  fn apply(&self, item: &StreamItem) -> Result<Option<StreamItem>, EvalError> {
    let range = match item {
      StreamItem::Window(set) => {
        if set.content.len() > 1 {
          return Err(EvalError::new(
            "the input WindowTuplesSet with multiple tuples cannot be evaluated",
          ));
        }
        set.range
      }
      StreamItem::Join(set) => set.range,
      StreamItem::Tuple(_) => None,
      _ => return Err(unexpected("aggregate", item)),
    };
    let rows = rows_of(item).unwrap_or_default();
    if rows.is_empty() {
      return Ok(None);
    }

    let ev = Evaluator::new(&self.functions);
    let mut groups: Vec<GroupedTuples> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for row in rows {
      let key = grouping_key(&ev, &self.dimensions, &row)?;
      match index.get(&key) {
        Some(&i) => groups[i].rows.push(row),
        None => {
          index.insert(key.clone(), groups.len());
          groups.push(GroupedTuples {
            key,
            rows: vec![row],
            range,
          });
        }
      }
    }
    Ok(Some(StreamItem::Grouped(GroupedTuplesSet { groups })))
  }
}

