//! `ORDER BY` sorting.

use super::{Operation, unexpected};
use crate::ast::SortField;
use crate::error::EvalError;
use crate::expr::{Evaluator, Valuer};
use crate::function::FunctionRegistry;
use crate::tuple::{GroupedTuplesSet, JoinTupleSet, StreamItem, WindowTuples, WindowTuplesSet};
use crate::value::Value;
use std::cmp::Ordering;
use std::sync::Arc;

/// Stable sort by the declared fields.
///
/// Groups are sorted by values evaluated over the whole group, so aggregates can be sort
/// keys. Window sets are sorted per emitter; join sets row by row.
pub struct OrderOp {
  fields: Vec<SortField>,
  functions: Arc<FunctionRegistry>,
}

impl OrderOp {
  /// Creates an order operator.
  pub fn new(fields: Vec<SortField>, functions: Arc<FunctionRegistry>) -> Self {
    Self { fields, functions }
  }

  fn compare(&self, a: &[Value], b: &[Value]) -> Ordering {
    for ((x, y), field) in a.iter().zip(b).zip(&self.fields) {
      let ord = x.sort_cmp(y);
      let ord = if field.ascending { ord } else { ord.reverse() };
      if ord != Ordering::Equal {
        return ord;
      }
    }
    Ordering::Equal
  }

  fn keys(&self, ev: &Evaluator<'_>, row: &dyn Valuer) -> Result<Vec<Value>, EvalError> {
    self.fields.iter().map(|f| ev.eval(&f.expr, row)).collect()
  }

  fn sorted<T: Clone>(
    &self,
    items: &[T],
    key: impl Fn(&T) -> Result<Vec<Value>, EvalError>,
  ) -> Result<Vec<T>, EvalError> {
    let mut keyed = Vec::with_capacity(items.len());
    for it in items {
      keyed.push((key(it)?, it.clone()));
    }
    keyed.sort_by(|(a, _), (b, _)| self.compare(a, b));
    Ok(keyed.into_iter().map(|(_, it)| it).collect())
  }
}

impl Operation for OrderOp {
  fn name(&self) -> &str {
    "order"
  }

  fn apply(&self, item: &StreamItem) -> Result<Option<StreamItem>, EvalError> {
    let ev = Evaluator::new(&self.functions);
    let out = match item {
      StreamItem::Tuple(_) => item.clone(),
      StreamItem::Window(set) => {
        let mut content = Vec::with_capacity(set.content.len());
        for w in &set.content {
          content.push(WindowTuples {
            emitter: w.emitter.clone(),
            tuples: self.sorted(&w.tuples, |t| self.keys(&ev, &**t))?,
          });
        }
        StreamItem::Window(WindowTuplesSet {
          content,
          range: set.range,
        })
      }
      StreamItem::Join(set) => StreamItem::Join(JoinTupleSet {
        content: self.sorted(&set.content, |r| self.keys(&ev, r))?,
        range: set.range,
      }),
      StreamItem::Grouped(set) => StreamItem::Grouped(GroupedTuplesSet {
        groups: self.sorted(&set.groups, |g| {
          self
            .fields
            .iter()
            .map(|f| ev.eval_group(&f.expr, &g.rows))
            .collect()
        })?,
      }),
      _ => return Err(unexpected("order", item)),
    };
    Ok(Some(out))
  }
}
