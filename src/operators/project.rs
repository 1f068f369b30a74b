//! Final projection to output records.

use super::{Operation, rows_of, unexpected};
use crate::ast::{Expr, Field};
use crate::error::EvalError;
use crate::expr::Evaluator;
use crate::function::FunctionRegistry;
use crate::tuple::{Row, StreamItem};
use crate::value::{Message, Value};
use std::sync::Arc;

/// Key under which source metadata is attached when it is forwarded to sinks.
pub const META_KEY: &str = "__meta";

/// Maps rows or groups to output records.
///
/// Grouped input yields one record per group, other input one record per tuple or joined
/// row. Column names are the alias, else the field name, else the function name, else
/// `field_{n}` where `n` counts the unnamed columns of the select list.
pub struct ProjectOp {
  columns: Vec<(String, Expr)>,
  send_meta: bool,
  functions: Arc<FunctionRegistry>,
}

impl ProjectOp {
  /// Creates a projection of `fields`.
  pub fn new(fields: Vec<Field>, send_meta: bool, functions: Arc<FunctionRegistry>) -> Self {
    let mut unnamed = 0;
    let columns = fields
      .into_iter()
      .map(|f| {
        let name = column_name(&f, &mut unnamed);
        (name, f.expr)
      })
      .collect();
    Self {
      columns,
      send_meta,
      functions,
    }
  }

  /// Output column names in select-list order; wildcards appear as `*`.
  pub fn column_names(&self) -> Vec<&str> {
    self.columns.iter().map(|(n, _)| n.as_str()).collect()
  }

  fn record(&self, ev: &Evaluator<'_>, first: Option<&Row>, group: Option<&[Row]>) -> Result<Message, EvalError> {
    let mut out = Message::new();
    for (name, expr) in &self.columns {
      let value = match group {
        Some(rows) => ev.eval_group(expr, rows)?,
        None => match first {
          Some(row) => ev.eval(expr, row)?,
          None => Value::Null,
        },
      };
      match (expr, value) {
        (Expr::Wildcard { .. }, Value::Map(fields)) => {
          for (k, v) in fields {
            out.insert(k, v);
          }
        }
        (_, v) => {
          out.insert(name.clone(), v);
        }
      }
    }
    if self.send_meta {
      if let Some(row) = first {
        out.insert(META_KEY, Value::Map(metadata_of(row)));
      }
    }
    Ok(out)
  }
}

fn column_name(field: &Field, unnamed: &mut usize) -> String {
  if let Some(alias) = &field.alias {
    return alias.clone();
  }
  match &field.expr {
    Expr::Field { name, .. } => name.clone(),
    Expr::Call { name, .. } => name.clone(),
    Expr::Wildcard { .. } => "*".to_string(),
    _ => {
      let n = *unnamed;
      *unnamed += 1;
      format!("field_{}", n)
    }
  }
}

fn metadata_of(row: &Row) -> Message {
  match row {
    Row::Tuple(t) => t.metadata.clone(),
    Row::Join(j) => j
      .tuples
      .first()
      .map(|t| t.metadata.clone())
      .unwrap_or_default(),
  }
}

impl Operation for ProjectOp {
  fn name(&self) -> &str {
    "project"
  }

  fn apply(&self, item: &StreamItem) -> Result<Option<StreamItem>, EvalError> {
    let ev = Evaluator::new(&self.functions);
    let records = match item {
      StreamItem::Grouped(set) => set
        .groups
        .iter()
        .map(|g| self.record(&ev, g.rows.first(), Some(&g.rows)))
        .collect::<Result<Vec<_>, _>>()?,
      _ => {
        let rows = rows_of(item).ok_or_else(|| unexpected("project", item))?;
        rows
          .iter()
          .map(|r| self.record(&ev, Some(r), None))
          .collect::<Result<Vec<_>, _>>()?
      }
    };
    Ok(Some(StreamItem::Rows(records)))
  }
}
