//! # Operators
//!
//! Pure transforms of the rule pipeline. Each operator implements [`Operation`]: it maps
//! one input item to zero or one output item, or fails with an [`EvalError`]. Operators
//! hold no mutable state and never see error items (the node shell forwards those), so
//! they can run as parallel instances.
//!
//! The window operator is the exception: it is stateful and lives in
//! [`window::WindowState`], driven by its own node.
//!
//! Pipeline order: preprocess, window, join, filter, aggregate, having, order, project.

pub mod aggregate;
pub mod filter;
pub mod having;
pub mod join;
pub mod order;
pub mod preprocessor;
pub mod project;
pub mod window;


pub use aggregate::AggregateOp;
pub use filter::FilterOp;
pub use having::HavingOp;
pub use join::JoinOp;
pub use order::OrderOp;
pub use preprocessor::PreprocessorOp;
pub use project::ProjectOp;
pub use window::{WindowConfig, WindowOutput, WindowState};

use crate::error::EvalError;
use crate::tuple::{Row, StreamItem};

/// A pure pipeline transform.
pub trait Operation: Send + Sync {
  /// Short operator name used to prefix evaluation errors.
  fn name(&self) -> &str;

  /// Transforms one non-error item.
  ///
  /// # Returns
  ///
  /// `Ok(None)` when the item is consumed without output (e.g. filtered out).
  fn apply(&self, item: &StreamItem) -> Result<Option<StreamItem>, EvalError>;
}

/// Error for an item shape an operator does not accept.
pub(crate) fn unexpected(op: &str, item: &StreamItem) -> EvalError {
  EvalError::new(format!("{} operator received unexpected {} input", op, item.kind()))
}

/// Flattens a tuple, window or join item into evaluation rows.
///
/// Window sets are flattened emitter by emitter, in order of first appearance.
pub(crate) fn rows_of(item: &StreamItem) -> Option<Vec<Row>> {
  match item {
    StreamItem::Tuple(t) => Some(vec![Row::Tuple(t.clone())]),
    StreamItem::Window(w) => Some(
      w.content
        .iter()
        .flat_map(|e| e.tuples.iter().cloned().map(Row::Tuple))
        .collect(),
    ),
    StreamItem::Join(j) => Some(j.content.iter().cloned().map(Row::Join).collect()),
    _ => None,
  }
}
