//! Tuples and tuple collections flowing between topology nodes.
//!
//! Every edge of a topology carries [`StreamItem`] values wrapped in `Arc`, so a fan-out
//! hands the same allocation to every consumer. Nodes never mutate what they receive:
//! each stage builds a new item.
//!
//! The progression of shapes through a rule pipeline is:
//!
//! ```text
//! Tuple -> WindowTuplesSet -> JoinTupleSet -> GroupedTuplesSet -> Rows
//! ```
//!
//! Stages that a statement does not use are skipped, so a stage must accept every shape
//! that can precede it. Errors ride along as [`StreamItem::Error`].

use crate::error::EvalError;
use crate::value::{Message, Value};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Protocol specific provenance attached by a source (topic, device id, ...).
pub type Metadata = Message;

/// One input record.
#[derive(Debug, Clone, PartialEq)]
pub struct Tuple {
  /// Name of the node (stream) that emitted the tuple.
  pub emitter: String,
  /// Field values.
  pub message: Message,
  /// Event or ingestion time in milliseconds.
  pub timestamp: i64,
  /// Source supplied metadata.
  pub metadata: Metadata,
}

impl Tuple {
  /// Creates a tuple without metadata.
  pub fn new(emitter: impl Into<String>, message: Message, timestamp: i64) -> Self {
    Self {
      emitter: emitter.into(),
      message,
      timestamp,
      metadata: Metadata::new(),
    }
  }

  /// Attaches metadata.
  pub fn with_metadata(mut self, metadata: Metadata) -> Self {
    self.metadata = metadata;
    self
  }

  /// Resolves a field of this tuple's message.
  pub fn field(&self, key: &str) -> Option<&Value> {
    self.message.lookup(key)
  }
}

/// The `[start, end)` interval, in milliseconds, that a batch of tuples belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WindowRange {
  /// Inclusive start.
  pub start: i64,
  /// Exclusive end.
  pub end: i64,
}

impl WindowRange {
  /// Creates a new range.
  pub fn new(start: i64, end: i64) -> Self {
    Self { start, end }
  }

  /// Returns true if `ts` falls in `[start, end)`.
  pub fn contains(&self, ts: i64) -> bool {
    ts >= self.start && ts < self.end
  }
}

/// Tuples of one emitter inside a window.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowTuples {
  /// Emitting stream.
  pub emitter: String,
  /// Tuples in arrival order.
  pub tuples: Vec<Arc<Tuple>>,
}

/// The output of a window operator: per-emitter tuple lists sharing one range.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WindowTuplesSet {
  /// Per-emitter content, in order of first appearance.
  pub content: Vec<WindowTuples>,
  /// Window interval, absent for ad-hoc sets.
  pub range: Option<WindowRange>,
}

impl WindowTuplesSet {
  /// Creates an empty set for a range.
  pub fn new(range: Option<WindowRange>) -> Self {
    Self {
      content: Vec::new(),
      range,
    }
  }

  /// Appends a tuple to its emitter's list, creating the list if needed.
  pub fn add_tuple(&mut self, tuple: Arc<Tuple>) {
    match self.content.iter_mut().find(|w| w.emitter == tuple.emitter) {
      Some(w) => w.tuples.push(tuple),
      None => self.content.push(WindowTuples {
        emitter: tuple.emitter.clone(),
        tuples: vec![tuple],
      }),
    }
  }

  /// Tuples of one emitter, empty when the emitter contributed nothing.
  pub fn tuples_of(&self, emitter: &str) -> &[Arc<Tuple>] {
    self
      .content
      .iter()
      .find(|w| w.emitter.eq_ignore_ascii_case(emitter))
      .map(|w| w.tuples.as_slice())
      .unwrap_or(&[])
  }

  /// Total number of tuples across emitters.
  pub fn len(&self) -> usize {
    self.content.iter().map(|w| w.tuples.len()).sum()
  }

  /// Returns true when no emitter contributed a tuple.
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// One joined row: a tuple from each joined stream, in statement order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct JoinTuple {
  /// Participating tuples.
  pub tuples: Vec<Arc<Tuple>>,
}

impl JoinTuple {
  /// Finds the tuple contributed by `emitter`.
  pub fn tuple_of(&self, emitter: &str) -> Option<&Arc<Tuple>> {
    self
      .tuples
      .iter()
      .find(|t| t.emitter.eq_ignore_ascii_case(emitter))
  }
}

/// The output of the join operator.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct JoinTupleSet {
  /// Joined rows.
  pub content: Vec<JoinTuple>,
  /// Window interval the rows came from.
  pub range: Option<WindowRange>,
}

/// A row an expression can be evaluated against.
#[derive(Debug, Clone, PartialEq)]
pub enum Row {
  /// A single-stream tuple.
  Tuple(Arc<Tuple>),
  /// A joined row.
  Join(JoinTuple),
}

impl Row {
  /// Timestamp of the row: the tuple's, or the first joined tuple's.
  pub fn timestamp(&self) -> i64 {
    match self {
      Row::Tuple(t) => t.timestamp,
      Row::Join(j) => j.tuples.first().map(|t| t.timestamp).unwrap_or_default(),
    }
  }
}

/// Rows sharing one grouping key.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupedTuples {
  /// The grouping key.
  pub key: String,
  /// Rows in arrival order.
  pub rows: Vec<Row>,
  /// Window interval carried forward from the window or join.
  pub range: Option<WindowRange>,
}

/// The output of the aggregate operator.
///
/// Group order carries no meaning until the order operator sorts it; the aggregate
/// operator emits groups in order of first appearance.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GroupedTuplesSet {
  /// Groups.
  pub groups: Vec<GroupedTuples>,
}

/// A value on a topology edge.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
  /// A single tuple from a source or preprocessor.
  Tuple(Arc<Tuple>),
  /// A fired window.
  Window(WindowTuplesSet),
  /// Joined rows of one window.
  Join(JoinTupleSet),
  /// Grouped rows.
  Grouped(GroupedTuplesSet),
  /// Projected output records, ready for sinks.
  Rows(Vec<Message>),
  /// An evaluation error travelling in the data plane.
  Error(EvalError),
}

impl StreamItem {
  /// Short kind name for logs.
  pub fn kind(&self) -> &'static str {
    match self {
      StreamItem::Tuple(_) => "tuple",
      StreamItem::Window(_) => "window",
      StreamItem::Join(_) => "join",
      StreamItem::Grouped(_) => "grouped",
      StreamItem::Rows(_) => "rows",
      StreamItem::Error(_) => "error",
    }
  }

  /// Returns true for [`StreamItem::Error`].
  pub fn is_error(&self) -> bool {
    matches!(self, StreamItem::Error(_))
  }
}

impl From<EvalError> for StreamItem {
  fn from(e: EvalError) -> Self {
    StreamItem::Error(e)
  }
}
