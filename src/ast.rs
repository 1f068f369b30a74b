//! Parsed statement tree consumed by the planner.
//!
//! Parsing SQL text is the job of an external collaborator implementing [`SqlParser`].
//! The engine only walks the resulting [`SelectStatement`]. Stream definitions are plain
//! serde structs so they can be persisted by the stream processor.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
  /// Logical `AND`.
  And,
  /// Logical `OR`.
  Or,
  /// `=`
  Eq,
  /// `!=` / `<>`
  Neq,
  /// `<`
  Lt,
  /// `<=`
  Lte,
  /// `>`
  Gt,
  /// `>=`
  Gte,
  /// `+`
  Add,
  /// `-`
  Sub,
  /// `*`
  Mul,
  /// `/`
  Div,
  /// `%`
  Mod,
}

impl BinaryOp {
  /// SQL spelling, for error messages.
  pub fn symbol(&self) -> &'static str {
    match self {
      BinaryOp::And => "AND",
      BinaryOp::Or => "OR",
      BinaryOp::Eq => "=",
      BinaryOp::Neq => "!=",
      BinaryOp::Lt => "<",
      BinaryOp::Lte => "<=",
      BinaryOp::Gt => ">",
      BinaryOp::Gte => ">=",
      BinaryOp::Add => "+",
      BinaryOp::Sub => "-",
      BinaryOp::Mul => "*",
      BinaryOp::Div => "/",
      BinaryOp::Mod => "%",
    }
  }
}

/// An expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
  /// A field reference, optionally qualified by stream name.
  Field {
    /// Qualifying stream.
    stream: Option<String>,
    /// Field name; may be a dotted path into nested maps.
    name: String,
  },
  /// `*` or `stream.*`.
  Wildcard {
    /// Qualifying stream.
    stream: Option<String>,
  },
  /// A literal.
  Literal(Value),
  /// Binary operation.
  Binary {
    /// Operator.
    op: BinaryOp,
    /// Left operand.
    lhs: Box<Expr>,
    /// Right operand.
    rhs: Box<Expr>,
  },
  /// Logical negation.
  Not(Box<Expr>),
  /// Function call, scalar or aggregate.
  Call {
    /// Function name, case-insensitive.
    name: String,
    /// Arguments.
    args: Vec<Expr>,
  },
}

impl Expr {
  /// Unqualified field reference.
  pub fn field(name: impl Into<String>) -> Self {
    Expr::Field {
      stream: None,
      name: name.into(),
    }
  }

  /// Stream-qualified field reference.
  pub fn qualified(stream: impl Into<String>, name: impl Into<String>) -> Self {
    Expr::Field {
      stream: Some(stream.into()),
      name: name.into(),
    }
  }

  /// Literal value.
  pub fn lit(v: impl Into<Value>) -> Self {
    Expr::Literal(v.into())
  }

  /// Unqualified `*`.
  pub fn wildcard() -> Self {
    Expr::Wildcard { stream: None }
  }

  /// Binary expression.
  pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
    Expr::Binary {
      op,
      lhs: Box::new(lhs),
      rhs: Box::new(rhs),
    }
  }

  /// Function call.
  pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Self {
    Expr::Call {
      name: name.into(),
      args,
    }
  }

  /// Visits this expression and every sub-expression, depth first.
  pub fn walk<'a>(&'a self, f: &mut dyn FnMut(&'a Expr)) {
    f(self);
    match self {
      Expr::Binary { lhs, rhs, .. } => {
        lhs.walk(f);
        rhs.walk(f);
      }
      Expr::Not(inner) => inner.walk(f),
      Expr::Call { args, .. } => args.iter().for_each(|a| a.walk(f)),
      _ => {}
    }
  }
}

/// A projected field of the select list.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
  /// Expression to evaluate.
  pub expr: Expr,
  /// `AS` alias.
  pub alias: Option<String>,
}

impl Field {
  /// Field without alias.
  pub fn new(expr: Expr) -> Self {
    Self { expr, alias: None }
  }

  /// Field with alias.
  pub fn aliased(expr: Expr, alias: impl Into<String>) -> Self {
    Self {
      expr,
      alias: Some(alias.into()),
    }
  }
}

/// Window kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowType {
  /// Fixed, non-overlapping time windows.
  Tumbling,
  /// Fixed-length time windows started every `interval`.
  Hopping,
  /// A window ending at every arriving tuple.
  Sliding,
  /// Count-based windows, optionally hopping by `interval` tuples.
  Count,
}

/// Time units accepted by window functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TimeUnit {
  /// Milliseconds.
  Ms,
  /// Seconds.
  #[default]
  Ss,
  /// Minutes.
  Mi,
  /// Hours.
  Hh,
  /// Days.
  Dd,
}

impl TimeUnit {
  /// Milliseconds per unit.
  pub fn millis(&self) -> i64 {
    match self {
      TimeUnit::Ms => 1,
      TimeUnit::Ss => 1_000,
      TimeUnit::Mi => 60_000,
      TimeUnit::Hh => 3_600_000,
      TimeUnit::Dd => 86_400_000,
    }
  }
}

/// A window declaration from the `GROUP BY` clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSpec {
  /// Window kind.
  pub window_type: WindowType,
  /// Length in `unit`s, or tuple count for count windows.
  pub length: i64,
  /// Hop size in `unit`s (hopping) or tuples (count); 0 means "same as length".
  pub interval: i64,
  /// Time unit for time windows.
  pub unit: TimeUnit,
}

impl WindowSpec {
  /// `TUMBLINGWINDOW(unit, length)`.
  pub fn tumbling(unit: TimeUnit, length: i64) -> Self {
    Self {
      window_type: WindowType::Tumbling,
      length,
      interval: 0,
      unit,
    }
  }

  /// `HOPPINGWINDOW(unit, length, interval)`.
  pub fn hopping(unit: TimeUnit, length: i64, interval: i64) -> Self {
    Self {
      window_type: WindowType::Hopping,
      length,
      interval,
      unit,
    }
  }

  /// `SLIDINGWINDOW(unit, length)`.
  pub fn sliding(unit: TimeUnit, length: i64) -> Self {
    Self {
      window_type: WindowType::Sliding,
      length,
      interval: 0,
      unit,
    }
  }

  /// `COUNTWINDOW(count[, interval])`.
  pub fn count(length: i64, interval: i64) -> Self {
    Self {
      window_type: WindowType::Count,
      length,
      interval,
      unit: TimeUnit::Ms,
    }
  }

  /// Window length in milliseconds (time windows).
  pub fn length_ms(&self) -> i64 {
    self.length * self.unit.millis()
  }

  /// Hop in milliseconds, falling back to the length.
  pub fn interval_ms(&self) -> i64 {
    if self.interval > 0 {
      self.interval * self.unit.millis()
    } else {
      self.length_ms()
    }
  }
}

/// Join kinds as written in the statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
  /// `INNER JOIN`.
  Inner,
  /// `CROSS JOIN`.
  Cross,
  /// `LEFT JOIN` (rejected by the planner).
  Left,
  /// `RIGHT JOIN` (rejected by the planner).
  Right,
  /// `FULL JOIN` (rejected by the planner).
  Full,
}

/// A join clause.
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
  /// Stream joined in.
  pub stream: String,
  /// Join kind.
  pub join_type: JoinType,
  /// `ON` condition.
  pub condition: Option<Expr>,
}

/// An `ORDER BY` entry.
#[derive(Debug, Clone, PartialEq)]
pub struct SortField {
  /// Sort expression (field or aggregate).
  pub expr: Expr,
  /// Ascending when true.
  pub ascending: bool,
}

/// A parsed `SELECT` statement.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectStatement {
  /// Select list.
  pub fields: Vec<Field>,
  /// `FROM` stream.
  pub source: String,
  /// Join clauses in statement order.
  pub joins: Vec<Join>,
  /// `WHERE` condition.
  pub condition: Option<Expr>,
  /// Window from the `GROUP BY` clause.
  pub window: Option<WindowSpec>,
  /// Grouping dimensions (excluding the window).
  pub group_by: Vec<Expr>,
  /// `HAVING` condition.
  pub having: Option<Expr>,
  /// `ORDER BY` fields.
  pub sort_fields: Vec<SortField>,
}

impl SelectStatement {
  /// Streams referenced by the statement: the `FROM` stream then joined streams.
  pub fn streams(&self) -> Vec<String> {
    std::iter::once(self.source.clone())
      .chain(self.joins.iter().map(|j| j.stream.clone()))
      .collect()
  }
}

/// The external SQL parser.
pub trait SqlParser: Send + Sync {
  /// Parses a select statement.
  fn parse_select(&self, sql: &str) -> Result<SelectStatement, String>;
}

/// A [`SqlParser`] backed by statements prepared ahead of time, for embedders that
/// build statement trees programmatically.
///
/// SQL text is matched after trimming and collapsing whitespace.
#[derive(Default)]
pub struct PreparedStatements {
  statements: RwLock<HashMap<String, SelectStatement>>,
}

impl PreparedStatements {
  /// Creates an empty set.
  pub fn new() -> Self {
    Self::default()
  }

  /// Registers the tree for a SQL text.
  pub fn prepare(&self, sql: &str, stmt: SelectStatement) {
    if let Ok(mut guard) = self.statements.write() {
      guard.insert(normalize(sql), stmt);
    }
  }
}

fn normalize(sql: &str) -> String {
  sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl SqlParser for PreparedStatements {
  fn parse_select(&self, sql: &str) -> Result<SelectStatement, String> {
    let guard = self
      .statements
      .read()
      .map_err(|_| "statement registry poisoned".to_string())?;
    guard
      .get(&normalize(sql))
      .cloned()
      .ok_or_else(|| format!("no prepared statement for {}", sql))
  }
}

/// Declared field types of a stream schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
  /// 64-bit integer.
  Bigint,
  /// Float.
  Float,
  /// String.
  String,
  /// Date-time, stored as epoch milliseconds.
  Datetime,
  /// Boolean.
  Boolean,
  /// Bytes.
  Bytea,
  /// Array of an element type.
  Array(Box<FieldType>),
  /// Nested struct.
  Struct(Vec<StreamField>),
}

/// A declared field of a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamField {
  /// Field name.
  pub name: String,
  /// Field type.
  pub field_type: FieldType,
}

impl StreamField {
  /// Creates a field.
  pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
    Self {
      name: name.into(),
      field_type,
    }
  }
}

fn default_format() -> String {
  "json".to_string()
}

/// Options from the `WITH (...)` clause of `CREATE STREAM`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StreamOptions {
  /// Topic, file name or other source-specific address.
  pub datasource: String,
  /// Source type; the registry resolves it to a factory.
  #[serde(rename = "type")]
  pub source_type: String,
  /// Payload format.
  #[serde(default = "default_format")]
  pub format: String,
  /// Share one physical connection across rules.
  pub shared: bool,
  /// Field carrying the event time, for event-time rules.
  pub timestamp: Option<String>,
  /// Format of a string timestamp field (RFC 3339 when absent).
  pub timestamp_format: Option<String>,
  /// Key of the source configuration profile.
  pub conf_key: Option<String>,
  /// Source properties (`concurrency`, `bufferLength`, source specific keys).
  pub props: HashMap<String, serde_json::Value>,
}

/// A stream definition as created by `CREATE STREAM`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDefinition {
  /// Stream name.
  pub name: String,
  /// Declared schema; empty for schemaless streams.
  #[serde(default)]
  pub fields: Vec<StreamField>,
  /// Source options.
  pub options: StreamOptions,
}

impl StreamDefinition {
  /// Creates a definition.
  pub fn new(name: impl Into<String>, fields: Vec<StreamField>, options: StreamOptions) -> Self {
    Self {
      name: name.into(),
      fields,
      options,
    }
  }
}
