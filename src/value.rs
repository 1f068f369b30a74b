//! Dynamic values and field maps.
//!
//! Tuples carry open field maps rather than typed structs. A [`Value`] is a tagged
//! variant and a [`Message`] maps field names to values. Field resolution is an explicit
//! algorithm (see [`Message::lookup`]): exact match, then case-insensitive match, then
//! dotted-path descent into nested maps.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// A dynamically typed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum Value {
  /// Absent or null value.
  #[default]
  Null,
  /// Boolean.
  Bool(bool),
  /// 64-bit signed integer (`bigint`).
  Int(i64),
  /// 64-bit float.
  Float(f64),
  /// UTF-8 string.
  String(String),
  /// Raw bytes.
  Bytes(Vec<u8>),
  /// Ordered list of values.
  Array(Vec<Value>),
  /// Nested field map.
  Map(Message),
}

impl Value {
  /// Returns the SQL-ish type name used in error messages.
  pub fn type_name(&self) -> &'static str {
    match self {
      Value::Null => "null",
      Value::Bool(_) => "boolean",
      Value::Int(_) => "bigint",
      Value::Float(_) => "float",
      Value::String(_) => "string",
      Value::Bytes(_) => "bytea",
      Value::Array(_) => "array",
      Value::Map(_) => "struct",
    }
  }

  /// Returns true for [`Value::Null`].
  pub fn is_null(&self) -> bool {
    matches!(self, Value::Null)
  }

  /// Numeric view of the value, if it is a number.
  pub fn as_f64(&self) -> Option<f64> {
    match self {
      Value::Int(i) => Some(*i as f64),
      Value::Float(f) => Some(*f),
      _ => None,
    }
  }

  /// Integer view of the value. Floats are accepted only when integral.
  pub fn as_i64(&self) -> Option<i64> {
    match self {
      Value::Int(i) => Some(*i),
      Value::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
      _ => None,
    }
  }

  /// Boolean view of the value.
  pub fn as_bool(&self) -> Option<bool> {
    match self {
      Value::Bool(b) => Some(*b),
      _ => None,
    }
  }

  /// String view of the value.
  pub fn as_str(&self) -> Option<&str> {
    match self {
      Value::String(s) => Some(s.as_str()),
      _ => None,
    }
  }

  /// Compares two values, coercing between integers and floats.
  ///
  /// Returns `None` when the values are not comparable (different kinds, NaN, maps).
  pub fn compare(&self, other: &Value) -> Option<Ordering> {
    match (self, other) {
      (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
      (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
        self.as_f64()?.partial_cmp(&other.as_f64()?)
      }
      (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
      (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
      (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
      (Value::Null, Value::Null) => Some(Ordering::Equal),
      _ => None,
    }
  }

  /// Ordering used by sorts: comparable values compare normally, nulls sort first and
  /// incomparable pairs are treated as equal so a stable sort keeps their order.
  pub fn sort_cmp(&self, other: &Value) -> Ordering {
    match (self, other) {
      (Value::Null, Value::Null) => Ordering::Equal,
      (Value::Null, _) => Ordering::Less,
      (_, Value::Null) => Ordering::Greater,
      _ => self.compare(other).unwrap_or(Ordering::Equal),
    }
  }

  /// Canonical, type-tagged string form used to build grouping keys.
  ///
  /// Distinct values always produce distinct strings (except NaN), and every form is
  /// self-delimiting, so concatenations of key strings separated by `,` cannot collide.
  pub fn key_string(&self) -> String {
    match self {
      Value::Null => "null".to_string(),
      Value::Bool(b) => b.to_string(),
      Value::Int(i) => i.to_string(),
      // -0.0 == 0.0, so both share one key.
      Value::Float(f) if *f == 0.0 => format!("{:?}", 0.0f64),
      Value::Float(f) => format!("{:?}", f),
      Value::String(s) => quote(s),
      Value::Bytes(b) => {
        let hex: String = b.iter().map(|x| format!("{:02x}", x)).collect();
        format!("0x{}", hex)
      }
      Value::Array(items) => {
        let inner: Vec<String> = items.iter().map(Value::key_string).collect();
        format!("[{}]", inner.join(","))
      }
      Value::Map(m) => {
        let inner: Vec<String> = m
          .iter()
          .map(|(k, v)| format!("{}:{}", quote(k), v.key_string()))
          .collect();
        format!("{{{}}}", inner.join(","))
      }
    }
  }

  /// Converts into a plain JSON value (bytes become an array of numbers).
  pub fn to_json(&self) -> serde_json::Value {
    match self {
      Value::Null => serde_json::Value::Null,
      Value::Bool(b) => serde_json::Value::Bool(*b),
      Value::Int(i) => serde_json::Value::from(*i),
      Value::Float(f) => serde_json::Number::from_f64(*f)
        .map(serde_json::Value::Number)
        .unwrap_or(serde_json::Value::Null),
      Value::String(s) => serde_json::Value::String(s.clone()),
      Value::Bytes(b) => serde_json::Value::Array(b.iter().map(|x| (*x).into()).collect()),
      Value::Array(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
      Value::Map(m) => m.to_json(),
    }
  }
}

fn quote(s: &str) -> String {
  serde_json::Value::String(s.to_string()).to_string()
}

impl fmt::Display for Value {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Value::Null => write!(f, "null"),
      Value::Bool(b) => write!(f, "{}", b),
      Value::Int(i) => write!(f, "{}", i),
      Value::Float(x) => write!(f, "{}", x),
      Value::String(s) => write!(f, "{}", s),
      other => write!(f, "{}", other.to_json()),
    }
  }
}

impl From<serde_json::Value> for Value {
  fn from(v: serde_json::Value) -> Self {
    match v {
      serde_json::Value::Null => Value::Null,
      serde_json::Value::Bool(b) => Value::Bool(b),
      serde_json::Value::Number(n) => match n.as_i64() {
        Some(i) => Value::Int(i),
        None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
      },
      serde_json::Value::String(s) => Value::String(s),
      serde_json::Value::Array(items) => Value::Array(items.into_iter().map(Value::from).collect()),
      serde_json::Value::Object(map) => Value::Map(
        map
          .into_iter()
          .map(|(k, v)| (k, Value::from(v)))
          .collect(),
      ),
    }
  }
}

impl From<i64> for Value {
  fn from(v: i64) -> Self {
    Value::Int(v)
  }
}

impl From<f64> for Value {
  fn from(v: f64) -> Self {
    Value::Float(v)
  }
}

impl From<bool> for Value {
  fn from(v: bool) -> Self {
    Value::Bool(v)
  }
}

impl From<&str> for Value {
  fn from(v: &str) -> Self {
    Value::String(v.to_string())
  }
}

impl From<String> for Value {
  fn from(v: String) -> Self {
    Value::String(v)
  }
}

/// A field map: field name to [`Value`].
///
/// Keys are kept sorted so serialization and iteration are deterministic.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Message(BTreeMap<String, Value>);

impl Message {
  /// Creates an empty message.
  pub fn new() -> Self {
    Self(BTreeMap::new())
  }

  /// Inserts a field, returning the previous value for the exact key.
  pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
    self.0.insert(key.into(), value.into())
  }

  /// Exact-key access.
  pub fn get(&self, key: &str) -> Option<&Value> {
    self.0.get(key)
  }

  /// Removes a field by exact key.
  pub fn remove(&mut self, key: &str) -> Option<Value> {
    self.0.remove(key)
  }

  /// Number of top-level fields.
  pub fn len(&self) -> usize {
    self.0.len()
  }

  /// Returns true if the message has no fields.
  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// Iterates over fields in key order.
  pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
    self.0.iter()
  }

  /// Resolves a field name.
  ///
  /// 1. exact key match;
  /// 2. case-insensitive key match (first match in key order);
  /// 3. if the name contains `.`, the segment before the first dot is resolved with
  ///    rules 1-2 and the remainder is looked up inside the nested map.
  pub fn lookup(&self, key: &str) -> Option<&Value> {
    if let Some(v) = self.lookup_flat(key) {
      return Some(v);
    }
    let (head, rest) = key.split_once('.')?;
    match self.lookup_flat(head)? {
      Value::Map(inner) => inner.lookup(rest),
      _ => None,
    }
  }

  fn lookup_flat(&self, key: &str) -> Option<&Value> {
    self.0.get(key).or_else(|| {
      self
        .0
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v)
    })
  }

  /// Converts into a JSON object.
  pub fn to_json(&self) -> serde_json::Value {
    serde_json::Value::Object(
      self
        .0
        .iter()
        .map(|(k, v)| (k.clone(), v.to_json()))
        .collect(),
    )
  }

  /// Builds a message from a JSON object. Non-object JSON yields `None`.
  pub fn from_json(v: serde_json::Value) -> Option<Self> {
    match Value::from(v) {
      Value::Map(m) => Some(m),
      _ => None,
    }
  }
}

impl FromIterator<(String, Value)> for Message {
  fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
    Self(iter.into_iter().collect())
  }
}

impl IntoIterator for Message {
  type Item = (String, Value);
  type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

  fn into_iter(self) -> Self::IntoIter {
    self.0.into_iter()
  }
}

/// Builds a [`Message`] from `key => value` pairs.
///
/// ```rust
/// use ruleweave::message;
/// let m = message! { "count" => 1i64, "name" => "dev1" };
/// assert_eq!(m.len(), 2);
/// ```
#[macro_export]
macro_rules! message {
  () => { $crate::value::Message::new() };
  ($($k:expr => $v:expr),+ $(,)?) => {{
    let mut m = $crate::value::Message::new();
    $( m.insert($k, $crate::value::Value::from($v)); )+
    m
  }};
}
