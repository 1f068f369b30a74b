//! Tests for dynamic values, field lookup and grouping key strings.

use crate::message;
use crate::value::*;
use std::cmp::Ordering;

// ============================================================================
// Lookup
// ============================================================================

#[test]
fn test_lookup_exact_then_case_insensitive() {
  let m = message! { "Temperature" => 20i64, "temperature" => 21i64, "Humidity" => 50i64 };
  assert_eq!(m.lookup("temperature"), Some(&Value::Int(21)));
  assert_eq!(m.lookup("humidity"), Some(&Value::Int(50)));
  assert_eq!(m.lookup("pressure"), None);
}

#[test]
fn test_lookup_dotted_path() {
  let inner = message! { "Lat" => 1.5, "lng" => 2.5 };
  let mut m = Message::new();
  m.insert("pos", Value::Map(inner));
  m.insert("a.b", 7i64);

  assert_eq!(m.lookup("pos.lat"), Some(&Value::Float(1.5)));
  assert_eq!(m.lookup("POS.lng"), Some(&Value::Float(2.5)));
  // A literal dotted key wins over path descent.
  assert_eq!(m.lookup("a.b"), Some(&Value::Int(7)));
  assert_eq!(m.lookup("pos.alt"), None);
  assert_eq!(m.lookup("a.b.c"), None);
}

#[test]
fn test_from_json_object() {
  let json = serde_json::json!({ "n": 1, "f": 1.5, "s": "x", "nested": { "b": true }, "l": [1, null] });
  let m = Message::from_json(json.clone()).unwrap();
  assert_eq!(m.get("n"), Some(&Value::Int(1)));
  assert_eq!(m.get("f"), Some(&Value::Float(1.5)));
  assert_eq!(m.lookup("nested.b"), Some(&Value::Bool(true)));
  assert_eq!(m.get("l"), Some(&Value::Array(vec![Value::Int(1), Value::Null])));
  assert_eq!(m.to_json(), json);
  assert!(Message::from_json(serde_json::json!([1, 2])).is_none());
}

// ============================================================================
// Comparison
// ============================================================================

#[test]
fn test_compare_coerces_numbers() {
  assert_eq!(Value::Int(2).compare(&Value::Float(2.0)), Some(Ordering::Equal));
  assert_eq!(Value::Float(1.5).compare(&Value::Int(2)), Some(Ordering::Less));
  assert_eq!(Value::from("a").compare(&Value::Int(1)), None);
}

#[test]
fn test_sort_cmp_nulls_first() {
  let mut values = vec![Value::Int(3), Value::Null, Value::Int(1)];
  values.sort_by(|a, b| a.sort_cmp(b));
  assert_eq!(values, vec![Value::Null, Value::Int(1), Value::Int(3)]);
}

// ============================================================================
// Key strings
// ============================================================================

#[test]
fn test_key_string_distinguishes_types() {
  assert_ne!(Value::Int(1).key_string(), Value::Float(1.0).key_string());
  assert_ne!(Value::Int(1).key_string(), Value::from("1").key_string());
  assert_ne!(Value::Null.key_string(), Value::from("null").key_string());
  assert_eq!(Value::from("a,b").key_string(), "\"a,b\"");
  assert_eq!(Value::Float(-0.0), Value::Float(0.0));
  assert_eq!(Value::Float(-0.0).key_string(), Value::Float(0.0).key_string());
  assert_ne!(Value::Float(-0.5).key_string(), Value::Float(0.5).key_string());
}
