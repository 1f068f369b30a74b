//! Schema validation, type casting and event-time extraction.

use super::{Operation, unexpected};
use crate::ast::{FieldType, StreamDefinition, StreamField};
use crate::error::EvalError;
use crate::tuple::{StreamItem, Tuple};
use crate::value::{Message, Value};
use chrono::DateTime;
use std::sync::Arc;

/// Casts each tuple of one stream against the stream schema.
///
/// A schemaless stream passes its messages through unchanged. With a schema, the output
/// message holds exactly the declared fields, under their declared names, converted to
/// their declared types; a missing field or an impossible conversion is an evaluation
/// error. In event-time mode the tuple timestamp is read from the stream's timestamp
/// field.
pub struct PreprocessorOp {
  stream: StreamDefinition,
  event_time_field: Option<String>,
}

impl PreprocessorOp {
  /// Creates a preprocessor.
  ///
  /// # Arguments
  ///
  /// * `stream` - Definition of the stream this preprocessor serves.
  /// * `event_time_field` - Field holding the event time, for event-time rules.
  pub fn new(stream: StreamDefinition, event_time_field: Option<String>) -> Self {
    Self {
      stream,
      event_time_field,
    }
  }

  fn cast_message(&self, message: &Message) -> Result<Message, EvalError> {
    if self.stream.fields.is_empty() {
      return Ok(message.clone());
    }
    cast_fields(&self.stream.fields, message)
  }
}

fn cast_fields(fields: &[StreamField], message: &Message) -> Result<Message, EvalError> {
  let mut out = Message::new();
  for field in fields {
    let raw = message.lookup(&field.name).ok_or_else(|| {
      EvalError::new(format!(
        "error in preprocessor: invalid data {}, field {} not found",
        message.to_json(),
        field.name
      ))
    })?;
    out.insert(field.name.clone(), cast(&field.name, &field.field_type, raw)?);
  }
  Ok(out)
}

fn type_mismatch(name: &str, expected: &str, v: &Value) -> EvalError {
  EvalError::new(format!(
    "invalid data type for {}, expect {} but found {}",
    name, expected, v
  ))
}

fn cast(name: &str, ty: &FieldType, v: &Value) -> Result<Value, EvalError> {
  if v.is_null() {
    return Ok(Value::Null);
  }
  match ty {
    FieldType::Bigint => match v {
      Value::Int(_) => Ok(v.clone()),
      Value::Float(_) => v
        .as_i64()
        .map(Value::Int)
        .ok_or_else(|| type_mismatch(name, "bigint", v)),
      Value::String(s) => s
        .trim()
        .parse::<i64>()
        .map(Value::Int)
        .map_err(|_| type_mismatch(name, "bigint", v)),
      _ => Err(type_mismatch(name, "bigint", v)),
    },
    FieldType::Float => match v {
      Value::Int(_) | Value::Float(_) => v
        .as_f64()
        .map(Value::Float)
        .ok_or_else(|| type_mismatch(name, "float", v)),
      Value::String(s) => s
        .trim()
        .parse::<f64>()
        .map(Value::Float)
        .map_err(|_| type_mismatch(name, "float", v)),
      _ => Err(type_mismatch(name, "float", v)),
    },
    FieldType::String => match v {
      Value::String(_) => Ok(v.clone()),
      _ => Err(type_mismatch(name, "string", v)),
    },
    FieldType::Boolean => match v {
      Value::Bool(_) => Ok(v.clone()),
      Value::String(s) => s
        .trim()
        .parse::<bool>()
        .map(Value::Bool)
        .map_err(|_| type_mismatch(name, "boolean", v)),
      _ => Err(type_mismatch(name, "boolean", v)),
    },
    FieldType::Datetime => to_millis(v)
      .map(Value::Int)
      .ok_or_else(|| type_mismatch(name, "datetime", v)),
    FieldType::Bytea => match v {
      Value::Bytes(_) => Ok(v.clone()),
      Value::String(s) => Ok(Value::Bytes(s.as_bytes().to_vec())),
      _ => Err(type_mismatch(name, "bytea", v)),
    },
    FieldType::Array(elem) => match v {
      Value::Array(items) => items
        .iter()
        .map(|item| cast(name, elem, item))
        .collect::<Result<Vec<_>, _>>()
        .map(Value::Array),
      _ => Err(type_mismatch(name, "array", v)),
    },
    FieldType::Struct(fields) => match v {
      Value::Map(m) => cast_fields(fields, m).map(Value::Map),
      _ => Err(type_mismatch(name, "struct", v)),
    },
  }
}

/// Converts an integer or RFC 3339 string into epoch milliseconds.
pub fn to_millis(v: &Value) -> Option<i64> {
  match v {
    Value::Int(i) => Some(*i),
    Value::Float(_) => v.as_i64(),
    Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
      .ok()
      .map(|dt| dt.timestamp_millis()),
    _ => None,
  }
}

impl Operation for PreprocessorOp {
  fn name(&self) -> &str {
    "preprocessor"
  }

  fn apply(&self, item: &StreamItem) -> Result<Option<StreamItem>, EvalError> {
    let StreamItem::Tuple(tuple) = item else {
      return Err(unexpected("preprocessor", item));
    };
    let message = self.cast_message(&tuple.message)?;
    let timestamp = match &self.event_time_field {
      Some(field) => {
        let raw = message.lookup(field).ok_or_else(|| {
          EvalError::new(format!("cannot find timestamp field {} in tuple", field))
        })?;
        to_millis(raw).ok_or_else(|| {
          EvalError::new(format!(
            "cannot convert timestamp field {} to int: {}",
            field, raw
          ))
        })?
      }
      None => tuple.timestamp,
    };
    let out = Tuple {
      emitter: tuple.emitter.clone(),
      message,
      timestamp,
      metadata: tuple.metadata.clone(),
    };
    Ok(Some(StreamItem::Tuple(Arc::new(out))))
  }
}
