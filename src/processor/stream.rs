//! Stream definitions.

use crate::ast::{FieldType, StreamDefinition, StreamField};
use crate::error::{EngineError, EngineResult, StoreError};
use crate::store::{FileKvStore, KeyValueStore, get_as};
use std::fmt::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Creates, lists, describes and drops stream definitions.
///
/// Definitions are stored as JSON in a [`KeyValueStore`], keyed by stream name.
pub struct StreamProcessor {
  store: Arc<dyn KeyValueStore>,
}

impl StreamProcessor {
  /// Uses `store` for definitions.
  pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
    Self { store }
  }

  /// Opens the `stream` store under `data_dir`.
  pub fn open(data_dir: impl AsRef<Path>) -> EngineResult<Self> {
    let store = FileKvStore::open_at(data_dir, "stream")?;
    Ok(Self::new(Arc::new(store)))
  }

  /// Stores a new definition.
  ///
  /// # Errors
  ///
  /// Fails for an unnamed stream, a stream without source type, or a name already in use.
  pub fn create_stream(&self, stream: StreamDefinition) -> EngineResult<String> {
    if stream.name.trim().is_empty() {
      return Err(EngineError::validation("Missing stream name."));
    }
    if stream.options.source_type.trim().is_empty() {
      return Err(EngineError::validation(format!(
        "Missing source type of stream {}.",
        stream.name
      )));
    }
    let value = serde_json::to_value(&stream).map_err(StoreError::from)?;
    self.store.set(&stream.name, value)?;
    info!(stream = %stream.name, "stream created");
    Ok(format!("Stream {} is created.", stream.name))
  }

  /// Loads a definition.
  pub fn get_stream(&self, name: &str) -> EngineResult<StreamDefinition> {
    get_as(self.store.as_ref(), name)?.ok_or_else(|| EngineError::NotFound {
      kind: "Stream",
      name: name.to_string(),
    })
  }

  /// Human readable description: the field table followed by the options.
  pub fn describe_stream(&self, name: &str) -> EngineResult<String> {
    let stream = self.get_stream(name)?;
    let mut out = String::from("Fields\n");
    out.push_str(&"-".repeat(80));
    out.push('\n');
    for field in &stream.fields {
      let _ = writeln!(out, "{}\t{}", field.name, type_name(&field.field_type));
    }
    out.push('\n');
    let opts = &stream.options;
    let _ = writeln!(out, "DATASOURCE: {}", opts.datasource);
    let _ = writeln!(out, "TYPE: {}", opts.source_type);
    let _ = writeln!(out, "FORMAT: {}", opts.format);
    let _ = writeln!(out, "SHARED: {}", opts.shared);
    if let Some(ts) = &opts.timestamp {
      let _ = writeln!(out, "TIMESTAMP: {}", ts);
    }
    if let Some(f) = &opts.timestamp_format {
      let _ = writeln!(out, "TIMESTAMP_FORMAT: {}", f);
    }
    if let Some(k) = &opts.conf_key {
      let _ = writeln!(out, "CONF_KEY: {}", k);
    }
    let mut props: Vec<_> = opts.props.iter().collect();
    props.sort_by(|a, b| a.0.cmp(b.0));
    for (k, v) in props {
      let _ = writeln!(out, "{}: {}", k, v);
    }
    Ok(out)
  }

  /// Names of all streams, or a single notice line when there are none.
  pub fn show_streams(&self) -> EngineResult<Vec<String>> {
    let keys = self.store.keys()?;
    if keys.is_empty() {
      return Ok(vec!["No stream definitions are found.".to_string()]);
    }
    Ok(keys)
  }

  /// Removes a definition.
  pub fn drop_stream(&self, name: &str) -> EngineResult<String> {
    self.store.delete(name).map_err(|e| match e {
      StoreError::NotFound(_) => EngineError::NotFound {
        kind: "Stream",
        name: name.to_string(),
      },
      other => other.into(),
    })?;
    info!(stream = %name, "stream dropped");
    Ok(format!("Stream {} is dropped.", name))
  }
}

fn type_name(t: &FieldType) -> String {
  match t {
    FieldType::Bigint => "bigint".to_string(),
    FieldType::Float => "float".to_string(),
    FieldType::String => "string".to_string(),
    FieldType::Datetime => "datetime".to_string(),
    FieldType::Boolean => "boolean".to_string(),
    FieldType::Bytea => "bytea".to_string(),
    FieldType::Array(inner) => format!("array({})", type_name(inner)),
    FieldType::Struct(fields) => format!("struct({})", struct_fields(fields)),
  }
}

fn struct_fields(fields: &[StreamField]) -> String {
  fields
    .iter()
    .map(|f| format!("{} {}", f.name, type_name(&f.field_type)))
    .collect::<Vec<_>>()
    .join(", ")
}
