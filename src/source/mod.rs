//! # Sources
//!
//! A [`Source`] is one physical connection to an external feed. Sources never talk to the
//! topology directly: the [`SourcePool`] opens them, fans their records out to every
//! registered consumer and closes them when the last consumer leaves.
//!
//! Source types are resolved by name through a [`SourceRegistry`] of factories. The
//! registry created by [`SourceRegistry::with_builtins`] knows:
//!
//! - `file`: a JSON array file, optionally re-read every `interval` milliseconds;
//! - `memory`: records listed in the `data` property, rewindable by position.

pub mod file;
pub mod memory;
pub mod pool;

#[cfg(test)]
mod pool_test;

pub use file::FileSource;
pub use memory::MemorySource;
pub use pool::{ConsumerId, SourceHandle, SourcePool, SourceSpec};

use crate::error::SourceError;
use crate::tuple::Metadata;
use crate::value::{Message, Value};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Source properties, as declared in a stream's `WITH` options.
pub type SourceProps = HashMap<String, serde_json::Value>;

/// One record read from a source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceTuple {
  /// Payload.
  pub message: Message,
  /// Protocol specific provenance.
  pub metadata: Metadata,
}

impl SourceTuple {
  /// A record without metadata.
  pub fn new(message: Message) -> Self {
    Self {
      message,
      metadata: Metadata::new(),
    }
  }
}

/// Identity of the connection a source serves.
#[derive(Debug, Clone)]
pub struct SourceContext {
  /// Pool key of the connection.
  pub key: String,
  /// Stops the connection.
  pub cancel: CancellationToken,
}

/// A physical connection.
#[async_trait]
pub trait Source: Send + Sync {
  /// Applies the datasource address and properties before the source is opened.
  fn configure(&mut self, datasource: &str, props: &SourceProps) -> Result<(), SourceError>;

  /// Produces records into `consumer` until the feed ends or `ctx.cancel` fires.
  ///
  /// Returning ends the stream for every consumer. Connection failures are reported on
  /// `errors`.
  async fn open(
    &self,
    ctx: SourceContext,
    consumer: mpsc::Sender<SourceTuple>,
    errors: mpsc::Sender<SourceError>,
  );

  /// Releases the connection. Called exactly once, after the last consumer has left.
  async fn close(&self) -> Result<(), SourceError>;

  /// The rewind capability, for sources that support it.
  fn as_rewindable(&self) -> Option<&dyn Rewindable> {
    None
  }
}

/// A source that can report and restore its read position.
pub trait Rewindable: Send + Sync {
  /// Position after the last produced record.
  fn offset(&self) -> Result<Value, SourceError>;

  /// Continues from a position previously returned by [`Rewindable::offset`].
  fn rewind(&self, offset: &Value) -> Result<(), SourceError>;
}

/// Creates unconfigured sources.
pub type SourceFactory = Arc<dyn Fn() -> Box<dyn Source> + Send + Sync>;

/// Source factories by type name (case-insensitive).
#[derive(Clone, Default)]
pub struct SourceRegistry {
  factories: HashMap<String, SourceFactory>,
}

impl SourceRegistry {
  /// A registry without any source type.
  pub fn new() -> Self {
    Self::default()
  }

  /// A registry with the `file` and `memory` sources.
  pub fn with_builtins() -> Self {
    let mut registry = Self::new();
    registry.register("file", || Box::new(FileSource::new()));
    registry.register("memory", || Box::new(MemorySource::new()));
    registry
  }

  /// Registers (or replaces) a source type.
  pub fn register<F>(&mut self, source_type: &str, factory: F)
  where
    F: Fn() -> Box<dyn Source> + Send + Sync + 'static,
  {
    self
      .factories
      .insert(source_type.to_lowercase(), Arc::new(factory));
  }

  /// Returns true if `source_type` is registered.
  pub fn contains(&self, source_type: &str) -> bool {
    self.factories.contains_key(&source_type.to_lowercase())
  }

  /// Creates an unconfigured source of `source_type`.
  pub fn create(&self, source_type: &str) -> Result<Box<dyn Source>, SourceError> {
    self
      .factories
      .get(&source_type.to_lowercase())
      .map(|f| f())
      .ok_or_else(|| SourceError::UnknownType(source_type.to_string()))
  }
}

/// Reads an optional millisecond property.
pub(crate) fn millis_prop(props: &SourceProps, key: &str) -> Result<Option<u64>, SourceError> {
  match props.get(key) {
    None | Some(serde_json::Value::Null) => Ok(None),
    Some(v) => v
      .as_u64()
      .map(Some)
      .ok_or_else(|| SourceError::Config(format!("{} must be a non-negative integer, got {}", key, v))),
  }
}
