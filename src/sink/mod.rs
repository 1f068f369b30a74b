//! # Sinks
//!
//! A [`Sink`] delivers projected records to an external system. The sink node owns one
//! sink per instance and takes care of batching, retries and the durable cache; a sink
//! only has to deliver one batch at a time.
//!
//! Sinks are resolved by action name through a [`SinkRegistry`]. Built-in actions:
//!
//! - `log`: writes each record through `tracing`;
//! - `memory`: keeps records in process, grouped by the `topic` property;
//! - `file`: appends records as JSON lines to the `path` property.

pub mod cache;
pub mod file;
pub mod log;
pub mod memory;

pub use cache::{Cache, CacheSnapshot, SaveJob};
pub use file::FileSink;
pub use log::LogSink;
pub use memory::{MemoryCollector, MemoryHub, MemorySink};

use crate::error::SinkError;
use crate::value::Message;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// A batch of records delivered in one call.
pub type Payload = Vec<Message>;

/// Identity of the sink instance being called.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkContext {
  /// Rule id.
  pub rule_id: String,
  /// Sink node name.
  pub op_id: String,
  /// Instance index.
  pub instance: usize,
}

/// An external destination.
#[async_trait]
pub trait Sink: Send + Sync {
  /// Applies the action's properties before the sink is opened.
  fn configure(&mut self, props: &serde_json::Value) -> Result<(), SinkError>;

  /// Connects to the destination.
  async fn open(&self, ctx: &SinkContext) -> Result<(), SinkError>;

  /// Delivers one batch. A failure is retried by the sink node.
  async fn collect(&self, ctx: &SinkContext, payload: &Payload) -> Result<(), SinkError>;

  /// Disconnects.
  async fn close(&self, ctx: &SinkContext) -> Result<(), SinkError>;
}

/// Creates unconfigured sinks.
pub type SinkFactory = Arc<dyn Fn() -> Box<dyn Sink> + Send + Sync>;

/// Sink factories by action name (case-insensitive).
#[derive(Clone, Default)]
pub struct SinkRegistry {
  factories: HashMap<String, SinkFactory>,
  memory: MemoryHub,
}

impl SinkRegistry {
  /// A registry without any action.
  pub fn new() -> Self {
    Self::default()
  }

  /// A registry with the `log`, `memory` and `file` actions.
  pub fn with_builtins() -> Self {
    let mut registry = Self::new();
    registry.register("log", || Box::new(LogSink::new()));
    registry.register("file", || Box::new(FileSink::new()));
    let hub = registry.memory.clone();
    registry.register("memory", move || Box::new(MemorySink::in_hub(hub.clone())));
    registry
  }

  /// Registers (or replaces) an action.
  pub fn register<F>(&mut self, action: &str, factory: F)
  where
    F: Fn() -> Box<dyn Sink> + Send + Sync + 'static,
  {
    self.factories.insert(action.to_lowercase(), Arc::new(factory));
  }

  /// Returns true if `action` is registered.
  pub fn contains(&self, action: &str) -> bool {
    self.factories.contains_key(&action.to_lowercase())
  }

  /// Creates an unconfigured sink for `action`.
  pub fn create(&self, action: &str) -> Result<Box<dyn Sink>, SinkError> {
    self
      .factories
      .get(&action.to_lowercase())
      .map(|f| f())
      .ok_or_else(|| SinkError::UnknownType(action.to_string()))
  }

  /// Topics written by the built-in `memory` action.
  pub fn memory_hub(&self) -> &MemoryHub {
    &self.memory
  }
}
