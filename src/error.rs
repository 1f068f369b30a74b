//! # Error Handling
//!
//! Error types for the rule engine, split along the propagation policy:
//!
//! - **[`EvalError`]**: expression evaluation failures. These are *data*: they travel
//!   downstream as [`StreamItem::Error`](crate::tuple::StreamItem::Error) values so a
//!   sink or log consumer can record them without stopping the rule.
//! - **[`EngineError`]**: infrastructure and validation failures. A node that returns one
//!   stops pulling input and reports it on the topology's error channel.
//! - **[`StoreError`]**, **[`SourceError`]**, **[`SinkError`]**: collaborator failures that
//!   are converted into [`EngineError`] at the node boundary.
//!
//! ## Example
//!
//! ```rust
//! use ruleweave::error::{EngineError, EvalError};
//!
//! let eval = EvalError::new("invalid operation string > bigint");
//! assert_eq!(eval.to_string(), "invalid operation string > bigint");
//!
//! let fatal: EngineError = EngineError::Validation("Missing rule SQL.".to_string());
//! assert!(fatal.to_string().contains("Missing rule SQL."));
//! ```

use thiserror::Error;

/// An expression evaluation error carried through the data plane.
///
/// Evaluation errors are cheap to clone and serializable so they can be forwarded to
/// every consumer of a fan-out edge and written by sinks.
#[derive(Error, Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[error("{message}")]
pub struct EvalError {
  /// Human readable description.
  pub message: String,
}

impl EvalError {
  /// Creates a new evaluation error.
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
    }
  }

  /// Prefixes the message with the operator that produced it.
  pub fn context(self, op: &str) -> Self {
    Self {
      message: format!("run {} error: {}", op, self.message),
    }
  }
}

/// Error type for key/value and state persistence.
#[derive(Error, Debug)]
pub enum StoreError {
  /// I/O or filesystem error.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
  /// Serialization or deserialization failed.
  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
  /// The store was used before `open` or after `close`.
  #[error("store {0} has not been opened")]
  NotOpen(String),
  /// `set` was called for a key that already holds a value.
  #[error("Item {0} already exists")]
  AlreadyExists(String),
  /// `delete` was called for a key that holds no value.
  #[error("{0} is not found")]
  NotFound(String),
  /// A stored value did not have the expected shape.
  #[error("malformed value for key {key}: {reason}")]
  Malformed {
    /// Key that holds the malformed value.
    key: String,
    /// What was wrong.
    reason: String,
  },
}

/// Error reported by a [`Source`](crate::source::Source) implementation.
#[derive(Error, Debug, Clone)]
pub enum SourceError {
  /// The source rejected its configuration.
  #[error("invalid source configuration: {0}")]
  Config(String),
  /// The connection to the physical source failed or was lost.
  #[error("source connection error: {0}")]
  Connection(String),
  /// No source is registered for the requested type.
  #[error("unknown source type {0}")]
  UnknownType(String),
  /// Offset reporting or rewinding failed.
  #[error("source offset error: {0}")]
  Offset(String),
}

/// Error reported by a [`Sink`](crate::sink::Sink) implementation.
#[derive(Error, Debug, Clone)]
pub enum SinkError {
  /// The sink rejected its configuration.
  #[error("invalid sink configuration: {0}")]
  Config(String),
  /// Delivery to the external system failed.
  #[error("sink delivery error: {0}")]
  Delivery(String),
  /// No sink is registered for the requested type.
  #[error("unsupported action: {0}")]
  UnknownType(String),
}

/// Infrastructure and validation errors.
///
/// Anything of this type that escapes a node aborts that node and is surfaced on the
/// topology error channel.
#[derive(Error, Debug)]
pub enum EngineError {
  /// Rule, stream or option validation failed before a topology was built.
  #[error("{0}")]
  Validation(String),
  /// The SQL text could not be parsed by the configured parser.
  #[error("Parse SQL {sql} error: {reason}.")]
  Parse {
    /// The offending statement.
    sql: String,
    /// Parser message.
    reason: String,
  },
  /// A named definition (stream or rule) does not exist.
  #[error("{kind} {name} is not found.")]
  NotFound {
    /// "Stream" or "Rule".
    kind: &'static str,
    /// Name that was looked up.
    name: String,
  },
  /// Topology wiring or lifecycle error.
  #[error("topology error: {0}")]
  Topology(String),
  /// Source failure.
  #[error(transparent)]
  Source(#[from] SourceError),
  /// Sink failure.
  #[error(transparent)]
  Sink(#[from] SinkError),
  /// Persistence failure.
  #[error(transparent)]
  Store(#[from] StoreError),
  /// A task panicked or was aborted.
  #[error("task join error: {0}")]
  Join(String),
}

impl EngineError {
  /// Shorthand for a validation error.
  pub fn validation(message: impl Into<String>) -> Self {
    EngineError::Validation(message.into())
  }
}

impl From<tokio::task::JoinError> for EngineError {
  fn from(err: tokio::task::JoinError) -> Self {
    EngineError::Join(err.to_string())
  }
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
