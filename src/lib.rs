//! # ruleweave
//!
//! A streaming SQL rule engine on tokio.
//!
//! A *rule* is a select statement plus a list of actions. The engine plans each rule into
//! a topology of nodes connected by bounded queues: sources pulled from a shared pool,
//! a preprocessor per stream, then window, join, filter, aggregate, having, order and
//! project stages, and one sink per action.
//!
//! ## Key Features
//!
//! - **Shared sources**: rules reading the same shared stream share one connection, with
//!   reference counting and exactly-once teardown
//! - **Windows**: tumbling, hopping, sliding and count windows in processing or event
//!   time, with watermarks and late tolerance
//! - **Durable sinks**: a persistent sink cache replays undelivered batches after restart
//! - **Backpressure**: every edge is a bounded queue; nothing is dropped when a consumer
//!   is slow
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ruleweave::ast::PreparedStatements;
//! use ruleweave::config::EngineConfig;
//! use ruleweave::planner::EngineContext;
//! use ruleweave::processor::RuleRegistry;
//! use std::sync::Arc;
//!
//! # async fn demo() -> ruleweave::error::EngineResult<()> {
//! let ctx = EngineContext::new(EngineConfig::default(), Arc::new(PreparedStatements::new()));
//! let registry = RuleRegistry::open(ctx)?;
//! registry.rules().create_rule(
//!   "rule1",
//!   r#"{"sql": "SELECT * FROM demo WHERE count > 49", "actions": [{"log": {}}]}"#,
//! )?;
//! println!("{}", registry.start_rule("rule1").await?);
//! # Ok(())
//! # }
//! ```

// Documentation enforcement - treat missing docs as errors
#![deny(missing_docs)]

/// Statement trees, stream definitions and the SQL parser seam.
pub mod ast;
/// Injected time source.
pub mod clock;
/// Engine, rule and sink configuration.
pub mod config;
/// Error types.
pub mod error;
/// Expression evaluation.
pub mod expr;
/// Scalar and aggregate functions.
pub mod function;
/// Tracing subscriber setup.
pub mod logging;
/// Metrics for records, errors, late drops and sink caches.
pub mod metrics;
/// Pure pipeline operators and the window state machine.
pub mod operators;
/// Rule planning.
pub mod planner;
/// Stream and rule management and the rule registry.
pub mod processor;
/// Sinks and the sink cache.
pub mod sink;
/// Sources and the source instance pool.
pub mod source;
/// Key/value storage and operator state.
pub mod store;
/// Topology runtime.
pub mod topo;
/// Tuples and stream items.
pub mod tuple;
/// The tagged value model.
pub mod value;

#[cfg(test)]
mod expr_test;
#[cfg(test)]
mod function_test;
#[cfg(test)]
mod value_test;
