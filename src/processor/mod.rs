//! # Processors
//!
//! The management surface of the engine:
//!
//! - [`StreamProcessor`]: stream definitions;
//! - [`RuleProcessor`]: rule definitions;
//! - [`RuleRegistry`]: running rules and ad-hoc queries.
//!
//! Successful operations return short confirmations such as `Rule r1 was started.`;
//! failures are [`EngineError`](crate::error::EngineError)s whose messages are meant for
//! users.

pub mod registry;
pub mod rule;
pub mod stream;

#[cfg(test)]
mod processor_test;

pub use registry::{QueryHandle, RuleRegistry, RuleStatus};
pub use rule::{RuleProcessor, parse_rule};
pub use stream::StreamProcessor;
