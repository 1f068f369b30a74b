//! Operational metrics for running rules.
//!
//! Counters and gauges are recorded through the [`metrics`] facade. Without an installed
//! recorder every call is a no-op, so embedding applications decide where the numbers go.
//!
//! - **Throughput:** [`record_records_in`] / [`record_records_out`] feed
//!   `ruleweave_records_in_total` and `ruleweave_records_out_total`.
//! - **Failures:** [`record_node_error`] feeds `ruleweave_errors_total`, covering both
//!   evaluation errors and fatal node errors.
//! - **Lateness:** [`record_late_drop`] feeds `ruleweave_late_drops_total` when an
//!   event-time window discards a tuple whose window can no longer be updated.
//! - **Sink backlog:** [`record_cache_pending`] sets the `ruleweave_cache_pending` gauge to
//!   the number of undelivered entries in a sink cache.
//!
//! Every series is labelled with `rule_id` and `op_id`.

use metrics::{counter, gauge};

/// Records an error raised or forwarded by a node.
pub fn record_node_error(rule_id: &str, op_id: &str) {
  counter!(
    "ruleweave_errors_total",
    "rule_id" => rule_id.to_string(),
    "op_id" => op_id.to_string()
  )
  .increment(1);
}

/// Records items received by a node.
pub fn record_records_in(rule_id: &str, op_id: &str, count: u64) {
  counter!(
    "ruleweave_records_in_total",
    "rule_id" => rule_id.to_string(),
    "op_id" => op_id.to_string()
  )
  .increment(count);
}

/// Records items emitted by a node.
pub fn record_records_out(rule_id: &str, op_id: &str, count: u64) {
  counter!(
    "ruleweave_records_out_total",
    "rule_id" => rule_id.to_string(),
    "op_id" => op_id.to_string()
  )
  .increment(count);
}

/// Records a tuple dropped because it arrived too late for its window.
pub fn record_late_drop(rule_id: &str, op_id: &str) {
  counter!(
    "ruleweave_late_drops_total",
    "rule_id" => rule_id.to_string(),
    "op_id" => op_id.to_string()
  )
  .increment(1);
}

/// Sets the number of pending entries in a sink cache.
pub fn record_cache_pending(rule_id: &str, op_id: &str, size: usize) {
  gauge!(
    "ruleweave_cache_pending",
    "rule_id" => rule_id.to_string(),
    "op_id" => op_id.to_string()
  )
  .set(size as f64);
}
