//! Engine, rule and sink configuration.
//!
//! All configuration structs deserialize with serde and provide `Default` plus `with_*`
//! builders. Loading configuration files is left to the embedding application; these
//! types only define shapes, defaults and validation.

use crate::error::{EngineError, EngineResult, SinkError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Engine-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  /// Root directory for key/value stores, rule state and sink caches.
  pub data_dir: PathBuf,
  /// Default capacity of every edge queue and source consumer queue.
  pub buffer_length: usize,
  /// Enables per-tuple debug logging.
  pub debug: bool,
  /// Options applied to rules that do not set them.
  pub rule: RuleOptions,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      data_dir: PathBuf::from("data"),
      buffer_length: 1024,
      debug: false,
      rule: RuleOptions::default(),
    }
  }
}

impl EngineConfig {
  /// Sets the data directory.
  pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
    self.data_dir = dir.into();
    self
  }

  /// Sets the default buffer length.
  pub fn with_buffer_length(mut self, n: usize) -> Self {
    self.buffer_length = n.max(1);
    self
  }

  /// Sets debug logging.
  pub fn with_debug(mut self, debug: bool) -> Self {
    self.debug = debug;
    self
  }

  /// Sets default rule options.
  pub fn with_rule_options(mut self, options: RuleOptions) -> Self {
    self.rule = options;
    self
  }
}

/// Per-rule options, from the `options` object of a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuleOptions {
  /// Use tuple timestamps instead of arrival time for windows.
  pub is_event_time: bool,
  /// Allowed lateness, in milliseconds, for event-time windows.
  pub late_tolerance: i64,
  /// Parallel instances of stateless operators.
  pub concurrency: usize,
  /// Capacity of every edge queue of the rule.
  pub buffer_length: usize,
  /// Forward source metadata to sinks alongside results.
  pub send_meta_to_sink: bool,
  /// Cancel the whole rule on the first fatal node error.
  pub cancel_on_error: bool,
}

impl Default for RuleOptions {
  fn default() -> Self {
    Self {
      is_event_time: false,
      late_tolerance: 0,
      concurrency: 1,
      buffer_length: 1024,
      send_meta_to_sink: false,
      cancel_on_error: true,
    }
  }
}

impl RuleOptions {
  /// Sets event-time processing.
  pub fn with_event_time(mut self, on: bool) -> Self {
    self.is_event_time = on;
    self
  }

  /// Sets the late tolerance in milliseconds.
  pub fn with_late_tolerance(mut self, ms: i64) -> Self {
    self.late_tolerance = ms;
    self
  }

  /// Sets operator concurrency.
  pub fn with_concurrency(mut self, n: usize) -> Self {
    self.concurrency = n.max(1);
    self
  }

  /// Sets the edge buffer length.
  pub fn with_buffer_length(mut self, n: usize) -> Self {
    self.buffer_length = n.max(1);
    self
  }

  /// Sets whether the rule cancels itself on the first fatal error.
  pub fn with_cancel_on_error(mut self, on: bool) -> Self {
    self.cancel_on_error = on;
    self
  }

  /// Reads options from a rule's `options` object on top of `defaults`.
  ///
  /// Unknown keys are ignored. A known key with a value of the wrong type is a
  /// validation error naming the key and the required type.
  pub fn from_json(
    defaults: &RuleOptions,
    options: &serde_json::Map<String, serde_json::Value>,
  ) -> EngineResult<Self> {
    let mut o = defaults.clone();
    for (key, v) in options {
      match key.as_str() {
        "isEventTime" => o.is_event_time = bool_option(key, v)?,
        "lateTolerance" => o.late_tolerance = int_option(key, v)?,
        "concurrency" => o.concurrency = int_option(key, v)?.max(1) as usize,
        "bufferLength" => o.buffer_length = int_option(key, v)?.max(1) as usize,
        "sendMetaToSink" => o.send_meta_to_sink = bool_option(key, v)?,
        "cancelOnError" => o.cancel_on_error = bool_option(key, v)?,
        _ => {}
      }
    }
    Ok(o)
  }
}

fn bool_option(key: &str, v: &serde_json::Value) -> EngineResult<bool> {
  v.as_bool().ok_or_else(|| {
    EngineError::validation(format!(
      "Invalid rule option {} {}, bool type is required.",
      key, v
    ))
  })
}

fn int_option(key: &str, v: &serde_json::Value) -> EngineResult<i64> {
  v.as_i64()
    .or_else(|| v.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
    .ok_or_else(|| {
      EngineError::validation(format!(
        "Invalid rule option {} {}, int type is required.",
        key, v
      ))
    })
}

/// Common sink node settings, read from an action's property object.
///
/// Sink specific keys in the same object are ignored here and passed to the sink's
/// `configure`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SinkConf {
  /// Parallel delivery workers.
  pub concurrency: usize,
  /// Delay between delivery attempts, in milliseconds.
  pub retry_interval: u64,
  /// Extra attempts after the first failed delivery.
  pub retry_count: u32,
  /// Capacity of the cache's delivery queue.
  pub cache_length: usize,
  /// Interval between cache save ticks, in milliseconds.
  pub cache_save_interval: u64,
  /// Back the sink with a durable cache.
  pub enable_cache: bool,
  /// Skip empty result batches.
  pub omit_if_empty: bool,
  /// Deliver each record of a batch separately.
  pub send_single: bool,
}

impl Default for SinkConf {
  fn default() -> Self {
    Self {
      concurrency: 1,
      retry_interval: 1000,
      retry_count: 3,
      cache_length: 1024,
      cache_save_interval: 1000,
      enable_cache: false,
      omit_if_empty: false,
      send_single: false,
    }
  }
}

impl SinkConf {
  /// Parses the common settings out of an action's properties.
  pub fn from_props(props: &serde_json::Value) -> Result<Self, SinkError> {
    if props.is_null() {
      return Ok(Self::default());
    }
    let conf: SinkConf =
      serde_json::from_value(props.clone()).map_err(|e| SinkError::Config(e.to_string()))?;
    if conf.cache_length == 0 {
      return Err(SinkError::Config("cacheLength must be positive".to_string()));
    }
    if conf.cache_save_interval == 0 {
      return Err(SinkError::Config(
        "cacheSaveInterval must be positive".to_string(),
      ));
    }
    Ok(Self {
      concurrency: conf.concurrency.max(1),
      ..conf
    })
  }

  /// Retry interval as a duration.
  pub fn retry_interval(&self) -> Duration {
    Duration::from_millis(self.retry_interval)
  }

  /// Save tick as a duration.
  pub fn cache_save_interval(&self) -> Duration {
    Duration::from_millis(self.cache_save_interval)
  }

  /// Enables the durable cache.
  pub fn with_cache(mut self, enabled: bool) -> Self {
    self.enable_cache = enabled;
    self
  }

  /// Sets retry behaviour.
  pub fn with_retry(mut self, count: u32, interval_ms: u64) -> Self {
    self.retry_count = count;
    self.retry_interval = interval_ms;
    self
  }

  /// Sets the cache queue capacity and save interval.
  pub fn with_cache_limits(mut self, length: usize, save_interval_ms: u64) -> Self {
    self.cache_length = length.max(1);
    self.cache_save_interval = save_interval_ms.max(1);
    self
  }
}
