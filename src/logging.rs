//! Tracing subscriber setup for embedding applications and tests.

use tracing_subscriber::EnvFilter;

/// Installs a formatting subscriber.
///
/// `RUST_LOG` takes precedence; otherwise the crate logs at `debug` when `debug` is set
/// and at `info` when it is not. Calling this more than once is harmless: later calls
/// leave the first subscriber in place.
///
/// # Arguments
///
/// * `debug` - Enables per-tuple debug logging.
///
/// # Returns
///
/// `true` if this call installed the subscriber.
pub fn init_tracing(debug: bool) -> bool {
  let default = if debug { "ruleweave=debug" } else { "ruleweave=info" };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_target(true)
    .try_init()
    .is_ok()
}
