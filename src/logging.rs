//! Subscriber setup for hosts that do not install their own.
//!
//! The shim only emits `tracing` events. A host embedding it in a larger
//! program normally owns the subscriber; small hosts and tests can call
//! [`init`].

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LogConfig;

/// Overrides the configured level with a full filter directive,
/// e.g. `wasm_shim=debug,wasm_shim::stdout=off`.
pub const LOG_ENV: &str = "WASM_SHIM_LOG";

/// The filter `init` installs: `WASM_SHIM_LOG` if it parses, otherwise the
/// configured level.
pub fn filter(config: &LogConfig) -> EnvFilter {
  EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(config.level.as_str()))
}

/// Installs a formatting subscriber writing to stderr.
///
/// Returns `false` when a global subscriber was already set.
pub fn init(config: &LogConfig) -> bool {
  tracing_subscriber::registry()
    .with(filter(config))
    .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
    .try_init()
    .is_ok()
}
