//! Tracing subscriber setup
//!
//! Library code only emits `tracing` events under the `smelter` target.
//! Embedders that do not install their own subscriber can call [`init`].

use tracing_subscriber::EnvFilter;

/// Environment variable overriding the configured level, e.g. `SMELTER_LOG=smelter=trace`
pub const LOG_ENV: &str = "SMELTER_LOG";

/// Install a global fmt subscriber.
///
/// Does nothing if a global subscriber is already set.
pub fn init(level: &str) {
  let filter = EnvFilter::try_from_env(LOG_ENV)
    .unwrap_or_else(|_| EnvFilter::new(format!("smelter={}", level)));

  let _ = tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_target(true)
    .try_init();
}
