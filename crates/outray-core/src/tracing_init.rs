//! Tracing/logging initialisation for the `outray` binary.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{Error, Result};

/// Crates whose spans and events are shown at the configured level.
const LOG_TARGETS: &[&str] = &["outray", "outray_client", "outray_core"];

/// Build an env-filter directive enabling `level` for the outray crates
/// only, e.g. `"outray=debug,outray_client=debug,outray_core=debug"`.
pub fn default_filter(level: &str) -> String {
    LOG_TARGETS
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Install the global tracing subscriber.
///
/// * `default_filter` -- used when `RUST_LOG` is not set.
/// * `log_json` -- emit structured JSON lines instead of the human-readable
///   format.
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(default_filter: &str, log_json: bool) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(default_filter))
        .map_err(|e| Error::Config(format!("Invalid log filter '{default_filter}': {e}")))?;
    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()
    };
    result.map_err(|e| Error::Config(format!("Failed to install tracing subscriber: {e}")))
}
