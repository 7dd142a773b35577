//! Logging setup.

use crate::ports::config_port::ConfigPort;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Install the global subscriber. `RUST_LOG` wins over `level`; output goes
/// to stderr so command output on stdout stays clean. A second call is a
/// no-op.
pub fn setup_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let result = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
    };
    if result.is_err() {
        tracing::debug!("logging already initialised");
    }
}

/// Logging from the `[log]` section: `level` (default `info`) and `json`.
pub fn setup_from_config(config: &dyn ConfigPort) {
    let level = config
        .get_string("log", "level")
        .unwrap_or_else(|| "info".to_string());
    setup_logging(&level, config.get_bool("log", "json", false));
}
