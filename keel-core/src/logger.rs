//! Common logger configuration for keel binaries and tests.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{
    filter::Targets,
    layer::{Layer, SubscriberExt},
    util::{SubscriberInitExt, TryInitError},
};

/// Initialize a global `tracing` logger.
///
/// + Prints enabled `tracing` events and spans to stdout.
/// + The default log level includes INFO, WARN, and ERROR events.
/// + Module filtering follows the usual `RUST_LOG` syntax.
///
/// Panics if a logger is already initialized.
pub fn init() {
    try_init().expect("Failed to setup logger");
}

/// Use this to initialize the global logger in tests. Does nothing unless
/// `RUST_LOG` is set, and never panics when multiple tests race to install
/// the logger.
pub fn init_for_testing() {
    if std::env::var_os("RUST_LOG").is_none() {
        return;
    }

    let _ = try_init();
}

/// Try to initialize a global logger. Returns an `Err` if another global
/// logger is already set.
pub fn try_init() -> Result<(), TryInitError> {
    let rust_log_filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|rust_log| Targets::from_str(&rust_log).ok())
        .unwrap_or_else(|| Targets::new().with_default(Level::INFO));

    let stdout_log = tracing_subscriber::fmt::layer()
        .compact()
        .with_level(true)
        .with_target(true)
        .with_filter(rust_log_filter);

    tracing_subscriber::registry().with(stdout_log).try_init()
}
