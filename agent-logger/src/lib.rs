//! Common logger configuration for the agent's binaries.

use tracing_subscriber::{
    layer::{Layer, SubscriberExt},
    util::{SubscriberInitExt, TryInitError},
    EnvFilter,
};

/// Initialize a global `tracing` logger.
///
/// + Prints enabled `tracing` events and spans to stdout.
/// + Defaults to INFO, WARN, and ERROR events.
/// + Override the level or do per-module filtering with `RUST_LOG`. See
///   <https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/struct.EnvFilter.html>
///
/// Panics if a logger is already initialized.
pub fn init() {
    try_init().expect("failed to set up logger");
}

/// Initializes the global logger in tests. Skips setup (and any panic on a
/// second call) if `RUST_LOG` is unset.
pub fn init_for_testing() {
    if std::env::var_os("RUST_LOG").is_none() {
        return;
    }
    let _ = try_init();
}

/// Tries to initialize a global logger, returning `Err` if one is already set.
pub fn try_init() -> Result<(), TryInitError> {
    let rust_log_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stdout_log = tracing_subscriber::fmt::layer()
        .compact()
        .with_level(true)
        .with_target(true)
        .with_ansi(true)
        .with_filter(rust_log_filter);

    tracing_subscriber::registry().with(stdout_log).try_init()
}
