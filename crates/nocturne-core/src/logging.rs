//! Logging initialisation.
//!
//! The engine logs through `tracing`. Nothing is printed until a subscriber
//! is installed, either by the application or with one of these helpers.
//!
//! The level is read from `RUST_LOG` and defaults to `info`:
//!
//! ```bash
//! RUST_LOG=nocturne_core=debug cargo run --example echo
//! ```
//!
//! Each helper can be called more than once; only the first installed
//! subscriber wins.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialise logging with a compact formatter and `info` default.
pub fn init_logging() {
    init_logging_with_level("info");
}

/// Initialise logging with `level` as the default when `RUST_LOG` is unset.
///
/// ```rust,no_run
/// nocturne_core::logging::init_logging_with_level("debug");
/// ```
pub fn init_logging_with_level(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .try_init();
}

/// Initialise logging with JSON output, for log aggregation.
pub fn init_logging_json() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .try_init();
}
