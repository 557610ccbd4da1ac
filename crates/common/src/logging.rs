//! Logging utilities for the gateway crates.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize tracing with an explicit default level.
///
/// RUST_LOG still takes precedence when set. Repeated initialization is
/// ignored so tests and embedding hosts can call this freely.
pub fn init_with_level(default_level: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let result = if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .try_init()
    };

    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}
