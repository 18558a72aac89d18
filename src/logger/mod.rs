// Structured, tag-scoped logging with an in-memory ring and optional mirror.

pub mod log;
pub mod logger;

#[cfg(test)]
mod logger_test;

pub use log::{Log, LogLevel};
pub use logger::Logger;

/// Installs the global tracing subscriber every [`Logger`] emits through.
/// JSON output for production, pretty console output otherwise. Call once
/// at startup; later calls are ignored.
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let result = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().pretty())
            .try_init()
    };
    // A subscriber may already be installed (tests, embedding binaries).
    let _ = result;
}
