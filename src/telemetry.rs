//! Logging setup
//!
//! Plain tracing output to stderr. Filter with `RUST_LOG`, e.g.
//! `RUST_LOG=koe=debug` to see every polling sweep.
//!
//! # Example
//!
//! ```no_run
//! use koe::telemetry::init_logging;
//!
//! init_logging();
//! ```

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Initialize logging with tracing-subscriber
///
/// Uses RUST_LOG env var for filtering (default: info).
/// Safe to call more than once; later calls do nothing.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_ignored() {
        init_logging();
        init_logging();
        tracing::info!(suite = "telemetry", "Logging still works after repeated init");
    }
}
