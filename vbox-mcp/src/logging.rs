//! Structured logging setup.
//!
//! The transport is stdout; logs always go to stderr so a line-delimited
//! JSON harness reading stdout never sees log noise interleaved with tool
//! results.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::LogLevel;

/// Install the global tracing subscriber for the given level.
///
/// Idempotent in the sense that a failed re-init (subscriber already set)
/// is silently ignored — useful when called from both `main` and tests.
pub fn init(level: LogLevel) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_filter_str()));

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .with_ansi(false),
        )
        .try_init();
}
