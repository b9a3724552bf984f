//! Tracing setup for binaries and tests embedding the engine.
//!
//! The filter comes from `RUST_LOG` when set, otherwise
//! [`DEFAULT_FILTER`]. Engine threads are named (`cpe-feeder`,
//! `cpe-worker-N`, `cpe-dispatcher`, `cpe-checkpoint`) and the formatter
//! prints thread names, so interleaved output stays readable.

use crate::error::{CpeError, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const DEFAULT_FILTER: &str = "info,cpe_rs=debug";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install a stderr subscriber. Returns `false` if one was already set.
pub fn init() -> bool {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_thread_names(true),
        )
        .try_init()
        .is_ok()
}

/// Install a subscriber writing to stderr and to a daily-rolled file in
/// `dir`. Keep the returned guard alive; dropping it flushes the file.
pub fn init_with_file(dir: impl AsRef<Path>, prefix: &str) -> Result<WorkerGuard> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;
    let appender = tracing_appender::rolling::daily(dir, prefix);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_thread_names(true),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_thread_names(true),
        )
        .try_init()
        .map_err(|e| CpeError::Config(format!("Failed to install log subscriber: {}", e)))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_init_is_idempotent() {
        init();
        assert!(!init());
    }

    #[test]
    #[serial]
    fn test_file_logging_after_init_fails_cleanly() {
        init();
        let dir = tempfile::tempdir().unwrap();
        let result = init_with_file(dir.path(), "cpe.log");
        assert!(matches!(result, Err(CpeError::Config(_))));
    }
}
