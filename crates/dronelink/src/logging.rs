//! Tracing subscriber setup.
//!
//! Levels used across the workspace:
//! - INFO: lifecycle transitions (open, established, setup finished, close)
//! - WARN/ERROR: link failures, failed handlers, retries given up
//! - DEBUG: retry bookkeeping, resolver decisions
//! - TRACE: per-packet flow

use tracing_subscriber::EnvFilter;

/// Installs a fmt subscriber filtered by `RUST_LOG`, defaulting to `info`.
///
/// Does nothing if a global subscriber is already set.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Like [`init_tracing`] but defaults to `debug` and writes through the
/// test harness so output is captured per test.
pub fn init_tracing_for_tests() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
