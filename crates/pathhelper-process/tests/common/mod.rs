//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::time::Duration;

/// Upper bound for anything that is expected to finish promptly
pub const PROMPT: Duration = Duration::from_secs(10);

/// Route `tracing` output through the test harness
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}
