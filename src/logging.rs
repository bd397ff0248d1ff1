// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Log subscriber setup.

use tracing::Level;

/// Installs a `tracing` fmt subscriber at `level` (`error`, `warn`, `info`,
/// `debug` or `trace`; anything else means `info`).
///
/// Uses `try_init`, so calling it again (tests, embedding applications that
/// already installed a subscriber) is a no-op.
pub fn init(level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(max_level(level))
        .with_target(false)
        .try_init();
}

fn max_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "error" => Level::ERROR,
        "warn" | "warning" => Level::WARN,
        "debug" => Level::DEBUG,
        "trace" => Level::TRACE,
        _ => Level::INFO,
    }
}
