// Copyright 2024 Cosmian Tech SAS
// Licensed under the Business Source License version 1.1.

use std::sync::Once;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

static LOG_INIT: Once = Once::new();

/// Install the process-wide tracing subscriber.
///
/// The filter is read from `RUST_LOG`; when the variable is unset or cannot be
/// parsed, `default_value` (e.g. `"info,cosmian_soft_token=debug"`) is used.
/// Subsequent calls are no-ops, as is a call made after another subscriber
/// was installed by the host application.
pub fn log_init(default_value: &str) {
    LOG_INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(default_value))
            .unwrap_or_else(|_| {
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .parse_lossy("")
            });

        let format = tracing_subscriber::fmt::layer()
            .with_level(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(true)
            .with_file(true)
            .compact();

        // another subscriber may already be set: not an error for a library
        _ = tracing_subscriber::registry()
            .with(filter)
            .with(format)
            .try_init();
    });
}
