// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Logging bootstrap.
//!
//! Filters come from the `EMBER_LOG` environment variable (comma-separated
//! `target=level` directives, same grammar as `RUST_LOG`); the default level
//! is `info`. Safe to call more than once; only the first call installs the
//! subscriber.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// ENV used to set the log filter.
const FILTER_ENV: &str = "EMBER_LOG";

/// Default log level.
const DEFAULT_FILTER_LEVEL: &str = "info";

static INIT: Once = Once::new();

pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env(FILTER_ENV)
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER_LEVEL));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();
    });
}
