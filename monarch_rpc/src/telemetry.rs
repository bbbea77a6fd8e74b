/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Logging setup.

use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::config;

/// Install a formatting subscriber for the process. The filter is read from
/// `MONARCH_RPC_LOG`, falling back to the global configuration's
/// `log_level`. Does nothing if a global subscriber is already set.
pub fn initialize_logging() {
    let filter = EnvFilter::try_from_env(config::LOG_ENV)
        .or_else(|_| EnvFilter::try_new(config::global::get().log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// Set up a tracing subscriber that prints logs with at least `level`. Meant
/// for tests; repeated calls after the first are ignored.
pub fn set_tracing_env_filter(level: Level) {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level.as_str()))
        .with_test_writer()
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
