// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Shared setup for the end-to-end scenarios.

use std::sync::Once;

/// Initialize tracing once per test binary; `RUST_LOG=mockbin=debug` shows
/// the whole conversation between server, shims and dispatcher.
pub fn init_tracing() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
