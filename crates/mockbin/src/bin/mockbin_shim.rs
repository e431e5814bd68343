// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The relay executable published for every compiled mock. All behavior
//! lives in `mockbin-shim`; this target exists so `cargo` keeps a stampable
//! binary next to the library's own test artifacts.

fn main() {
    std::process::exit(mockbin_shim::run());
}
