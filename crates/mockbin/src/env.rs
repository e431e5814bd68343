// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Environment assertions for invocations.
//!
//! Entries have the `KEY=VALUE` shape of a process environment; keys compare
//! case-insensitively, values exactly. The usual entry point is
//! [`expect_env`] inside a `before` middleware, so the test fails the call
//! immediately when the system under test forgot to export something.

use thiserror::Error;

/// Outcome of matching selected environment entries.
#[derive(Debug, Clone, Default)]
pub struct EnvMatchResult {
    pub is_match: bool,
    pub match_count: usize,
    pub explanation: String,
}

/// Case-insensitive environment lookup over `KEY=VALUE` entries.
pub fn get_env<'a>(key: &str, environ: &'a [String]) -> Option<&'a str> {
    environ.iter().find_map(|entry| {
        let (entry_key, value) = entry.split_once('=')?;
        entry_key.eq_ignore_ascii_case(key).then_some(value)
    })
}

/// Assert that every `required` entry is present with the exact value.
///
/// The result keeps counting after a miss so `match_count` reflects how many
/// entries were satisfied; `explanation` describes the last failure.
pub fn match_env(environ: &[String], required: &[String]) -> EnvMatchResult {
    let mut result = EnvMatchResult::default();
    for entry in required {
        let Some((key, want)) = entry.split_once('=') else {
            result.explanation = format!("Expected env entry {entry:?} to have the form KEY=VALUE");
            continue;
        };
        match get_env(key, environ) {
            None => {
                result.explanation =
                    format!("Expected env {entry}, {key} wasn't set in environment");
            }
            Some(actual) if actual != want => {
                result.explanation = format!("Expected env {entry}, got {actual:?}");
            }
            Some(_) => result.match_count += 1,
        }
    }
    result.is_match = result.match_count == required.len();
    result
}

/// A failed [`expect_env`] assertion.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct EnvMismatch(String);

/// `before`-middleware form of [`match_env`]: fails on the first entry that
/// is missing or carries the wrong value.
pub fn expect_env<S: AsRef<str>>(environ: &[String], required: &[S]) -> Result<(), EnvMismatch> {
    for entry in required {
        let entry = entry.as_ref();
        let Some((key, want)) = entry.split_once('=') else {
            return Err(EnvMismatch(format!(
                "Expected env entry {entry:?} to have the form KEY=VALUE"
            )));
        };
        match get_env(key, environ) {
            None => {
                return Err(EnvMismatch(format!(
                    "Expected env {entry}, {key} wasn't set in environment"
                )))
            }
            Some(actual) if actual != want => {
                return Err(EnvMismatch(format!("Expected env {entry}, got {actual:?}")))
            }
            Some(_) => {}
        }
    }
    Ok(())
}
