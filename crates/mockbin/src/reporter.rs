// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The narrow capability `check` reports through.
//!
//! Two operations keep the core independent of any host test framework:
//! `log` for per-expectation diagnostics, `error` to record a failure.

/// Reporting capability consumed by `Mock::check`.
pub trait Reporter {
    /// Informational diagnostic.
    fn log(&mut self, message: String);
    /// Record a failure.
    fn error(&mut self, message: String);
}

/// Buffers logs and errors so a test can assert on them, or replay them into
/// a real reporter afterwards.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    pub logs: Vec<String>,
    pub errors: Vec<String>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no failure was recorded.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// Dump everything collected into another reporter.
    pub fn replay_into(&self, dest: &mut dyn Reporter) {
        for line in &self.logs {
            dest.log(line.clone());
        }
        for line in &self.errors {
            dest.error(line.clone());
        }
    }
}

impl Reporter for RecordingReporter {
    fn log(&mut self, message: String) {
        self.logs.push(message);
    }

    fn error(&mut self, message: String) {
        self.errors.push(message);
    }
}

/// Forwards check output to `tracing`.
#[derive(Debug, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn log(&mut self, message: String) {
        tracing::info!(target: "mockbin::check", "{message}");
    }

    fn error(&mut self, message: String) {
        tracing::error!(target: "mockbin::check", "{message}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_reporter_replays() {
        let mut source = RecordingReporter::new();
        source.log("one".into());
        source.error("two".into());
        assert!(!source.is_clean());

        let mut dest = RecordingReporter::new();
        source.replay_into(&mut dest);
        assert_eq!(dest.logs, vec!["one"]);
        assert_eq!(dest.errors, vec!["two"]);
    }
}
