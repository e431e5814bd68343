// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Declared expectations: argument pattern, call-count bounds, reaction.
//!
//! An [`Expectation`] is a cheap clonable handle; the fluent builders mutate
//! shared state, so `mock.expect(["push"]).once().and_exit_with(0)` and the
//! copy the mock keeps are the same object. Reactions are a tagged variant
//! rather than a pile of fields: bytes-and-exit merge together, while a
//! handler or passthrough replaces whatever was configured before it.

use crate::args::{Arguments, ArgumentsMatchResult, Matcher};
use crate::call::Call;
use crate::reporter::Reporter;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// Call-count bound: a fixed number or the "unbounded" sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Count {
    Fixed(usize),
    Unbounded,
}

/// The "any number of calls" sentinel for [`Expectation::min`] and
/// [`Expectation::max`].
pub const UNBOUNDED: Count = Count::Unbounded;

impl Count {
    fn allows_more(self, total: usize) -> bool {
        match self {
            Count::Unbounded => true,
            Count::Fixed(max) => total < max,
        }
    }
}

impl From<usize> for Count {
    fn from(n: usize) -> Self {
        Count::Fixed(n)
    }
}

pub(crate) type CallFn = Arc<dyn Fn(&Call) + Send + Sync>;

/// What happens when an expectation matches a call.
#[derive(Clone)]
pub(crate) enum Reaction {
    Respond {
        exit_code: i32,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },
    CallFunc(CallFn),
    Passthrough {
        path: PathBuf,
        timeout: Option<Duration>,
    },
}

impl Default for Reaction {
    fn default() -> Self {
        Reaction::Respond {
            exit_code: 0,
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }
}

struct ExpectationState {
    arguments: Arguments,
    stdin: Option<Matcher>,
    reaction: Reaction,
    min_calls: Count,
    max_calls: Count,
    total_calls: usize,
    read_stdin: Vec<u8>,
}

struct ExpectationInner {
    name: String,
    sequence: usize,
    state: RwLock<ExpectationState>,
}

/// A declared expectation, shared between the mock and the test.
#[derive(Clone)]
pub struct Expectation {
    inner: Arc<ExpectationInner>,
}

impl Expectation {
    pub(crate) fn new(name: String, sequence: usize, arguments: Arguments) -> Self {
        Expectation {
            inner: Arc::new(ExpectationInner {
                name,
                sequence,
                state: RwLock::new(ExpectationState {
                    arguments,
                    stdin: None,
                    reaction: Reaction::default(),
                    min_calls: Count::Fixed(1),
                    max_calls: Count::Fixed(1),
                    total_calls: 0,
                    read_stdin: Vec::new(),
                }),
            }),
        }
    }

    fn write(&self, f: impl FnOnce(&mut ExpectationState)) -> &Self {
        let mut state = self
            .inner
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut state);
        self
    }

    fn read<T>(&self, f: impl FnOnce(&ExpectationState) -> T) -> T {
        let state = self
            .inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        f(&state)
    }

    /// Declaration position within the mock, for reporting order.
    pub fn sequence(&self) -> usize {
        self.inner.sequence
    }

    // Call-count builders.

    /// Expect exactly `n` calls.
    pub fn times(&self, n: usize) -> &Self {
        self.min(n).max(n)
    }

    /// Alias of [`Expectation::times`].
    pub fn exactly(&self, n: usize) -> &Self {
        self.times(n)
    }

    /// Lower bound; `UNBOUNDED` normalizes to zero.
    pub fn min(&self, n: impl Into<Count>) -> &Self {
        let n = match n.into() {
            Count::Unbounded => Count::Fixed(0),
            fixed => fixed,
        };
        self.write(|state| state.min_calls = n)
    }

    /// Upper bound; `UNBOUNDED` lifts the bound entirely.
    pub fn max(&self, n: impl Into<Count>) -> &Self {
        let n = n.into();
        self.write(|state| state.max_calls = n)
    }

    pub fn once(&self) -> &Self {
        self.times(1)
    }

    pub fn not_called(&self) -> &Self {
        self.times(0)
    }

    /// Zero or one call — the call is allowed but not required.
    pub fn optionally(&self) -> &Self {
        self.min(0usize)
    }

    pub fn at_least_once(&self) -> &Self {
        self.min(1usize).max(UNBOUNDED)
    }

    // Pattern builders.

    /// Accept any argument vector.
    pub fn with_any_arguments(&self) -> &Self {
        self.write(|state| state.arguments = Arguments::any())
    }

    /// Replace positional matching with a single holistic predicate over the
    /// whole vector (argv[0] excluded).
    pub fn with_matcher_func(
        &self,
        f: impl Fn(&[String]) -> ArgumentsMatchResult + Send + Sync + 'static,
    ) -> &Self {
        self.write(move |state| {
            state.arguments = std::mem::take(&mut state.arguments)
                .with_holistic("<matcher func>", f);
        })
    }

    /// Require stdin matching `matcher`; the dispatcher drains and captures
    /// the bytes, and `check` validates them.
    pub fn with_stdin(&self, matcher: impl Into<Matcher>) -> &Self {
        let matcher = matcher.into();
        self.write(move |state| state.stdin = Some(matcher))
    }

    // Reaction builders.

    /// Exit with `code` after any configured stdout/stderr bytes.
    pub fn and_exit_with(&self, code: i32) -> &Self {
        self.write(|state| match &mut state.reaction {
            Reaction::Respond { exit_code, .. } => *exit_code = code,
            other => {
                *other = Reaction::Respond {
                    exit_code: code,
                    stdout: Vec::new(),
                    stderr: Vec::new(),
                }
            }
        })
    }

    /// Write `bytes` to the child's stdout before exiting.
    pub fn and_write_to_stdout(&self, bytes: impl AsRef<[u8]>) -> &Self {
        let bytes = bytes.as_ref().to_vec();
        self.write(move |state| match &mut state.reaction {
            Reaction::Respond { stdout, .. } => stdout.extend_from_slice(&bytes),
            other => {
                *other = Reaction::Respond {
                    exit_code: 0,
                    stdout: bytes,
                    stderr: Vec::new(),
                }
            }
        })
    }

    /// Write `bytes` to the child's stderr before exiting.
    pub fn and_write_to_stderr(&self, bytes: impl AsRef<[u8]>) -> &Self {
        let bytes = bytes.as_ref().to_vec();
        self.write(move |state| match &mut state.reaction {
            Reaction::Respond { stderr, .. } => stderr.extend_from_slice(&bytes),
            other => {
                *other = Reaction::Respond {
                    exit_code: 0,
                    stdout: Vec::new(),
                    stderr: bytes,
                }
            }
        })
    }

    /// Run `f` for each matching call. The handler owns the call's fate and
    /// must finish it with [`Call::exit`] (or a passthrough).
    pub fn and_call_func(&self, f: impl Fn(&Call) + Send + Sync + 'static) -> &Self {
        self.write(|state| state.reaction = Reaction::CallFunc(Arc::new(f)))
    }

    /// Forward matching calls to the real command at `path`, using the
    /// mock's default timeout.
    pub fn and_passthrough_to_local_command(&self, path: impl Into<PathBuf>) -> &Self {
        let path = path.into();
        self.write(move |state| {
            state.reaction = Reaction::Passthrough {
                path,
                timeout: None,
            }
        })
    }

    /// Forward matching calls to the real command at `path` with an explicit
    /// deadline.
    pub fn and_passthrough_to_local_command_with_timeout(
        &self,
        path: impl Into<PathBuf>,
        timeout: Duration,
    ) -> &Self {
        let path = path.into();
        self.write(move |state| {
            state.reaction = Reaction::Passthrough {
                path,
                timeout: Some(timeout),
            }
        })
    }

    // Dispatch-side accessors.

    pub(crate) fn arguments(&self) -> Arguments {
        self.read(|state| state.arguments.clone())
    }

    pub(crate) fn reaction(&self) -> Reaction {
        self.read(|state| state.reaction.clone())
    }

    pub(crate) fn stdin_matcher(&self) -> Option<Matcher> {
        self.read(|state| state.stdin.clone())
    }

    pub(crate) fn total_calls(&self) -> usize {
        self.read(|state| state.total_calls)
    }

    pub(crate) fn max_calls(&self) -> Count {
        self.read(|state| state.max_calls)
    }

    pub(crate) fn increment_total(&self) {
        self.write(|state| state.total_calls += 1);
    }

    pub(crate) fn set_read_stdin(&self, bytes: Vec<u8>) {
        self.write(move |state| state.read_stdin = bytes);
    }

    /// Verify bounds and captured stdin, reporting each miss via `log`.
    pub(crate) fn check(&self, reporter: &mut dyn Reporter) -> bool {
        // Snapshot first: formatting `self` takes the state lock again.
        let (min_calls, max_calls, total_calls, stdin, read_stdin) = self.read(|state| {
            (
                state.min_calls,
                state.max_calls,
                state.total_calls,
                state.stdin.clone(),
                state.read_stdin.clone(),
            )
        });

        let mut ok = true;
        if let Count::Fixed(min) = min_calls {
            if total_calls < min {
                reporter.log(format!(
                    "{self} called {total_calls} times, expected at least {min}"
                ));
                ok = false;
            }
        }
        if let Count::Fixed(max) = max_calls {
            if total_calls > max {
                reporter.log(format!(
                    "{self} called {total_calls} times, expected at most {max}"
                ));
                ok = false;
            }
        }
        if let Some(matcher) = stdin {
            let captured = String::from_utf8_lossy(&read_stdin);
            if !matcher.accepts(&captured) {
                reporter.log(format!(
                    "Expected stdin {:?}, got {:?}",
                    matcher.to_string(),
                    captured
                ));
                ok = false;
            }
        }
        ok
    }
}

impl fmt::Display for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arguments = self.arguments();
        if arguments.to_string().is_empty() {
            write!(f, "[{}]", self.inner.name)
        } else {
            write!(f, "[{} {arguments}]", self.inner.name)
        }
    }
}

impl fmt::Debug for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

/// One expectation evaluated against one argument vector.
pub struct ExpectationResult {
    pub arguments: Vec<String>,
    pub expectation: Expectation,
    pub args_result: ArgumentsMatchResult,
    pub call_count_match: bool,
}

impl ExpectationResult {
    /// Human explanation of why this row did or did not match.
    pub fn explain(&self) -> String {
        if self.args_result.is_match && self.call_count_match {
            format!("Arguments {:?} matched {}", self.arguments, self.expectation)
        } else if self.args_result.is_match {
            let max = match self.expectation.max_calls() {
                Count::Fixed(max) => max.to_string(),
                Count::Unbounded => "unbounded".to_string(),
            };
            format!(
                "Arguments {:?} matched {}, but total calls of {} would exceed max calls of {max}",
                self.arguments,
                self.expectation,
                self.expectation.total_calls() + 1,
            )
        } else {
            format!(
                "Arguments {:?} didn't match any expectations. Closest was {}, but {}",
                self.arguments, self.expectation, self.args_result.explanation
            )
        }
    }
}

/// Every expectation's result for one argument vector, in declaration order.
pub struct ExpectationResultSet(Vec<ExpectationResult>);

impl ExpectationResultSet {
    /// First row that matches on arguments and still has calls remaining;
    /// this is what makes identical patterns drain in declaration order.
    pub fn matched(&self) -> Option<&ExpectationResult> {
        self.0
            .iter()
            .find(|row| row.args_result.is_match && row.call_count_match)
    }

    /// The near-miss with the highest literal agreement, for diagnostics.
    pub fn closest_match(&self) -> Option<&ExpectationResult> {
        self.0.iter().reduce(|best, row| {
            if row.args_result.match_count > best.args_result.match_count {
                row
            } else {
                best
            }
        })
    }
}

/// The ordered expectations bound to one mock.
#[derive(Default)]
pub struct ExpectationSet(Vec<Expectation>);

impl ExpectationSet {
    pub(crate) fn push(&mut self, expectation: Expectation) {
        self.0.push(expectation);
    }

    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Expectation> {
        self.0.iter()
    }

    /// Evaluate `actual` (argv[0] already stripped) against every
    /// expectation.
    pub fn for_arguments(&self, actual: &[String]) -> ExpectationResultSet {
        ExpectationResultSet(
            self.0
                .iter()
                .map(|expectation| ExpectationResult {
                    arguments: actual.to_vec(),
                    expectation: expectation.clone(),
                    args_result: expectation.arguments().match_against(actual),
                    call_count_match: expectation
                        .max_calls()
                        .allows_more(expectation.total_calls()),
                })
                .collect(),
        )
    }
}
