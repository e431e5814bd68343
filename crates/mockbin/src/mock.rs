// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The user-facing façade: a proxy plus its expectations and dispatch loop.
//!
//! `Mock::new` publishes the executable, registers it, and spins a
//! dispatcher thread that consumes the proxy's call channel. Each call runs
//! the `before` middleware, is matched against the expectation set on
//! argv[1:], and then reacted to: canned bytes, a handler, or passthrough to
//! a real command. `check` reports afterwards through the two-method
//! [`Reporter`] capability.

use crate::args::Arguments;
use crate::call::Call;
use crate::error::MockError;
use crate::expectation::{Expectation, ExpectationSet, Reaction};
use crate::proxy::Proxy;
use crate::reporter::Reporter;
use std::io::Write;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Default deadline for passthrough children; override per mock with
/// [`Mock::set_passthrough_timeout`].
pub const DEFAULT_PASSTHROUGH_TIMEOUT: Duration = Duration::from_secs(10);

type BeforeFn =
    Arc<dyn Fn(&Invocation) -> Result<(), Box<dyn std::error::Error + Send + Sync>> + Send + Sync>;

/// Historical record of one completed call.
#[derive(Clone)]
pub struct Invocation {
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub dir: PathBuf,
    /// The expectation this call matched, if any.
    pub expectation: Option<Expectation>,
}

struct MockState {
    expected: ExpectationSet,
    invocations: Vec<Invocation>,
    before: Vec<BeforeFn>,
    ignore_unexpected: bool,
    passthrough_path: Option<PathBuf>,
    passthrough_timeout: Duration,
}

struct MockInner {
    name: String,
    path: PathBuf,
    proxy: Mutex<Proxy>,
    state: Mutex<MockState>,
    dispatcher: Mutex<Option<std::thread::JoinHandle<()>>>,
}

/// A mocked binary: publish it, declare expectations, run the system under
/// test, then check.
pub struct Mock {
    inner: Arc<MockInner>,
}

impl Mock {
    /// Publish a mock at `path` (a bare name gets a temp directory) and
    /// start dispatching its calls.
    pub fn new(path: impl AsRef<Path>) -> Result<Mock, MockError> {
        Self::from_proxy(Proxy::compile(path)?)
    }

    /// Linked-mode construction: publish the current executable at `path`.
    /// See [`Proxy::link_test_binary`] for the contract.
    pub fn link_test_binary(path: impl AsRef<Path>) -> Result<Mock, MockError> {
        Self::from_proxy(Proxy::link_test_binary(path)?)
    }

    fn from_proxy(proxy: Proxy) -> Result<Mock, MockError> {
        let receiver = proxy
            .take_receiver()
            .expect("a fresh proxy always has its delivery channel");
        let inner = Arc::new(MockInner {
            name: proxy.name().to_string(),
            path: proxy.path().to_path_buf(),
            proxy: Mutex::new(proxy),
            state: Mutex::new(MockState {
                expected: ExpectationSet::default(),
                invocations: Vec::new(),
                before: Vec::new(),
                ignore_unexpected: false,
                passthrough_path: None,
                passthrough_timeout: DEFAULT_PASSTHROUGH_TIMEOUT,
            }),
            dispatcher: Mutex::new(None),
        });

        let dispatch_inner = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name(format!("mockbin-dispatch-{}", inner.name))
            .spawn(move || {
                let mut receiver = receiver;
                while let Some(call) = receiver.blocking_recv() {
                    dispatch_inner.invoke(call);
                }
                tracing::debug!(
                    target: "mockbin::mock",
                    name = %dispatch_inner.name,
                    "dispatcher finished"
                );
            })?;
        lock(&inner.dispatcher).replace(handle);

        Ok(Mock { inner })
    }

    /// Basename of the mocked binary.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Full path of the published executable; hand this to the system under
    /// test.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Environment the test must propagate in linked mode.
    pub fn environ(&self) -> Vec<(String, String)> {
        lock(&self.inner.proxy).environ().to_vec()
    }

    /// Declare that the mock will be called with arguments matching `args`
    /// (argv[0] excluded). Defaults to exactly one call and a clean exit.
    pub fn expect(&self, args: impl Into<Arguments>) -> Expectation {
        let mut state = lock(&self.inner.state);
        let sequence = state.expected.len();
        let expectation = Expectation::new(self.inner.name.clone(), sequence, args.into());
        state.expected.push(expectation.clone());
        expectation
    }

    /// Shortcut for declaring many single-call expectations at once.
    pub fn expect_all<A: Into<Arguments>>(&self, sets: impl IntoIterator<Item = A>) {
        for args in sets {
            self.expect(args);
        }
    }

    /// Add middleware that runs before each call is matched; an error fails
    /// the call with the message on stderr.
    pub fn before(
        &self,
        f: impl Fn(&Invocation) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
            + Send
            + Sync
            + 'static,
    ) -> &Self {
        lock(&self.inner.state).before.push(Arc::new(f));
        self
    }

    /// Let calls with no matching expectation exit 0 silently instead of
    /// failing.
    pub fn ignore_unexpected_invocations(&self) -> &Self {
        lock(&self.inner.state).ignore_unexpected = true;
        self
    }

    /// Forward every matched call to the real command of the same name,
    /// looked up in `PATH`. Implies ignoring unexpected invocations.
    pub fn passthrough_to_local_command(&self) -> Result<&Self, MockError> {
        let found = which::which(&self.inner.name)
            .map_err(|_| MockError::CommandNotFound(self.inner.name.clone()))?;
        let mut state = lock(&self.inner.state);
        state.passthrough_path = Some(found);
        state.ignore_unexpected = true;
        drop(state);
        Ok(self)
    }

    /// Deadline applied to passthrough children without an explicit one.
    pub fn set_passthrough_timeout(&self, timeout: Duration) -> &Self {
        lock(&self.inner.state).passthrough_timeout = timeout;
        self
    }

    /// Verify counts, stdin captures, and unexpected invocations.
    ///
    /// Diagnostics go through `reporter.log`; each failing category records
    /// exactly one `reporter.error`. Never short-circuits, so the reporter
    /// sees the full picture. Returns true when everything held.
    pub fn check(&self, reporter: &mut dyn Reporter) -> bool {
        let state = lock(&self.inner.state);
        if state.expected.is_empty() {
            return true;
        }

        let mut failed = 0;
        for expectation in state.expected.iter() {
            if !expectation.check(reporter) {
                failed += 1;
            }
        }
        if failed > 0 {
            reporter.error(format!(
                "Not all expectations were met ({} out of {})",
                state.expected.len() - failed,
                state.expected.len()
            ));
        }

        let mut unexpected = 0;
        if !state.ignore_unexpected {
            for invocation in &state.invocations {
                if invocation.expectation.is_none() {
                    reporter.log(format!(
                        "Unexpected call to {} {}",
                        self.inner.name,
                        format_arg_list(args_tail(&invocation.args)),
                    ));
                    unexpected += 1;
                }
            }
            if unexpected > 0 {
                reporter.error(format!(
                    "More invocations than expected ({} unexpected out of {})",
                    unexpected,
                    state.invocations.len()
                ));
            }
        }

        failed == 0 && unexpected == 0
    }

    /// Close the proxy: deregister, remove the executable, stop the
    /// dispatcher. Idempotent.
    pub fn close(&self) -> Result<(), MockError> {
        tracing::debug!(target: "mockbin::mock", name = %self.inner.name, "closing mock");
        lock(&self.inner.proxy).close()?;
        if let Some(handle) = lock(&self.inner.dispatcher).take() {
            let _ = handle.join();
        }
        Ok(())
    }

    /// Close, then check; closing happens even when checks fail.
    pub fn check_and_close(&self, reporter: &mut dyn Reporter) -> Result<(), MockError> {
        self.close()?;
        if !self.check(reporter) {
            return Err(MockError::ChecksFailed);
        }
        Ok(())
    }

    /// The invocations recorded so far.
    pub fn invocations(&self) -> Vec<Invocation> {
        lock(&self.inner.state).invocations.clone()
    }
}

impl MockInner {
    fn invoke(&self, call: Call) {
        let mut state = lock(&self.state);
        tracing::debug!(
            target: "mockbin::mock",
            name = %self.name,
            args = ?call.args,
            "handling invocation"
        );

        let mut invocation = Invocation {
            args: call.args.clone(),
            env: call.env.clone(),
            dir: call.dir.clone(),
            expectation: None,
        };

        for before in &state.before {
            if let Err(err) = before(&invocation) {
                let _ = writeln!(call.stderr(), "Error: {err}");
                call.exit(1);
                return;
            }
        }

        let results = state.expected.for_arguments(args_tail(&call.args));
        let Some(matched) = results.matched().map(|row| row.expectation.clone()) else {
            state.invocations.push(invocation);
            if state.ignore_unexpected {
                call.exit(0);
            } else {
                let detail = match results.closest_match() {
                    Some(closest) => closest.explain(),
                    None => format!(
                        "No expectations set for [{} {}]",
                        self.name,
                        format_arg_list(args_tail(&call.args))
                    ),
                };
                let _ = writeln!(call.stderr(), "Error: {detail}");
                call.exit(1);
            }
            return;
        };

        invocation.expectation = Some(matched.clone());

        // Capture stdin before reacting so the matcher sees the whole
        // stream, then hand handlers and passthrough the same bytes again.
        if matched.stdin_matcher().is_some() {
            match call.stdin().drain() {
                Ok(bytes) => {
                    matched.set_read_stdin(bytes.clone());
                    call.stdin().replace_with(bytes);
                }
                Err(err) => {
                    let _ = writeln!(call.stderr(), "Error: failed to read stdin: {err}");
                    call.exit(1);
                    state.invocations.push(invocation);
                    return;
                }
            }
        }

        if let Some(path) = state.passthrough_path.clone() {
            call.run_passthrough(&path, Some(state.passthrough_timeout));
        } else {
            match matched.reaction() {
                Reaction::Passthrough { path, timeout } => {
                    let timeout = timeout.unwrap_or(state.passthrough_timeout);
                    call.run_passthrough(&path, Some(timeout));
                }
                Reaction::CallFunc(handler) => {
                    let outcome =
                        std::panic::catch_unwind(AssertUnwindSafe(|| handler(&call)));
                    if let Err(panic) = outcome {
                        let message = panic_message(panic.as_ref());
                        tracing::debug!(
                            target: "mockbin::mock",
                            name = %self.name,
                            %message,
                            "call handler panicked"
                        );
                        let _ = writeln!(call.stderr(), "Error: call handler panicked: {message}");
                        if !call.is_done() {
                            call.exit(1);
                        }
                    }
                }
                Reaction::Respond {
                    exit_code,
                    stdout,
                    stderr,
                } => {
                    let _ = call.stdout().write_all(&stdout);
                    let _ = call.stderr().write_all(&stderr);
                    call.exit(exit_code);
                }
            }
        }

        matched.increment_total();
        state.invocations.push(invocation);
    }
}

fn args_tail(args: &[String]) -> &[String] {
    args.get(1..).unwrap_or(&[])
}

fn format_arg_list(args: &[String]) -> String {
    args.iter()
        .map(|arg| format!("{arg:?}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
