// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Scriptable stand-ins for external binaries in tests.
//!
//! For each binary a test wants to control, `mockbin` publishes a small
//! executable at a chosen path. When the system under test runs it, the
//! invocation is forwarded over loopback HTTP to the test process, which
//! inspects arguments, environment, working directory and stdin, and drives
//! stdout, stderr and the exit status from test code. Afterwards,
//! [`Mock::check`] verifies the declared expectations and reports per-
//! expectation diagnostics.
//!
//! ```no_run
//! use mockbin::{Mock, RecordingReporter};
//!
//! # fn main() -> Result<(), mockbin::MockError> {
//! let git = Mock::new("git")?;
//! git.expect(["rev-parse"]).and_write_to_stdout("abc\n").and_exit_with(0);
//!
//! let output = std::process::Command::new(git.path())
//!     .arg("rev-parse")
//!     .output()?;
//! assert_eq!(output.stdout, b"abc\n");
//!
//! let mut reporter = RecordingReporter::new();
//! assert!(git.check(&mut reporter));
//! git.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! Expectations match the argument vector after argv[0]; handlers that need
//! the program name still find it in [`Call::args`].

pub mod args;
pub mod env;

mod call;
mod error;
mod expectation;
mod mock;
mod producer;
mod proxy;
mod reporter;
mod server;

pub use args::{
    match_any, match_any_remaining, match_fn, match_pattern, Arguments, ArgumentsMatchResult,
    Matcher,
};
pub use call::{Call, CallReader, CallWriter, ChildExitError};
pub use env::{expect_env, get_env, match_env, EnvMatchResult, EnvMismatch};
pub use error::MockError;
pub use expectation::{
    Count, Expectation, ExpectationResult, ExpectationResultSet, ExpectationSet, UNBOUNDED,
};
pub use mock::{Invocation, Mock, DEFAULT_PASSTHROUGH_TIMEOUT};
pub use producer::ProduceError;
pub use proxy::Proxy;
pub use reporter::{RecordingReporter, Reporter, TracingReporter};
pub use server::{server_url, stop_server};

// Linked-mode binaries call this at the top of `main`; re-exported so they
// only depend on the façade crate.
pub use mockbin_shim::act_as_shim_from_env;
