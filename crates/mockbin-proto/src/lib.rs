// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Wire protocol shared between the mockbin server and its relay shims.
//!
//! The shim and the server talk plain JSON over loopback HTTP. This crate
//! pins the message shapes and route paths on both sides, together with the
//! two ways a shim learns its configuration: the stamp trailer appended to a
//! produced executable, and the environment variables used in linked mode.

use serde::{Deserialize, Serialize};

pub mod stamp;

/// Environment variable carrying the server base URL in linked mode.
pub const ENV_SERVER: &str = "MOCKBIN_SERVER";

/// Environment variable carrying the proxy identity (the published path) in
/// linked mode.
pub const ENV_PATH: &str = "MOCKBIN_PATH";

/// Environment variable enabling shim debug forwarding to `POST /debug`.
pub const ENV_DEBUG: &str = "MOCKBIN_DEBUG";

/// Handshake body for `POST /calls/new`.
///
/// Field casing is part of the wire contract, so every field carries an
/// explicit rename rather than relying on a container attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCallRequest {
    /// Process id of the shim, used as the handler key for the session.
    #[serde(rename = "PID")]
    pub pid: u32,
    /// The proxy identity the shim was produced for.
    #[serde(rename = "Path")]
    pub path: String,
    /// Full argument vector, including argv[0] as seen by the OS.
    #[serde(rename = "Args")]
    pub args: Vec<String>,
    /// Environment as `KEY=VALUE` entries.
    #[serde(rename = "Env")]
    pub env: Vec<String>,
    /// Working directory of the invocation.
    #[serde(rename = "Dir")]
    pub dir: String,
    /// Whether the shim will follow up with a `POST /calls/{pid}/stdin`.
    #[serde(rename = "HasStdin")]
    pub has_stdin: bool,
}

/// Reply to `POST /calls/new`; echoes the PID the server keyed the call by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCallResponse {
    #[serde(rename = "PID")]
    pub pid: u32,
}

/// Configuration a shim needs to relay an invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShimConfig {
    /// Base URL of the server, e.g. `http://127.0.0.1:43127`.
    pub server_url: String,
    /// The path this shim stands in for, sent verbatim in the handshake.
    pub path: String,
}

/// Route paths, kept in one place so shim and server cannot drift.
pub mod routes {
    pub const NEW_CALL: &str = "/calls/new";
    pub const DEBUG: &str = "/debug";

    pub fn stdin(pid: u32) -> String {
        format!("/calls/{pid}/stdin")
    }

    pub fn stdout(pid: u32) -> String {
        format!("/calls/{pid}/stdout")
    }

    pub fn stderr(pid: u32) -> String {
        format!("/calls/{pid}/stderr")
    }

    pub fn exitcode(pid: u32) -> String {
        format!("/calls/{pid}/exitcode")
    }
}
