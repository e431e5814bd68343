// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The relay that physically stands in for a mocked binary.
//!
//! When the system under test executes a produced mock, this program runs
//! instead. It opens a session with the local server, streams the three
//! stdio channels across loopback HTTP, then exits with whatever code the
//! test decided on. It is deliberately stateless: config handshake, three
//! copies, one integer.
//!
//! Configuration comes from the stamp trailer of the executable itself, or
//! from `MOCKBIN_SERVER`/`MOCKBIN_PATH` when the current binary was linked
//! into place (see [`act_as_shim_from_env`]).

use bytes::Bytes;
use futures::StreamExt;
use mockbin_proto::{routes, NewCallRequest, NewCallResponse, ShimConfig};
use std::io::{Read, Seek, SeekFrom};
use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::io::ReaderStream;

mod stdin_probe;

#[derive(Debug, Error)]
pub enum ShimError {
    #[error("no shim configuration: executable is not stamped and MOCKBIN_SERVER/MOCKBIN_PATH are unset")]
    NoConfig,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("request to server failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server replied {status} to {route}: {body}")]
    Status {
        route: String,
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("server sent an unparseable exit code {0:?}")]
    BadExitCode(String),
}

/// Run the relay to completion and return the process exit code.
///
/// Errors are printed to stderr and turn into exit code 1, so a failing
/// handshake is visible to the system under test right away.
pub fn run() -> i32 {
    match try_run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("mockbin-shim: {err}");
            1
        }
    }
}

/// Become the shim if the linked-mode environment variables are present.
///
/// Helper binaries that may be published via `link_test_binary` call this at
/// the very top of `main`; it never returns when the variables are set.
pub fn act_as_shim_from_env() {
    let configured = std::env::var_os(mockbin_proto::ENV_SERVER).is_some()
        && std::env::var_os(mockbin_proto::ENV_PATH).is_some();
    if configured {
        std::process::exit(run());
    }
}

fn try_run() -> Result<i32, ShimError> {
    let config = resolve_config()?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?;
    runtime.block_on(relay(config))
}

/// Stamp trailer first: a stamped executable is authoritative about itself,
/// the environment only configures linked binaries.
fn resolve_config() -> Result<ShimConfig, ShimError> {
    if let Some(config) = stamped_config()? {
        return Ok(config);
    }
    match (
        std::env::var(mockbin_proto::ENV_SERVER),
        std::env::var(mockbin_proto::ENV_PATH),
    ) {
        (Ok(server_url), Ok(path)) => Ok(ShimConfig { server_url, path }),
        _ => Err(ShimError::NoConfig),
    }
}

/// Read the tail of our own executable and look for the stamp trailer.
fn stamped_config() -> Result<Option<ShimConfig>, ShimError> {
    const TAIL: u64 = 64 * 1024;

    let exe = std::env::current_exe()?;
    let mut file = std::fs::File::open(exe)?;
    let len = file.metadata()?.len();
    file.seek(SeekFrom::Start(len.saturating_sub(TAIL)))?;
    let mut tail = Vec::with_capacity(TAIL.min(len) as usize);
    file.read_to_end(&mut tail)?;

    match mockbin_proto::stamp::extract(&tail) {
        Ok(config) => Ok(Some(config)),
        Err(_) => Ok(None),
    }
}

async fn relay(config: ShimConfig) -> Result<i32, ShimError> {
    let client = reqwest::Client::new();
    let base = config.server_url.trim_end_matches('/').to_string();
    let has_stdin = stdin_probe::stdin_is_readable();

    let request = NewCallRequest {
        pid: std::process::id(),
        path: config.path.clone(),
        args: std::env::args().collect(),
        env: std::env::vars().map(|(k, v)| format!("{k}={v}")).collect(),
        dir: std::env::current_dir()?.to_string_lossy().into_owned(),
        has_stdin,
    };

    debug_line(&client, &base, format!("connecting as {}", config.path)).await;

    let response = client
        .post(format!("{base}{}", routes::NEW_CALL))
        .json(&request)
        .send()
        .await?;
    let response = expect_success(routes::NEW_CALL.to_string(), response).await?;
    let reply: NewCallResponse = response.json().await?;
    let pid = reply.pid;

    // The stdin copy is intentionally not awaited: the test side may finish
    // the call without draining stdin, and the process must still exit.
    if has_stdin {
        let client = client.clone();
        let url = format!("{base}{}", routes::stdin(pid));
        tokio::spawn(async move {
            let body = reqwest::Body::wrap_stream(ReaderStream::with_capacity(
                tokio::io::stdin(),
                1024,
            ));
            let _ = client.post(url).body(body).send().await;
        });
    }

    tokio::try_join!(
        copy_stream(
            client.clone(),
            base.clone(),
            routes::stdout(pid),
            BufWriter::new(tokio::io::stdout()),
        ),
        copy_stream(
            client.clone(),
            base.clone(),
            routes::stderr(pid),
            BufWriter::new(tokio::io::stderr()),
        ),
    )?;

    let route = routes::exitcode(pid);
    let response = client.get(format!("{base}{route}")).send().await?;
    let response = expect_success(route, response).await?;
    let text = response.text().await?;
    let code = text
        .trim()
        .parse::<i32>()
        .map_err(|_| ShimError::BadExitCode(text.clone()))?;

    debug_line(&client, &base, format!("exiting with code {code}")).await;
    Ok(code)
}

/// Copy one response stream to a local stream, flushing after every chunk so
/// an interactive system under test never deadlocks on buffered output.
async fn copy_stream<W>(
    client: reqwest::Client,
    base: String,
    route: String,
    mut dest: W,
) -> Result<(), ShimError>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let response = client.get(format!("{base}{route}")).send().await?;
    let response = expect_success(route, response).await?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk: Bytes = chunk?;
        dest.write_all(&chunk).await?;
        dest.flush().await?;
    }
    Ok(())
}

async fn expect_success(
    route: String,
    response: reqwest::Response,
) -> Result<reqwest::Response, ShimError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ShimError::Status {
        route,
        status,
        body,
    })
}

/// Forward a log line to the server's `/debug` sink when MOCKBIN_DEBUG is on.
async fn debug_line(client: &reqwest::Client, base: &str, line: String) {
    if std::env::var_os(mockbin_proto::ENV_DEBUG).is_none() {
        return;
    }
    let line = format!("[shim {}] {line}", std::process::id());
    let _ = client
        .post(format!("{base}{}", routes::DEBUG))
        .body(line)
        .send()
        .await;
}
