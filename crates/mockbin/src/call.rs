// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! One live invocation of a mocked binary.
//!
//! A `Call` is created by the server when a shim opens a session and handed
//! to test code through the proxy's channel. Test code drives the child from
//! here: write to [`Call::stdout`]/[`Call::stderr`], read [`Call::stdin`],
//! then finish with [`Call::exit`] — or hand the whole thing to a real
//! command with [`Call::passthrough`].
//!
//! The stdio endpoints are thin sync adapters over the byte pipes the server
//! streams to the shim; the writers deliver chunks in FIFO order per stream.

use crate::server::runtime;
use bytes::{Buf, Bytes};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

const PIPE_DEPTH: usize = 16;
const IO_CHUNK: usize = 1024;

/// A single in-flight invocation of a mocked binary.
pub struct Call {
    /// Process id of the shim; unique per live call under one server.
    pub pid: u32,
    /// Basename of the proxied path.
    pub name: String,
    /// Full argument vector, including argv[0].
    pub args: Vec<String>,
    /// Environment as `KEY=VALUE` entries.
    pub env: Vec<String>,
    /// Working directory of the invocation.
    pub dir: PathBuf,

    stdout: CallWriter,
    stderr: CallWriter,
    stdin: CallReader,
    exit_tx: mpsc::Sender<i32>,
    ack_rx: Mutex<Option<mpsc::Receiver<()>>>,
    done: AtomicBool,
}

/// Server-side ends of a call's pipes and coordination channels.
pub(crate) struct CallPipes {
    pub stdout: mpsc::Receiver<Bytes>,
    pub stderr: mpsc::Receiver<Bytes>,
    pub stdin: mpsc::Sender<Bytes>,
    pub exit: mpsc::Receiver<i32>,
    pub ack: mpsc::Sender<()>,
}

impl Call {
    pub(crate) fn new(
        pid: u32,
        name: String,
        args: Vec<String>,
        env: Vec<String>,
        dir: PathBuf,
    ) -> (Call, CallPipes) {
        let (stdout_tx, stdout_rx) = mpsc::channel(PIPE_DEPTH);
        let (stderr_tx, stderr_rx) = mpsc::channel(PIPE_DEPTH);
        let (stdin_tx, stdin_rx) = mpsc::channel(PIPE_DEPTH);
        let (exit_tx, exit_rx) = mpsc::channel(1);
        let (ack_tx, ack_rx) = mpsc::channel(1);

        let call = Call {
            pid,
            name,
            args,
            env,
            dir,
            stdout: CallWriter::new(stdout_tx),
            stderr: CallWriter::new(stderr_tx),
            stdin: CallReader::new(stdin_rx),
            exit_tx,
            ack_rx: Mutex::new(Some(ack_rx)),
            done: AtomicBool::new(false),
        };
        let pipes = CallPipes {
            stdout: stdout_rx,
            stderr: stderr_rx,
            stdin: stdin_tx,
            exit: exit_rx,
            ack: ack_tx,
        };
        (call, pipes)
    }

    /// Writer feeding the child's stdout.
    pub fn stdout(&self) -> CallWriter {
        self.stdout.clone()
    }

    /// Writer feeding the child's stderr.
    pub fn stderr(&self) -> CallWriter {
        self.stderr.clone()
    }

    /// Reader over the child's stdin. EOF when the child closes its end, or
    /// immediately when the invocation carried no stdin.
    pub fn stdin(&self) -> CallReader {
        self.stdin.clone()
    }

    /// Case-insensitive environment lookup.
    pub fn get_env(&self, key: &str) -> Option<&str> {
        crate::env::get_env(key, &self.env)
    }

    /// True once the exit code has been taken; never blocks.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Finish the call: the child observes exit status `code`.
    ///
    /// Closes both output writers first, then blocks until the shim has
    /// acknowledged the code, so nothing else ever appears on the child's
    /// streams after this returns.
    ///
    /// # Panics
    ///
    /// Panics when called a second time on the same call.
    pub fn exit(&self, code: i32) {
        if self.done.swap(true, Ordering::SeqCst) {
            panic!("exit() called twice on call {} ({})", self.pid, self.name);
        }
        tracing::debug!(target: "mockbin::call", pid = self.pid, code, "sending exit code");

        self.stderr.close();
        self.stdout.close();

        if self.exit_tx.blocking_send(code).is_ok() {
            let ack = self
                .ack_rx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(mut ack) = ack {
                let _ = ack.blocking_recv();
            }
        }
        tracing::debug!(target: "mockbin::call", pid = self.pid, "exit acknowledged");
    }

    /// Fail the call: writes the error to the child's stderr, then exits
    /// with the status carried by a [`ChildExitError`], or 1 for anything
    /// else.
    pub fn fatal(&self, err: &(dyn std::error::Error + 'static)) {
        tracing::debug!(target: "mockbin::call", pid = self.pid, %err, "fatal error");
        let mut stderr = self.stderr();
        let _ = write!(stderr, "Fatal error: {err}");
        match err.downcast_ref::<ChildExitError>() {
            Some(child) => self.exit(child.code()),
            None => self.exit(1),
        }
    }

    /// Execute `path` with this call's arguments, environment, directory and
    /// stdio, then mirror its result. Runs until the child finishes.
    pub fn passthrough(&self, path: impl AsRef<Path>) {
        self.run_passthrough(path.as_ref(), None);
    }

    /// Like [`Call::passthrough`], but the child is killed once `timeout`
    /// elapses and the call exits 1.
    pub fn passthrough_with_timeout(&self, path: impl AsRef<Path>, timeout: Duration) {
        self.run_passthrough(path.as_ref(), Some(timeout));
    }

    /// Arguments after argv[0]; what a passthrough child receives.
    fn args_tail(&self) -> &[String] {
        self.args.get(1..).unwrap_or(&[])
    }

    pub(crate) fn run_passthrough(&self, path: &Path, timeout: Option<Duration>) {
        tracing::debug!(
            target: "mockbin::call",
            pid = self.pid,
            path = %path.display(),
            args = ?self.args_tail(),
            "passing call through"
        );
        match runtime().block_on(self.passthrough_child(path, timeout)) {
            Ok(status) if status.success() => self.exit(0),
            Ok(status) => {
                let code = status.code().unwrap_or(1);
                self.fatal(&ChildExitError::new(code));
            }
            Err(err) => self.fatal(&err),
        }
    }

    async fn passthrough_child(
        &self,
        path: &Path,
        timeout: Option<Duration>,
    ) -> Result<std::process::ExitStatus, PassthroughError> {
        let mut command = tokio::process::Command::new(path);
        command
            .args(self.args_tail())
            .env_clear()
            .current_dir(&self.dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for entry in &self.env {
            if let Some((key, value)) = entry.split_once('=') {
                command.env(key, value);
            }
        }

        let mut child = command.spawn().map_err(PassthroughError::Spawn)?;

        let stdout_pump = child
            .stdout
            .take()
            .map(|out| tokio::spawn(pump_output(out, self.stdout.sender())));
        let stderr_pump = child
            .stderr
            .take()
            .map(|err| tokio::spawn(pump_output(err, self.stderr.sender())));
        if let Some(child_stdin) = child.stdin.take() {
            feed_child_stdin(self.stdin(), child_stdin);
        }

        let status = match timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(waited) => waited.map_err(PassthroughError::Spawn)?,
                Err(_elapsed) => {
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                    await_pumps(stdout_pump, stderr_pump).await;
                    return Err(PassthroughError::Timeout(limit));
                }
            },
            None => child.wait().await.map_err(PassthroughError::Spawn)?,
        };

        // Drain remaining output into the call streams before exiting.
        await_pumps(stdout_pump, stderr_pump).await;
        Ok(status)
    }
}

async fn await_pumps(
    stdout: Option<tokio::task::JoinHandle<()>>,
    stderr: Option<tokio::task::JoinHandle<()>>,
) {
    if let Some(task) = stdout {
        let _ = task.await;
    }
    if let Some(task) = stderr {
        let _ = task.await;
    }
}

async fn pump_output(mut src: impl tokio::io::AsyncRead + Unpin, tx: Option<mpsc::Sender<Bytes>>) {
    let Some(tx) = tx else { return };
    let mut buf = [0u8; IO_CHUNK];
    loop {
        match src.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Bridge the call's sync stdin reader into the child's async stdin.
fn feed_child_stdin(reader: CallReader, child_stdin: tokio::process::ChildStdin) {
    let (bridge_tx, mut bridge_rx) = mpsc::channel::<Bytes>(4);
    tokio::task::spawn_blocking(move || {
        let mut reader = reader;
        let mut buf = [0u8; IO_CHUNK];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if bridge_tx
                        .blocking_send(Bytes::copy_from_slice(&buf[..n]))
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
    });
    tokio::spawn(async move {
        let mut child_stdin = child_stdin;
        while let Some(chunk) = bridge_rx.recv().await {
            if child_stdin.write_all(&chunk).await.is_err() {
                break;
            }
        }
    });
}

/// A command exit status carried through [`Call::fatal`] so the child's code
/// is forwarded instead of a flat 1.
#[derive(Debug, Error)]
#[error("command exited with code {code}")]
pub struct ChildExitError {
    code: i32,
}

impl ChildExitError {
    pub fn new(code: i32) -> Self {
        ChildExitError { code }
    }

    pub fn code(&self) -> i32 {
        self.code
    }
}

#[derive(Debug, Error)]
enum PassthroughError {
    #[error("{0}")]
    Spawn(io::Error),
    #[error("command exceeded deadline of {0:?} and was killed")]
    Timeout(Duration),
}

/// Sync writer over one of the call's output pipes.
///
/// Writes block while the shim side is not keeping up; after the call has
/// exited, writes fail with `BrokenPipe`.
#[derive(Clone)]
pub struct CallWriter {
    tx: Arc<Mutex<Option<mpsc::Sender<Bytes>>>>,
}

impl CallWriter {
    fn new(tx: mpsc::Sender<Bytes>) -> Self {
        CallWriter {
            tx: Arc::new(Mutex::new(Some(tx))),
        }
    }

    pub(crate) fn sender(&self) -> Option<mpsc::Sender<Bytes>> {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn close(&self) {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl Write for CallWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let sender = self.sender().ok_or_else(closed_pipe)?;
        sender
            .blocking_send(Bytes::copy_from_slice(buf))
            .map_err(|_| closed_pipe())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn closed_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "call stream is closed")
}

/// Sync reader over the call's stdin pipe.
///
/// The dispatcher may replace the live pipe with captured bytes after
/// draining it for a stdin matcher, so handlers and passthrough children
/// still observe the original input.
#[derive(Clone)]
pub struct CallReader {
    state: Arc<Mutex<StdinState>>,
}

enum StdinState {
    Live {
        rx: mpsc::Receiver<Bytes>,
        leftover: Bytes,
    },
    Buffered(io::Cursor<Vec<u8>>),
}

impl CallReader {
    fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        CallReader {
            state: Arc::new(Mutex::new(StdinState::Live {
                rx,
                leftover: Bytes::new(),
            })),
        }
    }

    /// Read everything up to EOF.
    pub(crate) fn drain(&self) -> io::Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.clone().read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    /// Swap the remaining stream for an in-memory buffer.
    pub(crate) fn replace_with(&self, bytes: Vec<u8>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state = StdinState::Buffered(io::Cursor::new(bytes));
    }
}

impl Read for CallReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match &mut *state {
            StdinState::Live { rx, leftover } => {
                if leftover.is_empty() {
                    match rx.blocking_recv() {
                        Some(chunk) => *leftover = chunk,
                        None => return Ok(0),
                    }
                }
                let n = buf.len().min(leftover.len());
                buf[..n].copy_from_slice(&leftover[..n]);
                leftover.advance(n);
                Ok(n)
            }
            StdinState::Buffered(cursor) => std::io::Read::read(cursor, buf),
        }
    }
}
