// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Process-wide IPC server brokering shim sessions.
//!
//! One loopback HTTP server serves every proxy in the process. It is started
//! lazily by the first registration and runs on a library-owned runtime so
//! the test-facing API stays synchronous. Per call, the server owns the pipe
//! ends it streams to the shim; the matching `Call` owns the ends handed to
//! test code.
//!
//! Client errors never take the server down: an unknown proxy or pid is a
//! 404 and malformed JSON is a 400, which the shim turns into a prompt
//! non-zero exit of the system under test's child.

use crate::call::{Call, CallPipes};
use axum::body::Body;
use axum::extract::{Path as AxumPath, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::StreamExt;
use mockbin_proto::{NewCallRequest, NewCallResponse};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::convert::Infallible;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicI64;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

static RUNTIME: Lazy<tokio::runtime::Runtime> = Lazy::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("mockbin-server")
        .enable_all()
        .build()
        .expect("failed to build the mockbin runtime")
});

/// The runtime the server and every async bridge runs on.
pub(crate) fn runtime() -> &'static tokio::runtime::Runtime {
    &RUNTIME
}

static SERVER: Mutex<Option<Arc<Server>>> = Mutex::new(None);

/// The running singleton, started on demand.
pub(crate) fn instance() -> io::Result<Arc<Server>> {
    let mut guard = SERVER.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(server) = guard.as_ref() {
        return Ok(Arc::clone(server));
    }
    let server = Server::start()?;
    *guard = Some(Arc::clone(&server));
    Ok(server)
}

/// Base URL of the process-wide server, starting it if necessary.
///
/// Mostly useful for protocol-level tests and diagnostics; mocks wire the
/// URL into their shims on their own.
pub fn server_url() -> io::Result<String> {
    Ok(instance()?.url().to_string())
}

/// Stop the process-wide server and release every pending call.
///
/// Stopping is a test-suite responsibility; the next registration starts a
/// fresh server on a new port.
pub fn stop_server() {
    let server = SERVER
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    if let Some(server) = server {
        server.shutdown();
    }
}

pub(crate) struct Server {
    url: String,
    state: ServerState,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    serve_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Server {
    fn start() -> io::Result<Arc<Server>> {
        let state = ServerState::default();
        let app = router(state.clone());

        let (addr, serve_task, shutdown_tx) = runtime().block_on(async move {
            let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await?;
            let addr = listener.local_addr()?;
            let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
            let task = tokio::spawn(async move {
                let serve = axum::serve(listener, app).with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                });
                if let Err(err) = serve.await {
                    tracing::error!(target: "mockbin::server", %err, "server exited with error");
                }
            });
            Ok::<_, io::Error>((addr, task, shutdown_tx))
        })?;

        tracing::debug!(target: "mockbin::server", %addr, "started server");
        Ok(Arc::new(Server {
            url: format!("http://{addr}"),
            state,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            serve_task: Mutex::new(Some(serve_task)),
        }))
    }

    fn shutdown(&self) {
        tracing::debug!(target: "mockbin::server", url = %self.url, "stopping server");
        // Dropping registrations and handlers closes their channels, which
        // releases dispatchers and any exit still waiting for its ack.
        self.state.clear();
        if let Some(tx) = self
            .shutdown_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = tx.send(());
        }
        if let Some(task) = self
            .serve_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            // Streaming responses can outlive the graceful drain; cut them.
            task.abort();
        }
    }

    pub(crate) fn url(&self) -> &str {
        &self.url
    }

    /// Bind a proxy path to a fresh delivery channel.
    pub(crate) fn register(
        &self,
        path: &Path,
        name: &str,
    ) -> (mpsc::Receiver<Call>, Arc<AtomicI64>) {
        let (sender, receiver) = mpsc::channel(1);
        let call_count = Arc::new(AtomicI64::new(0));
        tracing::debug!(target: "mockbin::server", path = %path.display(), "registering proxy");
        self.state.proxies().insert(
            path.to_path_buf(),
            RegisteredProxy {
                sender,
                name: name.to_string(),
                call_count: Arc::clone(&call_count),
            },
        );
        (receiver, call_count)
    }

    /// Let lookups for `from` resolve to the proxy registered at `to`.
    pub(crate) fn alias(&self, from: &Path, to: &Path) {
        tracing::debug!(
            target: "mockbin::server",
            from = %from.display(),
            to = %to.display(),
            "adding proxy alias"
        );
        self.state
            .aliases()
            .insert(from.to_path_buf(), to.to_path_buf());
    }

    /// Remove a proxy, its aliases, and any surviving call handlers.
    pub(crate) fn deregister(&self, path: &Path) {
        tracing::debug!(target: "mockbin::server", path = %path.display(), "deregistering proxy");
        self.state.proxies().remove(path);
        self.state.aliases().retain(|_, target| target != path);
        self.state
            .handlers()
            .retain(|_, handler| handler.proxy_path != path);
    }
}

#[derive(Clone, Default)]
struct ServerState {
    inner: Arc<ServerInner>,
}

#[derive(Default)]
struct ServerInner {
    proxies: Mutex<HashMap<PathBuf, RegisteredProxy>>,
    aliases: Mutex<HashMap<PathBuf, PathBuf>>,
    handlers: Mutex<HashMap<u32, Arc<CallHandler>>>,
}

struct RegisteredProxy {
    sender: mpsc::Sender<Call>,
    name: String,
    call_count: Arc<AtomicI64>,
}

/// Server-side ends of one call, keyed by the shim's pid. Each stream end is
/// taken at most once by its route handler.
struct CallHandler {
    proxy_path: PathBuf,
    stdout: Mutex<Option<mpsc::Receiver<Bytes>>>,
    stderr: Mutex<Option<mpsc::Receiver<Bytes>>>,
    stdin: Mutex<Option<mpsc::Sender<Bytes>>>,
    exit: Mutex<Option<mpsc::Receiver<i32>>>,
    ack: Mutex<Option<mpsc::Sender<()>>>,
}

impl ServerState {
    fn proxies(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, RegisteredProxy>> {
        self.inner
            .proxies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn aliases(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, PathBuf>> {
        self.inner
            .aliases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn handlers(&self) -> std::sync::MutexGuard<'_, HashMap<u32, Arc<CallHandler>>> {
        self.inner
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn clear(&self) {
        self.proxies().clear();
        self.aliases().clear();
        self.handlers().clear();
    }

    /// Resolve a declared path to its proxy, following one alias hop.
    fn resolve(&self, path: &Path) -> Option<(mpsc::Sender<Call>, String, Arc<AtomicI64>)> {
        let aliases = self.aliases();
        let proxies = self.proxies();
        let target = proxies
            .get(path)
            .or_else(|| aliases.get(path).and_then(|alias| proxies.get(alias)))?;
        Some((
            target.sender.clone(),
            target.name.clone(),
            Arc::clone(&target.call_count),
        ))
    }

    fn handler(&self, pid: u32) -> Result<Arc<CallHandler>, ServerError> {
        self.handlers()
            .get(&pid)
            .cloned()
            .ok_or(ServerError::UnknownCall(pid))
    }
}

fn router(state: ServerState) -> Router {
    Router::new()
        .route("/calls/new", post(new_call))
        .route("/calls/:pid/stdin", post(stdin))
        .route("/calls/:pid/stdout", get(stdout))
        .route("/calls/:pid/stderr", get(stderr))
        .route("/calls/:pid/exitcode", get(exitcode))
        .route("/debug", post(debug_line))
        .fallback(fallback)
        .with_state(state)
}

async fn new_call(
    State(state): State<ServerState>,
    Json(request): Json<NewCallRequest>,
) -> Result<Json<NewCallResponse>, ServerError> {
    tracing::debug!(
        target: "mockbin::server",
        path = %request.path,
        pid = request.pid,
        args = ?request.args,
        "new call"
    );

    let lookup = PathBuf::from(&request.path);
    let (sender, name, call_count) = state
        .resolve(&lookup)
        .ok_or_else(|| ServerError::UnknownProxy(request.path.clone()))?;

    let (call, pipes) = Call::new(
        request.pid,
        name,
        request.args,
        request.env,
        PathBuf::from(request.dir),
    );
    let CallPipes {
        stdout,
        stderr,
        stdin,
        exit,
        ack,
    } = pipes;

    let handler = Arc::new(CallHandler {
        proxy_path: lookup,
        stdout: Mutex::new(Some(stdout)),
        stderr: Mutex::new(Some(stderr)),
        // Dropping the writer right away turns "no stdin" into EOF.
        stdin: Mutex::new(request.has_stdin.then_some(stdin)),
        exit: Mutex::new(Some(exit)),
        ack: Mutex::new(Some(ack)),
    });
    state.handlers().insert(request.pid, handler);
    call_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);

    if sender.send(call).await.is_err() {
        // The proxy closed while this call was queued; fail the shim
        // instead of hanging it.
        state.handlers().remove(&request.pid);
        return Err(ServerError::ProxyClosed(request.path));
    }

    Ok(Json(NewCallResponse { pid: request.pid }))
}

async fn stdin(
    State(state): State<ServerState>,
    AxumPath(pid): AxumPath<u32>,
    body: Body,
) -> Result<StatusCode, ServerError> {
    let handler = state.handler(pid)?;
    let sender = handler
        .stdin
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
        .ok_or(ServerError::StreamTaken("stdin"))?;

    tracing::debug!(target: "mockbin::server", pid, "copying stdin");
    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(chunk) => {
                if !chunk.is_empty() && sender.send(chunk).await.is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    // Dropping the sender is the EOF the call's reader sees.
    drop(sender);
    tracing::debug!(target: "mockbin::server", pid, "finished stdin");
    Ok(StatusCode::OK)
}

async fn stdout(
    State(state): State<ServerState>,
    AxumPath(pid): AxumPath<u32>,
) -> Result<Response, ServerError> {
    stream_pipe(&state, pid, "stdout", |handler| &handler.stdout)
}

async fn stderr(
    State(state): State<ServerState>,
    AxumPath(pid): AxumPath<u32>,
) -> Result<Response, ServerError> {
    stream_pipe(&state, pid, "stderr", |handler| &handler.stderr)
}

/// Stream one output pipe into the response; each received chunk becomes its
/// own flushed body frame, so interactive children see bytes promptly.
fn stream_pipe(
    state: &ServerState,
    pid: u32,
    label: &'static str,
    pick: impl Fn(&CallHandler) -> &Mutex<Option<mpsc::Receiver<Bytes>>>,
) -> Result<Response, ServerError> {
    let handler = state.handler(pid)?;
    let receiver = pick(&handler)
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
        .ok_or(ServerError::StreamTaken(label))?;

    tracing::debug!(target: "mockbin::server", pid, stream = label, "streaming");
    let body = Body::from_stream(ReceiverStream::new(receiver).map(Ok::<Bytes, Infallible>));
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        body,
    )
        .into_response())
}

async fn exitcode(
    State(state): State<ServerState>,
    AxumPath(pid): AxumPath<u32>,
) -> Result<Response, ServerError> {
    let handler = state.handler(pid)?;
    let exit = handler
        .exit
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
        .ok_or(ServerError::StreamTaken("exitcode"))?;
    let ack = handler
        .ack
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();

    tracing::debug!(target: "mockbin::server", pid, "waiting for exit code");
    let code = {
        let mut exit = exit;
        exit.recv().await.ok_or(ServerError::CallAbandoned(pid))?
    };
    tracing::debug!(target: "mockbin::server", pid, code, "sending exit code");

    // The call is terminal; forget the handler before replying.
    state.handlers().remove(&pid);

    // Two-step body: the code goes out as the first frame, and the ack fires
    // once that frame has been handed to the transport, mirroring the
    // flush-then-acknowledge ordering the exit handshake promises.
    let frames = futures::stream::unfold(
        (Some(format!("{code}\n")), ack),
        |(frame, ack)| async move {
            match frame {
                Some(text) => Some((Ok::<Bytes, Infallible>(Bytes::from(text)), (None, ack))),
                None => {
                    if let Some(ack) = ack {
                        let _ = ack.send(()).await;
                    }
                    None
                }
            }
        },
    );
    Ok((
        [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
        Body::from_stream(frames),
    )
        .into_response())
}

/// Debug sink for shims: the body is a log line.
async fn debug_line(body: String) -> StatusCode {
    tracing::debug!(target: "mockbin::shim", "{}", body.trim_end());
    StatusCode::OK
}

async fn fallback() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "unhandled request")
}

#[derive(Debug, Error)]
enum ServerError {
    #[error("no proxy found for {0}")]
    UnknownProxy(String),
    #[error("proxy for {0} is closed")]
    ProxyClosed(String),
    #[error("unknown call {0}")]
    UnknownCall(u32),
    #[error("{0} stream already opened")]
    StreamTaken(&'static str),
    #[error("call {0} was abandoned before an exit code was set")]
    CallAbandoned(u32),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match self {
            ServerError::UnknownProxy(_)
            | ServerError::ProxyClosed(_)
            | ServerError::UnknownCall(_) => StatusCode::NOT_FOUND,
            ServerError::StreamTaken(_) | ServerError::CallAbandoned(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, self.to_string()).into_response()
    }
}
