// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The logical identity of a replaceable binary.
//!
//! A proxy owns the published executable, its temp directory when the caller
//! only gave a bare name, and the delivery channel calls arrive on. `Mock`
//! takes the channel over; raw users can consume it with
//! [`Proxy::recv_call`] instead, scripting each call by hand.

use crate::call::Call;
use crate::error::MockError;
use crate::producer::{self, ShimVars};
use crate::server::{self, Server};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tempfile::TempDir;
use tokio::sync::mpsc;

pub struct Proxy {
    path: PathBuf,
    name: String,
    call_count: Arc<AtomicI64>,
    environ: Vec<(String, String)>,
    receiver: Mutex<Option<mpsc::Receiver<Call>>>,
    temp_dir: Option<TempDir>,
    server: Arc<Server>,
    closed: AtomicBool,
}

impl Proxy {
    /// Publish a mock executable at `path` and register it with the server.
    ///
    /// A bare name gets its own temp directory, removed again on close. On
    /// Windows the path is given an `.exe` suffix when it lacks one.
    pub fn compile(path: impl AsRef<Path>) -> Result<Proxy, MockError> {
        let (dest, temp_dir) = resolve_destination(path.as_ref())?;
        let server = server::instance()?;
        let name = file_name(&dest);

        let (receiver, call_count) = server.register(&dest, &name);
        let vars = ShimVars {
            server_url: server.url().to_string(),
            proxy_path: dest.clone(),
        };
        if let Err(err) = producer::produce(&dest, &vars) {
            server.deregister(&dest);
            return Err(err.into());
        }

        #[cfg(windows)]
        server.alias(&dest.with_extension(""), &dest);

        Ok(Proxy {
            path: dest,
            name,
            call_count,
            environ: Vec::new(),
            receiver: Mutex::new(Some(receiver)),
            temp_dir,
            server,
            closed: AtomicBool::new(false),
        })
    }

    /// Publish the current (test) executable at `path` instead of a stamped
    /// relay. The binary must call `act_as_shim_from_env` early in `main`,
    /// and the test must propagate [`Proxy::environ`] to the system under
    /// test so the linked binary knows it is acting as the shim.
    pub fn link_test_binary(path: impl AsRef<Path>) -> Result<Proxy, MockError> {
        let (dest, temp_dir) = resolve_destination(path.as_ref())?;
        let server = server::instance()?;
        let name = file_name(&dest);

        let (receiver, call_count) = server.register(&dest, &name);
        if let Err(err) = producer::link_as_shim(&dest) {
            server.deregister(&dest);
            return Err(err.into());
        }

        let environ = vec![
            (
                mockbin_proto::ENV_SERVER.to_string(),
                server.url().to_string(),
            ),
            (
                mockbin_proto::ENV_PATH.to_string(),
                dest.to_string_lossy().into_owned(),
            ),
        ];

        Ok(Proxy {
            path: dest,
            name,
            call_count,
            environ,
            receiver: Mutex::new(Some(receiver)),
            temp_dir,
            server,
            closed: AtomicBool::new(false),
        })
    }

    /// Full path of the published executable.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Basename of the published executable.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// How many calls the server has delivered for this proxy.
    pub fn call_count(&self) -> i64 {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Environment the test must propagate in linked mode; empty for
    /// compiled mocks.
    pub fn environ(&self) -> &[(String, String)] {
        &self.environ
    }

    /// Let the server resolve this proxy when a shim declares `from`.
    pub fn alias(&self, from: impl AsRef<Path>) {
        self.server.alias(from.as_ref(), &self.path);
    }

    /// Receive the next call, blocking until one arrives. Returns `None`
    /// once the proxy is closed and the channel is drained.
    pub fn recv_call(&self) -> Option<Call> {
        let mut guard = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        guard.as_mut()?.blocking_recv()
    }

    /// Hand the delivery channel to a dispatcher.
    pub(crate) fn take_receiver(&self) -> Option<mpsc::Receiver<Call>> {
        self.receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Deregister, remove the published file, and drop the temp directory.
    /// Closing twice is fine.
    pub fn close(&mut self) -> Result<(), MockError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::debug!(target: "mockbin::proxy", path = %self.path.display(), "closing proxy");

        self.server.deregister(&self.path);
        self.receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if std::fs::symlink_metadata(&self.path).is_ok() {
            std::fs::remove_file(&self.path)?;
        }
        self.temp_dir.take();
        Ok(())
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn resolve_destination(requested: &Path) -> Result<(PathBuf, Option<TempDir>), MockError> {
    let (mut dest, temp_dir) = if requested.is_absolute() {
        (requested.to_path_buf(), None)
    } else {
        let dir = tempfile::Builder::new().prefix("mockbin").tempdir()?;
        (dir.path().join(requested), Some(dir))
    };
    if cfg!(windows) && dest.extension().is_none() {
        dest.set_extension("exe");
    }
    Ok((dest, temp_dir))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}
