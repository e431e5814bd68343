// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Publishing a relay executable at a destination path.
//!
//! Cargo already built the relay (the `mockbin-shim` bin target); producing
//! a mock means stamping a copy of it with the server URL and proxy identity
//! and publishing that copy at the requested path. Stamped copies are
//! written once into a process-wide cache keyed by a content hash, and the
//! destination is switched over by renaming a randomly-suffixed symlink, so
//! a binary is never written while something may be executing it.

use mockbin_proto::{stamp, ShimConfig};
use once_cell::sync::OnceCell;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Once;
use tempfile::TempDir;
use thiserror::Error;

/// Environment override for the relay binary location.
pub const ENV_SHIM: &str = "MOCKBIN_SHIM";

#[derive(Debug, Error)]
pub enum ProduceError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error(
        "relay binary not found; build it with `cargo build -p mockbin --bin mockbin-shim` \
         or point {ENV_SHIM} at it"
    )]
    ShimNotFound,
    #[error("building the relay binary failed: {0}")]
    BuildFailed(String),
}

/// The substituted variables a produced executable carries.
pub(crate) struct ShimVars {
    pub server_url: String,
    pub proxy_path: PathBuf,
}

impl ShimVars {
    fn config(&self) -> ShimConfig {
        ShimConfig {
            server_url: self.server_url.clone(),
            path: self.proxy_path.to_string_lossy().into_owned(),
        }
    }
}

/// Produce an executable at `dest` that relays invocations for `vars`.
pub(crate) fn produce(dest: &Path, vars: &ShimVars) -> Result<(), ProduceError> {
    let template = locate_shim()?;
    let template_bytes = std::fs::read(&template)?;

    let cache = cache()?;
    let cached = cache.path().join(cache_key(&template_bytes, vars));
    if !cached.exists() {
        let mut stamped = template_bytes;
        stamp::append(&mut stamped, &vars.config())
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        write_executable_once(&cached, &stamped)?;
        tracing::debug!(
            target: "mockbin::producer",
            cached = %cached.display(),
            "stamped relay binary"
        );
    }

    publish(&cached, dest)?;
    tracing::debug!(
        target: "mockbin::producer",
        dest = %dest.display(),
        "published mock executable"
    );
    Ok(())
}

/// Publish the current executable at `dest` for linked mode; the caller
/// provides the config through the environment instead of a stamp.
pub(crate) fn link_as_shim(dest: &Path) -> Result<(), ProduceError> {
    let exe = std::env::current_exe()?;
    if std::fs::symlink_metadata(dest).is_ok() {
        std::fs::remove_file(dest)?;
    }
    if std::fs::hard_link(&exe, dest).is_err() {
        std::fs::copy(&exe, dest)?;
        make_executable(dest)?;
    }
    tracing::debug!(
        target: "mockbin::producer",
        dest = %dest.display(),
        "linked test binary as shim"
    );
    Ok(())
}

static CACHE: OnceCell<TempDir> = OnceCell::new();

/// Process-wide cache directory for stamped binaries. Lives until process
/// exit, like the temp dirs of the mocks it backs.
fn cache() -> Result<&'static TempDir, ProduceError> {
    Ok(CACHE.get_or_try_init(|| {
        tempfile::Builder::new().prefix("mockbin-cache").tempdir()
    })?)
}

/// Cache key: content hash of the relay plus the substituted variables.
fn cache_key(template: &[u8], vars: &ShimVars) -> String {
    let mut hasher = Sha256::new();
    hasher.update(template);
    hasher.update(vars.server_url.as_bytes());
    hasher.update(vars.proxy_path.to_string_lossy().as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// Write `bytes` at `path` exactly once: temp name, permissions, rename.
fn write_executable_once(path: &Path, bytes: &[u8]) -> Result<(), ProduceError> {
    let staged = suffixed(path);
    std::fs::write(&staged, bytes)?;
    make_executable(&staged)?;
    std::fs::rename(&staged, path)?;
    Ok(())
}

fn make_executable(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

/// Atomically point `dest` at the cached binary.
#[cfg(unix)]
fn publish(cached: &Path, dest: &Path) -> Result<(), ProduceError> {
    let staged = suffixed(dest);
    std::os::unix::fs::symlink(cached, &staged)?;
    std::fs::rename(&staged, dest)?;
    Ok(())
}

#[cfg(not(unix))]
fn publish(cached: &Path, dest: &Path) -> Result<(), ProduceError> {
    if std::fs::symlink_metadata(dest).is_ok() {
        std::fs::remove_file(dest)?;
    }
    std::fs::copy(cached, dest)?;
    Ok(())
}

fn suffixed(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{:08x}", rand::thread_rng().gen::<u32>()));
    path.with_file_name(name)
}

fn shim_file_name() -> &'static str {
    if cfg!(windows) {
        "mockbin-shim.exe"
    } else {
        "mockbin-shim"
    }
}

/// Find the relay binary: explicit override, then the target directory near
/// the current executable, then one `cargo build` attempt.
pub(crate) fn locate_shim() -> Result<PathBuf, ProduceError> {
    if let Some(overridden) = std::env::var_os(ENV_SHIM) {
        let path = PathBuf::from(overridden);
        if path.is_file() {
            return Ok(path);
        }
        return Err(ProduceError::ShimNotFound);
    }

    if let Some(found) = scan_target_dir() {
        return Ok(found);
    }

    build_shim()?;
    scan_target_dir().ok_or(ProduceError::ShimNotFound)
}

/// Test binaries live in `target/<profile>/deps`; the relay lands next to
/// them in `target/<profile>`. Walk a few levels up to cover both.
fn scan_target_dir() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let mut dir = exe.parent()?;
    for _ in 0..3 {
        let candidate = dir.join(shim_file_name());
        if candidate.is_file() {
            return Some(candidate);
        }
        dir = dir.parent()?;
    }
    None
}

/// One attempt per process to build the relay via cargo.
fn build_shim() -> Result<(), ProduceError> {
    static BUILD_ONCE: Once = Once::new();
    let mut outcome = Ok(());
    BUILD_ONCE.call_once(|| {
        let cargo = std::env::var("CARGO").unwrap_or_else(|_| "cargo".to_string());
        tracing::debug!(target: "mockbin::producer", %cargo, "building relay binary");
        let result = Command::new(cargo)
            .args(["build", "-p", "mockbin", "--bin", "mockbin-shim"])
            .current_dir(env!("CARGO_MANIFEST_DIR"))
            .output();
        outcome = match result {
            Ok(output) if output.status.success() => Ok(()),
            Ok(output) => Err(ProduceError::BuildFailed(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            )),
            Err(err) => Err(ProduceError::BuildFailed(err.to_string())),
        };
    });
    outcome
}
