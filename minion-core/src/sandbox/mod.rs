//! Disposable execution environments for running generated code.
//!
//! A [`SandboxBackend`] knows how to create, drive and destroy one kind of
//! environment; the [`SandboxPool`] keeps a few of them ready and hands each
//! one out exactly once.

pub mod docker;
pub mod local;
pub mod pool;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use minion_graphs::FileId;

use crate::config::{SandboxBackendKind, SandboxSection};
use crate::error::SandboxError;

pub use docker::DockerBackend;
pub use local::LocalBackend;
pub use pool::{PoolSettings, PoolStats, SandboxPool};

/// Exit code reported for commands killed by their timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Result of one command inside an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub elapsed_ms: u64,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }

    pub fn timed_out(timeout: Duration) -> Self {
        Self {
            exit_code: TIMEOUT_EXIT_CODE,
            stdout: String::new(),
            stderr: format!("command timed out after {}s", timeout.as_secs()),
            timed_out: true,
            elapsed_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Backend-specific reference to one provisioned environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceHandle {
    /// Unique across the process.
    pub id: String,
    /// Container id or overlay directory.
    pub location: String,
}

/// One kind of isolated environment.
#[async_trait::async_trait]
pub trait SandboxBackend: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Create an environment holding a writable copy of the snapshot.
    async fn provision(&self) -> Result<InstanceHandle, SandboxError>;

    /// Run a shell command in the writable overlay. Timeouts are reported in
    /// the output, not as errors.
    async fn exec(
        &self,
        handle: &InstanceHandle,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, SandboxError>;

    async fn write_file(
        &self,
        handle: &InstanceHandle,
        path: &FileId,
        content: &str,
    ) -> Result<(), SandboxError>;

    /// `None` when the file does not exist in the overlay.
    async fn read_file(
        &self,
        handle: &InstanceHandle,
        path: &FileId,
    ) -> Result<Option<String>, SandboxError>;

    async fn destroy(&self, handle: &InstanceHandle) -> Result<(), SandboxError>;
}

/// Build the configured backend for `snapshot_root`.
pub fn backend_from_config(
    section: &SandboxSection,
    snapshot_root: &std::path::Path,
) -> Arc<dyn SandboxBackend> {
    match section.backend {
        SandboxBackendKind::Docker => Arc::new(DockerBackend::new(snapshot_root, section)),
        SandboxBackendKind::Local => Arc::new(LocalBackend::new(snapshot_root, section)),
    }
}

/// An acquired environment. Owned by exactly one attempt; never returned to
/// the pool. Dropping an unreleased instance schedules its destruction.
pub struct SandboxInstance {
    handle: InstanceHandle,
    backend: Arc<dyn SandboxBackend>,
    pool: Arc<pool::PoolShared>,
    acquired: u32,
    released: AtomicBool,
}

impl fmt::Debug for SandboxInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxInstance")
            .field("id", &self.handle.id)
            .field("backend", &self.backend.name())
            .field("released", &self.is_released())
            .finish_non_exhaustive()
    }
}

impl SandboxInstance {
    pub(crate) fn new(
        handle: InstanceHandle,
        backend: Arc<dyn SandboxBackend>,
        pool: Arc<pool::PoolShared>,
    ) -> Self {
        Self {
            handle,
            backend,
            pool,
            acquired: 1,
            released: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.handle.id
    }

    /// Number of times this environment was handed out. Always 1.
    pub fn acquired_count(&self) -> u32 {
        self.acquired
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Flip to released; true for the caller that did it.
    pub(crate) fn mark_released(&self) -> bool {
        !self.released.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn handle(&self) -> &InstanceHandle {
        &self.handle
    }

    fn ensure_live(&self) -> Result<(), SandboxError> {
        if self.is_released() {
            Err(SandboxError::Released(self.handle.id.clone()))
        } else {
            Ok(())
        }
    }

    pub async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput, SandboxError> {
        self.ensure_live()?;
        self.backend.exec(&self.handle, command, timeout).await
    }

    pub async fn write_file(&self, path: &FileId, content: &str) -> Result<(), SandboxError> {
        self.ensure_live()?;
        self.backend.write_file(&self.handle, path, content).await
    }

    pub async fn read_file(&self, path: &FileId) -> Result<Option<String>, SandboxError> {
        self.ensure_live()?;
        self.backend.read_file(&self.handle, path).await
    }
}

/// Anything that can run a shell command in a prepared workspace. Gates and
/// command tools run through this.
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &str, timeout: Duration) -> Result<ExecOutput, SandboxError>;
}

#[async_trait::async_trait]
impl CommandRunner for SandboxInstance {
    async fn run(&self, command: &str, timeout: Duration) -> Result<ExecOutput, SandboxError> {
        self.exec(command, timeout).await
    }
}

impl Drop for SandboxInstance {
    fn drop(&mut self) {
        if self.mark_released() {
            pool::destroy_detached(&self.pool, &self.backend, self.handle.clone());
        }
    }
}

/// Shell-quote one argument for `sh -c`.
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+=:,@".contains(c))
    {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_leaves_plain_paths_alone() {
        assert_eq!(shell_quote("tests/test_cart.py"), "tests/test_cart.py");
        assert_eq!(shell_quote("my file.py"), "'my file.py'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn timeout_output_uses_conventional_exit_code() {
        let out = ExecOutput::timed_out(Duration::from_secs(5));
        assert!(!out.success());
        assert_eq!(out.exit_code, 124);
        assert!(out.stderr.contains("5s"));
    }
}
