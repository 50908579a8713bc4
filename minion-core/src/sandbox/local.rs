// Host-local sandboxes: a private copy of the snapshot in a temporary
// directory, commands run with `sh -c` inside it. No network or resource
// isolation; meant for development machines without docker.

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

use minion_graphs::FileId;

use crate::config::SandboxSection;
use crate::error::SandboxError;

use super::docker::run_with_timeout;
use super::{ExecOutput, InstanceHandle, SandboxBackend};

/// Top-level directories never copied into an overlay.
const SKIPPED_DIRS: &[&str] = &[".git", ".minion"];

#[derive(Debug, Clone)]
pub struct LocalBackend {
    snapshot_root: PathBuf,
    base_dir: PathBuf,
    setup_command: Option<String>,
}

impl LocalBackend {
    pub fn new(snapshot_root: &Path, section: &SandboxSection) -> Self {
        warn!("Local sandbox backend selected: generated code runs without network or resource isolation");
        Self {
            snapshot_root: snapshot_root.to_path_buf(),
            base_dir: std::env::temp_dir(),
            setup_command: section.setup_command.clone(),
        }
    }

    /// Create overlays under `dir` instead of the system temp directory.
    #[must_use]
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = dir.into();
        self
    }

    fn overlay_path(handle: &InstanceHandle, path: &FileId) -> Result<PathBuf, SandboxError> {
        let rel = Path::new(path.as_str());
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(SandboxError::Exec(format!("path escapes the overlay: {path}")));
        }
        Ok(Path::new(&handle.location).join(rel))
    }
}

#[async_trait::async_trait]
#[allow(clippy::unnecessary_literal_bound)]
impl SandboxBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    async fn provision(&self) -> Result<InstanceHandle, SandboxError> {
        let id = format!("minion-sbx-{}", uuid::Uuid::new_v4().simple());
        let overlay = self.base_dir.join(&id);
        let src = self.snapshot_root.clone();
        let dst = overlay.clone();
        tokio::task::spawn_blocking(move || copy_tree(&src, &dst, true))
            .await
            .map_err(|e| SandboxError::Provision(format!("copy task failed: {e}")))?
            .map_err(|e| SandboxError::Provision(format!("copying snapshot failed: {e}")))?;

        let handle = InstanceHandle {
            id,
            location: overlay.to_string_lossy().into_owned(),
        };
        if let Some(setup) = &self.setup_command {
            let out = self
                .exec(&handle, setup, Duration::from_secs(600))
                .await?;
            if !out.success() {
                let _ = self.destroy(&handle).await;
                return Err(SandboxError::Provision(format!(
                    "setup command failed: {}",
                    out.stderr.trim()
                )));
            }
        }
        debug!(instance = %handle.id, overlay = %handle.location, "Local sandbox provisioned");
        Ok(handle)
    }

    async fn exec(
        &self,
        handle: &InstanceHandle,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, SandboxError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&handle.location)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        run_with_timeout(cmd, timeout).await
    }

    async fn write_file(
        &self,
        handle: &InstanceHandle,
        path: &FileId,
        content: &str,
    ) -> Result<(), SandboxError> {
        let target = Self::overlay_path(handle, path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, content).await?;
        Ok(())
    }

    async fn read_file(
        &self,
        handle: &InstanceHandle,
        path: &FileId,
    ) -> Result<Option<String>, SandboxError> {
        let target = Self::overlay_path(handle, path)?;
        match tokio::fs::read_to_string(&target).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn destroy(&self, handle: &InstanceHandle) -> Result<(), SandboxError> {
        match tokio::fs::remove_dir_all(&handle.location).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        debug!(instance = %handle.id, "Local sandbox destroyed");
        Ok(())
    }
}

/// Recursively copy regular files and directories; symlinks are skipped.
fn copy_tree(src: &Path, dst: &Path, top: bool) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        if top && SKIPPED_DIRS.iter().any(|d| name == *d) {
            continue;
        }
        let file_type = entry.file_type()?;
        let target = dst.join(&name);
        if file_type.is_dir() {
            copy_tree(&entry.path(), &target, false)?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(snapshot: &Path, base: &Path) -> LocalBackend {
        LocalBackend::new(snapshot, &SandboxSection::default()).with_base_dir(base)
    }

    #[tokio::test]
    async fn overlay_is_a_private_copy() {
        let snapshot = tempfile::tempdir().unwrap();
        let base = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(snapshot.path().join("app")).unwrap();
        std::fs::write(snapshot.path().join("app/cart.py"), "TOTAL = 1\n").unwrap();
        std::fs::create_dir_all(snapshot.path().join(".git")).unwrap();

        let backend = backend(snapshot.path(), base.path());
        let handle = backend.provision().await.unwrap();
        let file = FileId::new("app/cart.py");

        assert_eq!(
            backend.read_file(&handle, &file).await.unwrap().as_deref(),
            Some("TOTAL = 1\n")
        );
        assert!(!Path::new(&handle.location).join(".git").exists());

        backend.write_file(&handle, &file, "TOTAL = 2\n").await.unwrap();
        assert_eq!(
            std::fs::read_to_string(snapshot.path().join("app/cart.py")).unwrap(),
            "TOTAL = 1\n"
        );

        let out = backend
            .exec(&handle, "cat app/cart.py", Duration::from_secs(10))
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "TOTAL = 2\n");

        backend.destroy(&handle).await.unwrap();
        assert!(!Path::new(&handle.location).exists());
        backend.destroy(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn commands_are_killed_at_timeout() {
        let snapshot = tempfile::tempdir().unwrap();
        let base = tempfile::tempdir().unwrap();
        let backend = backend(snapshot.path(), base.path());
        let handle = backend.provision().await.unwrap();

        let out = backend
            .exec(&handle, "sleep 5", Duration::from_millis(100))
            .await
            .unwrap();
        assert!(out.timed_out);
        assert_eq!(out.exit_code, 124);
        backend.destroy(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn parent_paths_are_refused() {
        let snapshot = tempfile::tempdir().unwrap();
        let base = tempfile::tempdir().unwrap();
        let backend = backend(snapshot.path(), base.path());
        let handle = backend.provision().await.unwrap();
        let err = backend
            .write_file(&handle, &FileId::new("../outside.py"), "x")
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Exec(_)));
        backend.destroy(&handle).await.unwrap();
    }
}
