// Docker-backed sandboxes, driven through the `docker` CLI.
//
// Each instance is a detached container with networking disabled, memory,
// CPU and pid ceilings, the snapshot bind-mounted read-only at /snapshot and
// a writable copy at the configured workdir.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use minion_graphs::FileId;

use crate::config::SandboxSection;
use crate::error::SandboxError;

use super::{ExecOutput, InstanceHandle, SandboxBackend, shell_quote};

const SNAPSHOT_MOUNT: &str = "/snapshot";
const CONTROL_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct DockerBackend {
    program: String,
    snapshot_root: PathBuf,
    image: String,
    memory: String,
    cpus: f64,
    pids_limit: u32,
    workdir: String,
    setup_command: Option<String>,
}

impl DockerBackend {
    pub fn new(snapshot_root: &Path, section: &SandboxSection) -> Self {
        Self {
            program: "docker".to_string(),
            snapshot_root: snapshot_root.to_path_buf(),
            image: section.image.clone(),
            memory: section.memory.clone(),
            cpus: section.cpus,
            pids_limit: section.pids_limit,
            workdir: section.workdir.clone(),
            setup_command: section.setup_command.clone(),
        }
    }

    /// Use another docker-compatible CLI (e.g. `podman`).
    #[must_use]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Arguments of the `docker run` that creates an instance.
    pub fn run_args(&self, name: &str) -> Vec<String> {
        vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            name.into(),
            "--network".into(),
            "none".into(),
            "--memory".into(),
            self.memory.clone(),
            "--cpus".into(),
            self.cpus.to_string(),
            "--pids-limit".into(),
            self.pids_limit.to_string(),
            "--mount".into(),
            format!(
                "type=bind,src={},dst={SNAPSHOT_MOUNT},readonly",
                self.snapshot_root.display()
            ),
            "--workdir".into(),
            self.workdir.clone(),
            self.image.clone(),
            "sleep".into(),
            "infinity".into(),
        ]
    }

    fn container_path(&self, path: &FileId) -> String {
        format!("{}/{}", self.workdir.trim_end_matches('/'), path.as_str())
    }

    async fn docker(&self, args: &[&str], timeout: Duration) -> Result<ExecOutput, SandboxError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        run_with_timeout(cmd, timeout).await
    }

    /// Remove a container that never became a usable instance.
    async fn discard(&self, container: &str) {
        if let Err(e) = self.control(&["rm", "-f", container]).await {
            warn!(container, error = %e, "Could not remove container after failed provisioning");
        }
    }

    async fn control(&self, args: &[&str]) -> Result<String, SandboxError> {
        let out = self.docker(args, CONTROL_TIMEOUT).await?;
        if out.success() {
            Ok(out.stdout.trim().to_string())
        } else {
            Err(SandboxError::Provision(format!(
                "{} {} failed: {}",
                self.program,
                args.first().copied().unwrap_or_default(),
                out.stderr.trim()
            )))
        }
    }
}

#[async_trait::async_trait]
#[allow(clippy::unnecessary_literal_bound)]
impl SandboxBackend for DockerBackend {
    fn name(&self) -> &str {
        "docker"
    }

    async fn provision(&self) -> Result<InstanceHandle, SandboxError> {
        let name = format!("minion-sbx-{}", uuid::Uuid::new_v4().simple());
        let args = self.run_args(&name);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let container = match self.control(&arg_refs).await {
            Ok(container) => container,
            Err(e) => {
                // A timed-out or failed `run` may still have created it.
                self.discard(&name).await;
                return Err(e);
            }
        };

        let handle = InstanceHandle {
            id: name,
            location: container,
        };
        let mut prepare = format!(
            "mkdir -p {dir} && cp -a {SNAPSHOT_MOUNT}/. {dir}/",
            dir = shell_quote(&self.workdir)
        );
        if let Some(setup) = &self.setup_command {
            prepare = format!("{prepare} && {setup}");
        }
        let out = match self.exec(&handle, &prepare, CONTROL_TIMEOUT).await {
            Ok(out) => out,
            Err(e) => {
                self.discard(&handle.location).await;
                return Err(e);
            }
        };
        if !out.success() {
            self.discard(&handle.location).await;
            return Err(SandboxError::Provision(format!(
                "preparing workspace failed: {}",
                out.stderr.trim()
            )));
        }
        debug!(instance = %handle.id, "Docker sandbox provisioned");
        Ok(handle)
    }

    async fn exec(
        &self,
        handle: &InstanceHandle,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, SandboxError> {
        self.docker(
            &[
                "exec",
                "-w",
                self.workdir.as_str(),
                handle.location.as_str(),
                "sh",
                "-c",
                command,
            ],
            timeout,
        )
        .await
    }

    async fn write_file(
        &self,
        handle: &InstanceHandle,
        path: &FileId,
        content: &str,
    ) -> Result<(), SandboxError> {
        let target = self.container_path(path);
        let mut cmd = Command::new(&self.program);
        cmd.args([
            "exec",
            "-i",
            handle.location.as_str(),
            "sh",
            "-c",
            r#"mkdir -p "$(dirname "$1")" && cat > "$1""#,
            "sh",
            target.as_str(),
        ])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| SandboxError::Exec(e.to_string()))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(content.as_bytes()).await?;
            stdin.shutdown().await?;
        }
        let out = child.wait_with_output().await?;
        if out.status.success() {
            Ok(())
        } else {
            Err(SandboxError::Exec(format!(
                "writing {path} failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            )))
        }
    }

    async fn read_file(
        &self,
        handle: &InstanceHandle,
        path: &FileId,
    ) -> Result<Option<String>, SandboxError> {
        let target = self.container_path(path);
        let out = self
            .docker(
                &["exec", handle.location.as_str(), "cat", target.as_str()],
                CONTROL_TIMEOUT,
            )
            .await?;
        Ok(out.success().then_some(out.stdout))
    }

    async fn destroy(&self, handle: &InstanceHandle) -> Result<(), SandboxError> {
        self.control(&["rm", "-f", handle.location.as_str()]).await?;
        debug!(instance = %handle.id, "Docker sandbox destroyed");
        Ok(())
    }
}

/// Spawn `cmd`, collect its output, and kill it when `timeout` elapses.
pub(crate) async fn run_with_timeout(
    mut cmd: Command,
    timeout: Duration,
) -> Result<ExecOutput, SandboxError> {
    let started = Instant::now();
    let child = cmd.spawn().map_err(|e| SandboxError::Exec(e.to_string()))?;
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(out)) => Ok(ExecOutput {
            exit_code: out.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            timed_out: false,
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        }),
        Ok(Err(e)) => Err(SandboxError::Exec(e.to_string())),
        // The child is killed when its future is dropped (kill_on_drop).
        Err(_) => Ok(ExecOutput::timed_out(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_args_isolate_the_container() {
        let section = SandboxSection::default();
        let backend = DockerBackend::new(Path::new("/repo"), &section);
        let args = backend.run_args("minion-sbx-1");
        let joined = args.join(" ");

        assert!(joined.contains("--network none"));
        assert!(joined.contains("--memory 512m"));
        assert!(joined.contains("--cpus 0.5"));
        assert!(joined.contains("--pids-limit 256"));
        assert!(joined.contains("type=bind,src=/repo,dst=/snapshot,readonly"));
        assert!(joined.contains("python:3.11-slim sleep infinity"));
    }

    #[test]
    fn container_paths_live_under_workdir() {
        let section = SandboxSection {
            workdir: "/workspace/".into(),
            ..SandboxSection::default()
        };
        let backend = DockerBackend::new(Path::new("/repo"), &section);
        assert_eq!(
            backend.container_path(&FileId::new("app/cart.py")),
            "/workspace/app/cart.py"
        );
    }

    /// A docker stand-in that logs its arguments and fails `run` or `exec`
    /// with the given exit codes.
    #[cfg(unix)]
    fn fake_docker(dir: &Path, run_exit: i32, exec_exit: i32) -> (String, PathBuf) {
        use std::os::unix::fs::PermissionsExt;

        let log = dir.join("docker.log");
        let script = dir.join("docker");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\necho \"$@\" >> '{log}'\ncase \"$1\" in\n  run) [ {run_exit} -eq 0 ] && echo cid-1; [ {run_exit} -eq 0 ] || echo 'run failed' >&2; exit {run_exit} ;;\n  exec) exit {exec_exit} ;;\n  *) exit 0 ;;\nesac\n",
                log = log.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        (script.display().to_string(), log)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_run_removes_the_named_container() {
        let dir = tempfile::tempdir().unwrap();
        let (program, log) = fake_docker(dir.path(), 1, 0);
        let backend = DockerBackend::new(Path::new("/repo"), &SandboxSection::default())
            .with_program(program);

        let err = backend.provision().await.unwrap_err();
        assert!(matches!(err, SandboxError::Provision(_)));

        let log = std::fs::read_to_string(log).unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 2, "{log}");
        let name = lines[0].split_whitespace().nth(3).unwrap();
        assert!(name.starts_with("minion-sbx-"));
        assert_eq!(lines[1], format!("rm -f {name}"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_workspace_copy_removes_the_container() {
        let dir = tempfile::tempdir().unwrap();
        let (program, log) = fake_docker(dir.path(), 0, 1);
        let backend = DockerBackend::new(Path::new("/repo"), &SandboxSection::default())
            .with_program(program);

        let err = backend.provision().await.unwrap_err();
        assert!(matches!(err, SandboxError::Provision(_)));

        let log = std::fs::read_to_string(log).unwrap();
        assert!(log.lines().any(|l| l.starts_with("exec ")));
        assert_eq!(log.lines().last(), Some("rm -f cid-1"));
    }

    #[tokio::test]
    async fn missing_cli_is_an_exec_error() {
        let backend = DockerBackend::new(Path::new("/repo"), &SandboxSection::default())
            .with_program("minion-no-such-docker-binary");
        let err = backend.provision().await.unwrap_err();
        assert!(matches!(err, SandboxError::Exec(_)));
    }
}
