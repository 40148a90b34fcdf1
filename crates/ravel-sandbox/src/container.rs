//! Out-of-process executor running code inside a locked-down container.
//!
//! The code is written to a scratch directory that is mounted read-only into
//! a container with no network, a read-only root filesystem, a small no-exec
//! tmpfs, dropped capabilities and explicit memory/CPU/PID quotas. On timeout
//! the process group receives SIGTERM, then SIGKILL after a grace period.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::{SandboxError, SandboxResult};
use crate::execution::{parse_output, CodeExecutor, ExecutionResult};
use crate::redact::{looks_like_secret_name, redact_secrets};

/// Runtime value that runs the command directly on the host, unconfined.
/// Meant for tests and already-isolated environments.
pub const HOST_RUNTIME: &str = "host";

/// Container invocation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Container CLI (`docker`, `podman`) or [`HOST_RUNTIME`].
    pub runtime: String,
    pub image: String,
    /// Interpreter command; the script path is appended.
    pub command: Vec<String>,
    /// Script file name inside the mounted directory.
    pub file_name: String,
    pub memory: String,
    pub cpus: String,
    pub pids_limit: u32,
    pub tmpfs_size: String,
    pub timeout_ms: u64,
    /// Wait between SIGTERM and SIGKILL.
    pub grace_ms: u64,
    /// Host variables that may be forwarded, unless they look like secrets.
    pub env_allowlist: Vec<String>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            runtime: "docker".to_string(),
            image: "python:3.12-alpine".to_string(),
            command: vec!["python3".to_string(), "-I".to_string(), "-B".to_string()],
            file_name: "main.py".to_string(),
            memory: "256m".to_string(),
            cpus: "0.5".to_string(),
            pids_limit: 64,
            tmpfs_size: "64m".to_string(),
            timeout_ms: 30_000,
            grace_ms: 2_000,
            env_allowlist: ["PATH", "LANG", "LC_ALL", "TZ", "PYTHONUNBUFFERED"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl ContainerConfig {
    /// Defaults overridden by `RAVEL_CONTAINER_*` environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        let var = |name: &str| std::env::var(format!("RAVEL_CONTAINER_{name}")).ok();
        if let Some(v) = var("RUNTIME") {
            cfg.runtime = v;
        }
        if let Some(v) = var("IMAGE") {
            cfg.image = v;
        }
        if let Some(v) = var("MEMORY") {
            cfg.memory = v;
        }
        if let Some(v) = var("CPUS") {
            cfg.cpus = v;
        }
        if let Some(v) = var("PIDS_LIMIT").and_then(|v| v.parse().ok()) {
            cfg.pids_limit = v;
        }
        if let Some(v) = var("TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            cfg.timeout_ms = v;
        }
        if let Some(v) = var("GRACE_MS").and_then(|v| v.parse().ok()) {
            cfg.grace_ms = v;
        }
        cfg
    }

    pub fn validate(&self) -> SandboxResult<()> {
        if self.command.is_empty() {
            return Err(SandboxError::InvalidConfig("command is empty".into()));
        }
        if self.file_name.is_empty() || self.file_name.contains('/') || self.file_name.contains("..") {
            return Err(SandboxError::InvalidConfig(format!(
                "file_name '{}' must be a plain file name",
                self.file_name
            )));
        }
        if self.timeout_ms == 0 {
            return Err(SandboxError::InvalidConfig("timeout_ms must be positive".into()));
        }
        if !self.is_host() && self.image.is_empty() {
            return Err(SandboxError::InvalidConfig("image is empty".into()));
        }
        Ok(())
    }

    pub fn is_host(&self) -> bool {
        self.runtime == HOST_RUNTIME
    }

    /// Program and arguments for running the script in `workdir`.
    pub fn invocation(
        &self,
        workdir: &Path,
        container_name: &str,
        env: &BTreeMap<String, String>,
    ) -> (String, Vec<String>) {
        if self.is_host() {
            let mut args: Vec<String> = self.command[1..].to_vec();
            args.push(workdir.join(&self.file_name).display().to_string());
            return (self.command[0].clone(), args);
        }

        let mut args: Vec<String> = vec![
            "run".into(),
            "--rm".into(),
            "--name".into(),
            container_name.into(),
            "--network".into(),
            "none".into(),
            "--read-only".into(),
            "--tmpfs".into(),
            format!("/tmp:rw,noexec,nosuid,nodev,size={}", self.tmpfs_size),
            "--cap-drop".into(),
            "ALL".into(),
            "--security-opt".into(),
            "no-new-privileges".into(),
            "--pids-limit".into(),
            self.pids_limit.to_string(),
            "--memory".into(),
            self.memory.clone(),
            "--memory-swap".into(),
            self.memory.clone(),
            "--cpus".into(),
            self.cpus.clone(),
            "--user".into(),
            "65534:65534".into(),
            "-v".into(),
            format!("{}:/sandbox:ro", workdir.display()),
            "-w".into(),
            "/sandbox".into(),
        ];
        for (key, value) in env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        args.push(self.image.clone());
        args.extend(self.command.iter().cloned());
        args.push(format!("/sandbox/{}", self.file_name));
        (self.runtime.clone(), args)
    }
}

/// Keep allowlisted variables whose name and value do not look like secrets.
pub fn sanitized_env<I>(vars: I, allowlist: &[String]) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    vars.into_iter()
        .filter(|(key, _)| allowlist.iter().any(|allowed| allowed == key))
        .filter(|(key, value)| {
            let secret = looks_like_secret_name(key) || redact_secrets(value) != *value;
            if secret {
                debug!(var = %key, "dropping allowlisted variable that looks like a secret");
            }
            !secret
        })
        .collect()
}

/// Runs code in a container per [`ContainerConfig`].
#[derive(Debug, Clone)]
pub struct ContainerExecutor {
    config: ContainerConfig,
}

impl ContainerExecutor {
    pub fn new(config: ContainerConfig) -> SandboxResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn from_env() -> SandboxResult<Self> {
        Self::new(ContainerConfig::from_env())
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    /// SIGTERM the process group, then SIGKILL once the grace period lapses.
    async fn terminate(&self, child: &mut Child, container_name: &str) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!(pid = pid, error = %e, "failed to send SIGTERM to process group");
            }
        }
        #[cfg(not(unix))]
        let _ = child.start_kill();

        let grace = Duration::from_millis(self.config.grace_ms);
        if tokio::time::timeout(grace, child.wait()).await.is_err() {
            #[cfg(unix)]
            if let Some(pid) = child.id() {
                use nix::sys::signal::{killpg, Signal};
                use nix::unistd::Pid;

                let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
            }
            let _ = child.start_kill();
            let _ = child.wait().await;
        }

        if !self.config.is_host() {
            // The CLI going away does not stop the container itself.
            let _ = Command::new(&self.config.runtime)
                .args(["kill", container_name])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
        }
    }
}

async fn read_stream<R: AsyncRead + Unpin>(stream: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        if let Err(e) = stream.read_to_end(&mut buf).await {
            debug!(error = %e, "failed to read child output");
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[async_trait]
impl CodeExecutor for ContainerExecutor {
    fn name(&self) -> &str {
        "container"
    }

    async fn execute(&self, code: &str) -> SandboxResult<ExecutionResult> {
        if code.trim().is_empty() {
            return Err(SandboxError::UnsafeCode {
                reason: "code is empty".to_string(),
            });
        }

        let workdir = tempfile::tempdir()?;
        tokio::fs::write(workdir.path().join(&self.config.file_name), code).await?;

        let env = sanitized_env(std::env::vars(), &self.config.env_allowlist);
        let container_name = format!("ravel-exec-{}", uuid::Uuid::new_v4().simple());
        let (program, args) = self.config.invocation(workdir.path(), &container_name, &env);

        let mut command = Command::new(&program);
        command
            .args(&args)
            .env_clear()
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let started = Instant::now();
        let mut child = command.spawn().map_err(|e| SandboxError::Spawn {
            runtime: program.clone(),
            reason: e.to_string(),
        })?;
        let stdout_task = tokio::spawn(read_stream(child.stdout.take()));
        let stderr_task = tokio::spawn(read_stream(child.stderr.take()));

        let limit = Duration::from_millis(self.config.timeout_ms);
        let status = match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!(
                    event = "sandbox.timeout",
                    executor = "container",
                    limit_ms = self.config.timeout_ms,
                );
                self.terminate(&mut child, &container_name).await;
                stdout_task.abort();
                stderr_task.abort();
                return Err(SandboxError::Timeout {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    limit_ms: self.config.timeout_ms,
                });
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        let duration_ms = started.elapsed().as_millis() as u64;

        let result = if status.success() {
            ExecutionResult::success(parse_output(&stdout), stderr)
        } else {
            let code = status.code().unwrap_or(-1);
            let message = format!("Exit code {code}: {}", stderr.trim());
            ExecutionResult::failure(redact_secrets(&message), stdout)
        };

        info!(
            event = "sandbox.executed",
            executor = "container",
            runtime = %self.config.runtime,
            duration_ms = duration_ms,
            success = !result.is_error(),
        );
        Ok(result)
    }
}
