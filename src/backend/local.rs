//! Local process backend.
//!
//! Runs helper commands through `tokio::process` and starts user tasks as
//! plain detached children so the watchdog can reap them with `waitpid`.

use std::io;
use std::path::Path;
use std::process::{Child, Stdio};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use super::{ExecutionResult, ProcessRunner};

/// Backend that runs programs directly on this host.
#[derive(Debug, Default, Clone)]
pub struct LocalRunner {}

impl LocalRunner {
    #[must_use]
    pub const fn new() -> Self {
        Self {}
    }
}

#[async_trait]
impl ProcessRunner for LocalRunner {
    #[instrument(skip(self, program, args), fields(program = %program.display()))]
    async fn run(
        &self,
        program: &Path,
        args: &[String],
        timeout: Duration,
    ) -> Result<ExecutionResult> {
        debug!(?args, "Running command");

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", program.display()))?;

        // Take pipe handles out so `child` stays in scope for kill-on-timeout
        let mut child_stdout = child.stdout.take().context("Failed to open stdout")?;
        let mut child_stderr = child.stderr.take().context("Failed to open stderr")?;

        let read_all = async {
            let mut stdout_buf = Vec::new();
            let mut stderr_buf = Vec::new();
            let (r1, r2) = tokio::join!(
                child_stdout.read_to_end(&mut stdout_buf),
                child_stderr.read_to_end(&mut stderr_buf),
            );
            r1.context("Failed to read stdout")?;
            r2.context("Failed to read stderr")?;
            Ok::<_, anyhow::Error>((stdout_buf, stderr_buf))
        };

        let (stdout_buf, stderr_buf) =
            if let Ok(result) = tokio::time::timeout(timeout, read_all).await {
                result?
            } else {
                let _ = child.kill().await;
                anyhow::bail!(
                    "{} timed out after {}s",
                    program.display(),
                    timeout.as_secs_f64()
                );
            };

        let status = child.wait().await.context("Failed to wait for process")?;

        let result = ExecutionResult {
            exit_code: status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&stdout_buf).into_owned(),
            stderr: String::from_utf8_lossy(&stderr_buf).into_owned(),
        };

        debug!(exit_code = result.exit_code, "Command completed");

        Ok(result)
    }

    #[instrument(skip(self, program, args), fields(program = %program.display()))]
    async fn spawn(&self, program: &Path, args: &[String], timeout: Duration) -> Result<u32> {
        let label = program.display().to_string();
        let mut cmd = std::process::Command::new(program);
        cmd.args(args).stdin(Stdio::null());

        // std's Child neither kills nor reaps on drop, which leaves the pid
        // to the watchdog. tokio's would hand it to its own orphan reaper.
        let mut start = tokio::task::spawn_blocking(move || cmd.spawn());

        let pid = match tokio::time::timeout(timeout, &mut start).await {
            Ok(joined) => joined
                .context("Spawn task failed")?
                .with_context(|| format!("Failed to start {label}"))?
                .id(),
            Err(_) => {
                // The blocking spawn cannot be cancelled; nobody would watch
                // a child it still manages to start.
                reap_abandoned(start);
                bail!("Starting {label} timed out after {}s", timeout.as_secs_f64());
            }
        };

        debug!(pid, "Process started");
        Ok(pid)
    }
}

/// Kill and reap a child whose spawn finished after its caller gave up.
/// Resolves to the pid of that child, if one was started.
fn reap_abandoned(start: JoinHandle<io::Result<Child>>) -> JoinHandle<Option<u32>> {
    tokio::spawn(async move {
        let mut child = start.await.ok()?.ok()?;
        let pid = child.id();
        warn!(pid, "Process started after its spawn timed out, killing it");
        let reaped = tokio::task::spawn_blocking(move || {
            // already exited is fine, wait still reaps it
            let _ = child.kill();
            child.wait()
        })
        .await;
        if let Ok(Err(e)) = reaped {
            warn!(pid, error = %e, "Failed to reap abandoned process");
        }
        Some(pid)
    })
}
