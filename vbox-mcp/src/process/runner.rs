//! Production [`ProcessRunner`] backed by `tokio::process`.

use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use vbox_mcp_shared::constants::timeouts;
use vbox_mcp_shared::errors::McpResult;

use super::{ProcessOutput, ProcessRunner, binary_not_found, cancelled_error, spawn_failed, timeout_error};

/// Spawns `VBoxManage` with a whitelisted environment and piped stdio.
///
/// Never inherits the parent's stdin/stdout/stderr (`spec.md` §4.A "Side
/// effects"); the working directory is fixed to the system temp directory
/// so the caller can never influence it via a relative path.
#[derive(Debug, Default)]
pub struct TokioProcessRunner;

impl TokioProcessRunner {
    pub fn new() -> Self {
        Self
    }

    fn build_command(binary: &Path, args: &[String]) -> Command {
        let mut cmd = Command::new(binary);
        cmd.args(args);
        cmd.current_dir(std::env::temp_dir());
        cmd.env_clear();

        // Environment whitelist per spec.md §4.A: forward only what
        // VBoxManage needs to find itself and produce deterministic output.
        for key in ["VBOX_INSTALL_PATH", "VBOX_USER_HOME", "PATH", "HOME"] {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        cmd.env("LANG", "C");
        cmd.env("LC_ALL", "C");

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd
    }
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(
        &self,
        binary: &Path,
        args: &[String],
        stdin: Option<&[u8]>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> McpResult<ProcessOutput> {
        tracing::debug!(binary = %binary.display(), ?args, "spawning VBoxManage");

        let mut child = Self::build_command(binary, args).spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                binary_not_found(binary)
            } else {
                spawn_failed(binary, e)
            }
        })?;

        if let Some(payload) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                let _ = pipe.write_all(payload).await;
            }
        }
        // Drop stdin (whether or not we wrote to it) so the child sees EOF
        // rather than blocking on a read that will never come.
        drop(child.stdin.take());

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stdout_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });

        let started = Instant::now();

        let outcome = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                terminate_with_grace(&mut child).await;
                Err(cancelled_error())
            }

            result = child.wait() => {
                result.map_err(|e| spawn_failed(binary, e))
                    .map(|status| status.code().unwrap_or(-1))
            }

            _ = tokio::time::sleep(timeout) => {
                terminate_with_grace(&mut child).await;
                Err(timeout_error())
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        let exit_code = outcome?;

        Ok(ProcessOutput {
            exit_code,
            stdout,
            stderr,
            duration: started.elapsed(),
        })
    }
}

/// Send the platform terminate signal, then escalate to kill after the
/// configured grace period if the child is still alive.
async fn terminate_with_grace(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }

    let grace = Duration::from_secs(timeouts::CANCEL_GRACE_SECS);
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vbox_mcp_shared::errors::ErrorKind;

    #[tokio::test]
    async fn missing_binary_is_distinguished_from_a_generic_spawn_failure() {
        let runner = TokioProcessRunner::new();
        let err = runner
            .run(
                Path::new("/definitely/not/a/real/path/VBoxManage"),
                &[],
                None,
                Duration::from_secs(5),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InternalError);
        assert!(err.message.contains("not found or not executable"), "message was: {}", err.message);
    }
}
