//! Process Runner — spawns `VBoxManage` and captures its output.
//!
//! Contract per `spec.md` §4.A: every argument is a distinct array element
//! (never a joined command string), the runner does not inherit the
//! parent's stdio, and every invocation honors a timeout and a
//! cancellation token.

mod runner;

pub use runner::TokioProcessRunner;

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use vbox_mcp_shared::errors::{ErrorKind, McpError, McpResult};

/// Captured result of a completed (non-timed-out, non-cancelled) invocation.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration: Duration,
}

impl ProcessOutput {
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Abstracts spawning the `VBoxManage` binary so the orchestrator can be
/// tested without a real VirtualBox installation.
///
/// Implementors must never build a shell command line — `args` is always
/// passed as a vector of distinct process arguments.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(
        &self,
        binary: &std::path::Path,
        args: &[String],
        stdin: Option<&[u8]>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> McpResult<ProcessOutput>;
}

/// Classify a runner-level failure that isn't a VBoxManage exit status —
/// `BinaryNotFound`, `SpawnFailed`, `Timeout`, `Cancelled` from §4.A.
pub(crate) fn binary_not_found(binary: &std::path::Path) -> McpError {
    McpError::new(
        ErrorKind::InternalError,
        format!(
            "VBoxManage binary not found or not executable at {}",
            binary.display()
        ),
    )
}

pub(crate) fn spawn_failed(binary: &std::path::Path, source: std::io::Error) -> McpError {
    McpError::new(
        ErrorKind::InternalError,
        format!("failed to spawn {}: {}", binary.display(), source),
    )
}

pub(crate) fn timeout_error() -> McpError {
    McpError::new(ErrorKind::Timeout, "VBoxManage invocation exceeded its deadline")
}

pub(crate) fn cancelled_error() -> McpError {
    McpError::new(ErrorKind::Cancelled, "VBoxManage invocation was cancelled")
}
