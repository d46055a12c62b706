//! Error taxonomy shared across the VirtualBox management server.
//!
//! `ErrorKind` is the stable, wire-serializable classification from the
//! error envelope; `McpError` is the in-process error type that carries it
//! plus a human message and optional diagnostic detail.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Result type used throughout the server.
pub type McpResult<T> = Result<T, McpError>;

/// Stable error classification. Kinds never change meaning across releases;
/// only `message`/`detail` are advisory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ErrorKind {
    /// Requested entity does not exist.
    NotFound,
    /// The name given resolves to more than one VM.
    Ambiguous,
    /// Create/register would collide with an existing entity.
    AlreadyExists,
    /// Current state forbids the requested transition.
    InvalidState,
    /// Caller-supplied arguments fail validation.
    InvalidArgument,
    /// A referenced disk/ISO path is not registered or missing.
    MediumNotFound,
    /// Filesystem or VirtualBox refused access.
    PermissionDenied,
    /// Operation exceeded its deadline.
    Timeout,
    /// Operation was cancelled by the caller.
    Cancelled,
    /// VBoxManage returned non-zero with no recognized signature.
    VBoxError,
    /// VBoxManage output could not be understood structurally.
    ParseError,
    /// Programming defects in the server itself; must never reach a
    /// healthy client.
    InternalError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Diagnostic detail attached to a failure, when available.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub exit_code: Option<i32>,
    pub stderr_tail: Option<String>,
}

/// The server's in-process error type.
///
/// Carries an [`ErrorKind`] for wire serialization plus a human-readable
/// message and optional [`ErrorDetail`] for diagnostics.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct McpError {
    pub kind: ErrorKind,
    pub message: String,
    pub detail: Option<ErrorDetail>,
}

impl McpError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: ErrorDetail) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn ambiguous(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Ambiguous, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyExists, message)
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidState, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }

    pub fn vbox_error(exit_code: i32, stderr_tail: impl Into<String>) -> Self {
        let tail = stderr_tail.into();
        Self::new(ErrorKind::VBoxError, format!("VBoxManage exited {exit_code}"))
            .with_detail(ErrorDetail {
                exit_code: Some(exit_code),
                stderr_tail: Some(tail),
            })
    }
}

impl From<std::io::Error> for McpError {
    fn from(err: std::io::Error) -> Self {
        McpError::new(ErrorKind::InternalError, format!("I/O error: {err}"))
    }
}

impl From<serde_json::Error> for McpError {
    fn from(err: serde_json::Error) -> Self {
        McpError::new(ErrorKind::ParseError, format!("JSON error: {err}"))
    }
}

impl From<tokio::time::error::Elapsed> for McpError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        McpError::new(ErrorKind::Timeout, "operation exceeded its deadline")
    }
}
