//! Error Classifier — `spec.md` §4.C.
//!
//! Maps a completed `VBoxManage` invocation (exit code + captured stderr)
//! onto the error taxonomy in [`vbox_mcp_shared::errors::ErrorKind`]. This
//! is a pure function: no process spawning, no locking, easy to exercise
//! with recorded stderr fixtures.

use vbox_mcp_shared::errors::{ErrorDetail, ErrorKind, McpError};

/// Classify a non-zero `VBoxManage` exit into the taxonomy, matching on
/// the stable substrings VBoxManage's English-locale error messages carry
/// (the runner forces `LANG=C` precisely so these matches hold).
pub fn classify(exit_code: i32, stdout: &str, stderr: &str) -> McpError {
    let haystack = stderr;
    let kind = classify_kind(haystack, stdout);

    let message =
        first_meaningful_line(stderr).unwrap_or_else(|| format!("VBoxManage exited with status {exit_code}"));

    McpError::new(kind, message).with_detail(ErrorDetail {
        exit_code: Some(exit_code),
        stderr_tail: Some(tail(stderr, 4096)),
    })
}

fn classify_kind(stderr: &str, stdout: &str) -> ErrorKind {
    let combined = format!("{stderr}\n{stdout}");

    if contains_any(
        &combined,
        &[
            "Could not find a medium",
            "Could not find a hard disk",
            "Could not find file",
            "VERR_FILE_NOT_FOUND",
        ],
    ) {
        return ErrorKind::MediumNotFound;
    }

    if contains_any(
        &combined,
        &[
            "Could not find a registered machine",
            "Could not find a snapshot",
            "VBOX_E_OBJECT_NOT_FOUND",
        ],
    ) {
        return ErrorKind::NotFound;
    }

    if contains_any(
        &combined,
        &["more than one matching", "ambiguous", "VBOX_E_INVALID_OBJECT_STATE and more than one"],
    ) {
        return ErrorKind::Ambiguous;
    }

    if contains_any(
        &combined,
        &[
            "already exists",
            "already in use",
            "VBOX_E_FILE_ERROR",
            "already locked",
            "VERR_ALREADY_EXISTS",
        ],
    ) {
        return ErrorKind::AlreadyExists;
    }

    if contains_any(
        &combined,
        &[
            "is not currently running",
            "is already running",
            "is already locked",
            "Invalid machine state",
            "VBOX_E_INVALID_VM_STATE",
            "VBOX_E_INVALID_OBJECT_STATE",
            "is not in a state",
            "Machine currently locked",
        ],
    ) {
        return ErrorKind::InvalidState;
    }

    if contains_any(
        &combined,
        &[
            "Invalid parameter",
            "Syntax error",
            "Unknown option",
            "E_INVALIDARG",
            "is not a valid",
        ],
    ) {
        return ErrorKind::InvalidArgument;
    }

    if contains_any(
        &combined,
        &[
            "Permission denied",
            "Access is denied",
            "VBOX_E_ACCESS_DENIED",
            "VERR_ACCESS_DENIED",
            "insufficient privileges",
        ],
    ) {
        return ErrorKind::PermissionDenied;
    }

    ErrorKind::VBoxError
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

/// The first non-blank stderr line, used as the human-readable message —
/// VBoxManage's most specific diagnostic is almost always its first line.
fn first_meaningful_line(stderr: &str) -> Option<String> {
    stderr
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

/// Cap the retained stderr to the last `max_len` bytes (on a char boundary)
/// so a runaway diagnostic can't balloon the error payload.
fn tail(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let start = s.len() - max_len;
    let boundary = (start..s.len()).find(|&i| s.is_char_boundary(i)).unwrap_or(start);
    s[boundary..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_when_machine_missing() {
        let err = classify(1, "", "VBoxManage: error: Could not find a registered machine named 'foo'\n");
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[test]
    fn medium_not_found_is_distinguished_from_generic_not_found() {
        let err = classify(1, "", "VBoxManage: error: Could not find a hard disk with UUID {...}\n");
        assert_eq!(err.kind, ErrorKind::MediumNotFound);
    }

    #[test]
    fn invalid_state_when_machine_not_running() {
        let err = classify(1, "", "VBoxManage: error: The virtual machine is not currently running\n");
        assert_eq!(err.kind, ErrorKind::InvalidState);
    }

    #[test]
    fn already_exists_when_name_taken() {
        let err = classify(1, "", "VBoxManage: error: Machine 'demo' already exists\n");
        assert_eq!(err.kind, ErrorKind::AlreadyExists);
    }

    #[test]
    fn permission_denied_is_classified() {
        let err = classify(1, "", "VBoxManage: error: Permission denied accessing the disk image\n");
        assert_eq!(err.kind, ErrorKind::PermissionDenied);
    }

    #[test]
    fn could_not_find_file_is_a_medium_not_found_not_a_generic_not_found() {
        let err = classify(1, "", "VBoxManage: error: Could not find file 'missing.iso'\n");
        assert_eq!(err.kind, ErrorKind::MediumNotFound);
    }

    #[test]
    fn invalid_object_state_code_is_classified_as_invalid_state() {
        let err = classify(1, "", "VBoxManage: error: Details: code VBOX_E_INVALID_OBJECT_STATE\n");
        assert_eq!(err.kind, ErrorKind::InvalidState);
    }

    #[test]
    fn already_running_is_classified_as_invalid_state() {
        let err = classify(1, "", "VBoxManage: error: The virtual machine is already running\n");
        assert_eq!(err.kind, ErrorKind::InvalidState);
    }

    #[test]
    fn verr_already_exists_is_classified() {
        let err = classify(1, "", "VBoxManage: error: Details: code VERR_ALREADY_EXISTS\n");
        assert_eq!(err.kind, ErrorKind::AlreadyExists);
    }

    #[test]
    fn verr_file_not_found_is_a_medium_not_found() {
        let err = classify(1, "", "VBoxManage: error: Details: code VERR_FILE_NOT_FOUND\n");
        assert_eq!(err.kind, ErrorKind::MediumNotFound);
    }

    #[test]
    fn verr_access_denied_is_classified_as_permission_denied() {
        let err = classify(1, "", "VBoxManage: error: Details: code VERR_ACCESS_DENIED\n");
        assert_eq!(err.kind, ErrorKind::PermissionDenied);
    }

    #[test]
    fn unrecognized_stderr_falls_back_to_vbox_error() {
        let err = classify(1, "", "VBoxManage: error: something went unusually wrong\n");
        assert_eq!(err.kind, ErrorKind::VBoxError);
        assert_eq!(err.detail.as_ref().unwrap().exit_code, Some(1));
    }

    #[test]
    fn message_uses_first_non_blank_line() {
        let err = classify(1, "", "\n\nVBoxManage: error: Could not find a registered machine named 'x'\nmore context\n");
        assert_eq!(err.message, "VBoxManage: error: Could not find a registered machine named 'x'");
    }

    #[test]
    fn stderr_tail_is_capped() {
        let long = "x".repeat(10_000);
        let err = classify(1, "", &long);
        assert!(err.detail.unwrap().stderr_tail.unwrap().len() <= 4096);
    }
}
