//! Service level error kinds.
//!
//! Services return these through `anyhow::Error`; only the HTTP layer maps
//! them to status codes (see [`crate::api::http_error`]).

use std::fmt;

/// Error kinds surfaced to API callers.
#[derive(Debug)]
pub enum LabError {
    /// Class/VM/template/ISO absent.
    NotFound(String),
    /// Caller lacks the role for the requested resource.
    AccessDenied(String),
    /// Malformed or out-of-range field.
    InvalidInput(String),
    /// Network or auth failure against a cluster.
    ClusterUnreachable(String),
    /// Class lock acquisition timed out.
    ResourceBusy(String),
    /// Concurrent modification detected via `lock_version`.
    OptimisticLockConflict(String),
    /// Remote shell command returned a non-zero exit code.
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },
    /// Database constraint conflict, should not occur while invariants hold.
    IntegrityViolation(String),
}

impl fmt::Display for LabError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabError::NotFound(msg) => write!(f, "not found: {msg}"),
            LabError::AccessDenied(msg) => write!(f, "access denied: {msg}"),
            LabError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            LabError::ClusterUnreachable(msg) => write!(f, "cluster unreachable: {msg}"),
            LabError::ResourceBusy(msg) => {
                write!(f, "{msg} - another operation may be in progress, try again")
            }
            LabError::OptimisticLockConflict(msg) => {
                write!(f, "{msg} - reload and retry")
            }
            LabError::CommandFailed {
                command,
                exit_code,
                stderr,
            } => {
                let tail: String = stderr.chars().rev().take(200).collect::<Vec<_>>()
                    .into_iter().rev().collect();
                write!(f, "command '{command}' failed with exit code {exit_code}: {tail}")
            }
            LabError::IntegrityViolation(msg) => write!(f, "integrity violation: {msg}"),
        }
    }
}

impl std::error::Error for LabError {}

impl LabError {
    /// The HTTP status code this error kind maps to.
    pub fn status_code(&self) -> http::StatusCode {
        use http::StatusCode;

        match self {
            LabError::NotFound(_) => StatusCode::NOT_FOUND,
            LabError::AccessDenied(_) => StatusCode::FORBIDDEN,
            LabError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            LabError::ClusterUnreachable(_) => StatusCode::BAD_GATEWAY,
            LabError::ResourceBusy(_) => StatusCode::CONFLICT,
            LabError::OptimisticLockConflict(_) => StatusCode::CONFLICT,
            LabError::CommandFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            LabError::IntegrityViolation(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Whether a sync-time error represents a known-offline node.
///
/// These are logged at debug level and do not count towards the error
/// backoff counter.
pub fn is_expected_offline_error(msg: &str) -> bool {
    msg.contains("hostname lookup")
        || msg.contains("No route to host")
        || msg.contains("595 Errors")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_offline_classification() {
        assert!(is_expected_offline_error(
            "communication failure: hostname lookup 'netlab4' failed"
        ));
        assert!(is_expected_offline_error("connect: No route to host"));
        assert!(is_expected_offline_error("595 Errors during connection"));
        assert!(!is_expected_offline_error("authentication failed"));
    }

    #[test]
    fn test_status_codes() {
        use http::StatusCode;

        assert_eq!(
            LabError::NotFound("vm 100".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            LabError::ResourceBusy("class 3 locked".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            LabError::OptimisticLockConflict("class 3 changed".into()).status_code(),
            StatusCode::CONFLICT
        );
    }
}
