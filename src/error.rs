//! Crate-wide error type with a closed kind taxonomy
//!
//! Every fallible engine operation reports one of the kinds below. The kind
//! string travels into progress records and history entries so callers can
//! render a final status without parsing messages.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed set of error kinds surfaced by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    // Configuration
    InvalidDescriptor,
    MissingField,
    UnsupportedMount,

    // Resolution
    HostNotFound,
    Unreachable,
    AuthRejected,
    TotpRequired,
    TotpInvalid,

    // Daemon
    DaemonUnavailable,
    DaemonError,
    ImagePullDenied,
    Conflict,
    NotFound,
    IoError,
    Timeout,

    // Operation control
    AlreadyRunning,
    SameHost,
    ElevationRequired,

    // Health
    ProbeFailed,
    ProbeTimeout,

    // Backup
    BackupFailed,
    BackupSkippedPrivileged,
    BackupSkippedLarge,

    // Data migration
    VolumeCopyFailed,
    ManualActionRequired,

    // Internal
    InvariantViolation,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidDescriptor => "invalid_descriptor",
            ErrorKind::MissingField => "missing_field",
            ErrorKind::UnsupportedMount => "unsupported_mount",
            ErrorKind::HostNotFound => "host_not_found",
            ErrorKind::Unreachable => "unreachable",
            ErrorKind::AuthRejected => "auth_rejected",
            ErrorKind::TotpRequired => "totp_required",
            ErrorKind::TotpInvalid => "totp_invalid",
            ErrorKind::DaemonUnavailable => "daemon_unavailable",
            ErrorKind::DaemonError => "daemon_error",
            ErrorKind::ImagePullDenied => "image_pull_denied",
            ErrorKind::Conflict => "conflict",
            ErrorKind::NotFound => "not_found",
            ErrorKind::IoError => "io_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::AlreadyRunning => "already_running",
            ErrorKind::SameHost => "same_host",
            ErrorKind::ElevationRequired => "elevation_required",
            ErrorKind::ProbeFailed => "probe_failed",
            ErrorKind::ProbeTimeout => "probe_timeout",
            ErrorKind::BackupFailed => "backup_failed",
            ErrorKind::BackupSkippedPrivileged => "backup_skipped_privileged",
            ErrorKind::BackupSkippedLarge => "backup_skipped_large",
            ErrorKind::VolumeCopyFailed => "volume_copy_failed",
            ErrorKind::ManualActionRequired => "manual_action_required",
            ErrorKind::InvariantViolation => "invariant_violation",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error carried through the engine: a kind from the closed taxonomy plus a
/// human-readable message.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct PilotError {
    pub kind: ErrorKind,
    pub message: String,
}

impl PilotError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::NotFound, format!("not found: {}", what))
    }

    pub fn conflict(what: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::Conflict, format!("name in use: {}", what))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvariantViolation, message)
    }

    pub fn timeout(what: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::Timeout, format!("timed out: {}", what))
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl From<bollard::errors::Error> for PilotError {
    fn from(e: bollard::errors::Error) -> Self {
        use bollard::errors::Error as B;
        match &e {
            B::DockerResponseServerError {
                status_code: 404, ..
            } => Self::new(ErrorKind::NotFound, e.to_string()),
            B::DockerResponseServerError {
                status_code: 409, ..
            } => Self::new(ErrorKind::Conflict, e.to_string()),
            B::DockerResponseServerError {
                status_code: 401, ..
            }
            | B::DockerResponseServerError {
                status_code: 403, ..
            } => Self::new(ErrorKind::ImagePullDenied, e.to_string()),
            B::HyperResponseError { .. } => Self::new(ErrorKind::DaemonUnavailable, e.to_string()),
            B::IOError { .. } => Self::new(ErrorKind::IoError, e.to_string()),
            B::RequestTimeoutError => Self::new(ErrorKind::Timeout, e.to_string()),
            _ => Self::new(ErrorKind::DaemonError, e.to_string()),
        }
    }
}

impl From<std::io::Error> for PilotError {
    fn from(e: std::io::Error) -> Self {
        Self::new(ErrorKind::IoError, e.to_string())
    }
}

impl From<serde_yaml::Error> for PilotError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::new(ErrorKind::InvalidDescriptor, e.to_string())
    }
}

impl From<serde_json::Error> for PilotError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(ErrorKind::IoError, e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PilotError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_are_snake_case() {
        assert_eq!(ErrorKind::AlreadyRunning.as_str(), "already_running");
        assert_eq!(ErrorKind::SameHost.as_str(), "same_host");
        assert_eq!(
            ErrorKind::BackupSkippedPrivileged.as_str(),
            "backup_skipped_privileged"
        );
    }

    #[test]
    fn display_carries_kind_and_message() {
        let e = PilotError::new(ErrorKind::ElevationRequired, "no sudo secret stored");
        assert_eq!(e.to_string(), "elevation_required: no sudo secret stored");
    }
}
