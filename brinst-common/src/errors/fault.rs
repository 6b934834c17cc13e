//! Faults raised by installation steps and their collaborators.

use crate::types::{ExitCode, ValidationErrorCode};
use thiserror::Error;

/// A fault raised while executing an installation step.
///
/// Variants name the subsystem that failed when the raiser knows it; the
/// classifier falls back to the I/O error kind and then to the message text
/// for [`InstallError::Io`], [`InstallError::Requirement`] and
/// [`InstallError::Other`].
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("network failure: {0}")]
    Network(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("service failure: {0}")]
    Service(String),

    #[error("configuration failure: {0}")]
    Configuration(String),

    #[error("download failed: {0}")]
    Download(String),

    #[error("integrity verification failed: {0}")]
    Integrity(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("security violation [{code}]: {message}")]
    SecurityViolation {
        code: ValidationErrorCode,
        message: String,
    },

    #[error("system requirement not met: {0}")]
    Requirement(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Other(String),
}

impl InstallError {
    /// Wrap an I/O error with a short description of what was attempted.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }

    pub fn security(code: ValidationErrorCode, message: impl Into<String>) -> Self {
        Self::SecurityViolation {
            code,
            message: message.into(),
        }
    }

    /// Whether this fault is a security violation (never retried).
    pub fn is_security_violation(&self) -> bool {
        matches!(self, Self::SecurityViolation { .. })
    }

    /// Exit code that takes precedence over the failing step's own code.
    pub fn exit_code_override(&self) -> Option<ExitCode> {
        match self {
            Self::SecurityViolation { code, .. } => Some(code.exit_code()),
            Self::Integrity(_) => Some(ExitCode::IntegrityVerificationFailed),
            Self::Permission(_) => Some(ExitCode::InsufficientPrivileges),
            Self::Requirement(_) => Some(ExitCode::SystemRequirementsNotMet),
            _ => None,
        }
    }
}
