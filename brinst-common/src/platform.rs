//! Seams to the operating system.
//!
//! The engine only talks to the service manager and the network through
//! these traits. Concrete implementations live in the binary crate and
//! scripted doubles in [`crate::testing::mocks`].

use crate::config::StartupType;
use crate::errors::InstallError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Registration request for a background service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub display_name: String,
    pub binary_path: PathBuf,
    pub args: Vec<String>,
    pub startup_type: StartupType,
}

/// Observed state of a named service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Running,
    Stopped,
    NotInstalled,
    Unknown,
}

/// Service manager failures.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service {0} is not installed")]
    NotFound(String),

    #[error("service command `{command}` failed (exit {code:?}): {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("service {name} did not {operation} within {timeout:?}")]
    Timeout {
        name: String,
        operation: &'static str,
        timeout: Duration,
    },

    #[error("service manager I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("service management is not supported on {0}")]
    Unsupported(String),
}

impl ServiceError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<ServiceError> for InstallError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Timeout { .. } => InstallError::Timeout(err.to_string()),
            ServiceError::Io(source) => InstallError::io("service manager", source),
            ServiceError::Unsupported(os) => {
                InstallError::Requirement(format!("service management unsupported on {os}"))
            }
            other => InstallError::Service(other.to_string()),
        }
    }
}

/// Create, control and remove named background services.
#[async_trait]
pub trait ServiceManager: Send + Sync {
    async fn create(&self, spec: &ServiceSpec) -> Result<(), ServiceError>;

    async fn start(&self, name: &str) -> Result<(), ServiceError>;

    /// Request a stop and wait up to `timeout` for the service to settle.
    async fn stop(&self, name: &str, timeout: Duration) -> Result<(), ServiceError>;

    async fn delete(&self, name: &str) -> Result<(), ServiceError>;

    async fn status(&self, name: &str) -> Result<ServiceState, ServiceError>;

    /// Terminate processes running the given executable. Returns how many
    /// were killed.
    async fn kill_processes(&self, binary_path: &Path) -> Result<usize, ServiceError>;
}

/// Network reachability checks used by recovery and the connection test.
#[async_trait]
pub trait NetworkDiagnostics: Send + Sync {
    /// Succeed when `url` answers at all within `timeout`.
    async fn probe(&self, url: &str, timeout: Duration) -> Result<(), InstallError>;

    async fn flush_dns_cache(&self) -> Result<(), InstallError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ErrorCategory, ErrorClassifier};

    #[test]
    fn test_service_errors_classify() {
        let classifier = ErrorClassifier::new();
        let cases = [
            (
                ServiceError::NotFound("bridge-agent".into()),
                ErrorCategory::Service,
            ),
            (
                ServiceError::CommandFailed {
                    command: "systemctl start bridge-agent".into(),
                    code: Some(1),
                    stderr: "failed".into(),
                },
                ErrorCategory::Service,
            ),
            (
                ServiceError::Timeout {
                    name: "bridge-agent".into(),
                    operation: "stop",
                    timeout: Duration::from_secs(30),
                },
                ErrorCategory::Timeout,
            ),
            (
                ServiceError::Io(std::io::Error::from(std::io::ErrorKind::PermissionDenied)),
                ErrorCategory::Permission,
            ),
        ];
        for (err, expected) in cases {
            let install: InstallError = err.into();
            assert_eq!(classifier.classify(&install), expected, "{install}");
        }
    }

    #[test]
    fn test_service_spec_serializes() {
        let spec = ServiceSpec {
            name: "bridge-agent".into(),
            display_name: "Bridge Agent".into(),
            binary_path: PathBuf::from("/opt/bridge/bridge-agent"),
            args: vec!["--config".into(), "/etc/bridge/agent.toml".into()],
            startup_type: StartupType::Automatic,
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["startup_type"], "automatic");
    }
}
