//! Telemetry delivery errors.
//!
//! None of these ever reach the installation pipeline; the worker logs and
//! counts them.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("telemetry endpoint unreachable: {0}")]
    Transport(String),

    #[error("telemetry endpoint returned HTTP {0}")]
    Status(u16),

    #[error("telemetry request timed out")]
    Timeout,

    #[error("failed to write telemetry file {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode telemetry envelope: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("invalid telemetry sink configuration: {0}")]
    Config(String),
}

impl TelemetryError {
    /// Whether resending the same envelope could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout | Self::File { .. } => true,
            Self::Status(code) => *code >= 500 || *code == 429,
            Self::Encode(_) | Self::Config(_) => false,
        }
    }
}

impl From<reqwest::Error> for TelemetryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if let Some(status) = err.status() {
            Self::Status(status.as_u16())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(TelemetryError::Transport("refused".into()).is_transient());
        assert!(TelemetryError::Timeout.is_transient());
        assert!(TelemetryError::Status(503).is_transient());
        assert!(TelemetryError::Status(429).is_transient());
        assert!(!TelemetryError::Status(400).is_transient());
        assert!(!TelemetryError::Config("bad url".into()).is_transient());
    }
}
