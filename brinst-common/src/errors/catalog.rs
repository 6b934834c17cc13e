//! Error category catalog.
//!
//! Each category carries:
//! - a severity used to gate rollback
//! - whether the retry executor may try the step again
//! - ordered remediation steps shown to the operator
//! - the recovery procedure run before the first retry
//!
//! # Example
//!
//! ```rust
//! use brinst_common::errors::ErrorCategory;
//!
//! let entry = ErrorCategory::Network.entry();
//! println!("{}", entry.format_full());
//! ```

use crate::types::Severity;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fault categories, in classification priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Signature, replay or tamper failures.
    SecurityViolation,
    /// Connectivity, DNS and TLS failures.
    Network,
    /// Missing privileges or denied access.
    Permission,
    /// Disk space, locked files and unwritable paths.
    Storage,
    /// Service manager failures.
    Service,
    /// Invalid or unreadable configuration.
    Configuration,
    /// Package download and integrity failures.
    Download,
    /// Operations exceeding their deadline.
    Timeout,
    /// Anything the table does not recognise.
    Unknown,
}

/// Automated remediation run by the recovery engine for a category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryProcedure {
    None,
    Network,
    Storage,
    Service,
    Download,
    Configuration,
}

impl ErrorCategory {
    /// Table order checked by the classifier. First match wins.
    pub const CLASSIFICATION_ORDER: [ErrorCategory; 9] = [
        Self::SecurityViolation,
        Self::Network,
        Self::Permission,
        Self::Storage,
        Self::Service,
        Self::Configuration,
        Self::Download,
        Self::Timeout,
        Self::Unknown,
    ];

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::SecurityViolation => "SecurityViolation",
            Self::Network => "Network",
            Self::Permission => "Permission",
            Self::Storage => "Storage",
            Self::Service => "Service",
            Self::Configuration => "Configuration",
            Self::Download => "Download",
            Self::Timeout => "Timeout",
            Self::Unknown => "Unknown",
        }
    }

    #[must_use]
    pub const fn description(&self) -> &'static str {
        match self {
            Self::SecurityViolation => "The installation command failed a security check",
            Self::Network => "The installer could not reach a required network endpoint",
            Self::Permission => "The installer lacks the privileges required for this step",
            Self::Storage => "The file system rejected a read or write",
            Self::Service => "The service manager rejected a service operation",
            Self::Configuration => "Installer or bridge configuration is invalid",
            Self::Download => "The bridge package could not be downloaded or verified",
            Self::Timeout => "An operation did not complete before its deadline",
            Self::Unknown => "An unexpected error occurred",
        }
    }

    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::SecurityViolation => Severity::Critical,
            Self::Permission | Self::Storage | Self::Service | Self::Download => Severity::High,
            Self::Network | Self::Configuration | Self::Timeout | Self::Unknown => {
                Severity::Medium
            }
        }
    }

    #[must_use]
    pub const fn retryable(&self) -> bool {
        !matches!(self, Self::SecurityViolation | Self::Permission)
    }

    #[must_use]
    pub const fn recovery_procedure(&self) -> RecoveryProcedure {
        match self {
            Self::Network | Self::Timeout => RecoveryProcedure::Network,
            Self::Storage => RecoveryProcedure::Storage,
            Self::Service => RecoveryProcedure::Service,
            Self::Download => RecoveryProcedure::Download,
            Self::Configuration => RecoveryProcedure::Configuration,
            Self::SecurityViolation | Self::Permission | Self::Unknown => RecoveryProcedure::None,
        }
    }

    #[must_use]
    pub const fn remediation(&self) -> &'static [&'static str] {
        match self {
            Self::SecurityViolation => &[
                "Do not reuse or edit installation commands; request a new one from the platform",
                "Verify the system clock is synchronized (NTP)",
                "Report the attempt to your security team if you did not expect this failure",
            ],
            Self::Network => &[
                "Check that the machine has internet access",
                "Verify that firewalls and proxies allow HTTPS to the platform endpoint",
                "Confirm DNS resolves the platform hostname",
            ],
            Self::Permission => &[
                "Re-run the installer from an elevated (administrator/root) shell",
                "Check that security software is not blocking the installer",
            ],
            Self::Storage => &[
                "Free at least 500 MB on the installation volume",
                "Close programs that may hold files in the installation directory",
                "Choose a different installation directory",
            ],
            Self::Service => &[
                "Check the service manager for a stale bridge service and remove it",
                "Ensure no other bridge instance is running",
                "Inspect the system event log for service start errors",
            ],
            Self::Configuration => &[
                "Validate the installer configuration file syntax",
                "Remove the bridge configuration directory and retry",
            ],
            Self::Download => &[
                "Retry the installation; the package mirror may be temporarily unavailable",
                "Verify that the download URL is reachable from this machine",
                "Check that a proxy is not rewriting the package content",
            ],
            Self::Timeout => &[
                "Retry the installation when the network is less congested",
                "Check for slow proxies or DNS servers",
            ],
            Self::Unknown => &[
                "Retry the installation",
                "Collect the audit report and installer logs and contact support",
            ],
        }
    }

    /// Full catalog entry with owned strings, ready for serialization.
    #[must_use]
    pub fn entry(&self) -> CategoryEntry {
        CategoryEntry {
            category: *self,
            name: self.name().to_string(),
            description: self.description().to_string(),
            severity: self.severity(),
            retryable: self.retryable(),
            remediation: self
                .remediation()
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            recovery: self.recovery_procedure(),
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Complete catalog entry for a category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryEntry {
    pub category: ErrorCategory,
    pub name: String,
    pub description: String,
    pub severity: Severity,
    pub retryable: bool,
    pub remediation: Vec<String>,
    pub recovery: RecoveryProcedure,
}

impl CategoryEntry {
    /// Operator-facing text with numbered remediation steps.
    #[must_use]
    pub fn format_full(&self) -> String {
        let mut output = format!("[{} / {}] {}\n", self.name, self.severity, self.description);

        if !self.remediation.is_empty() {
            output.push_str("\nRemediation steps:\n");
            for (i, step) in self.remediation.iter().enumerate() {
                output.push_str(&format!("  {}. {}\n", i + 1, step));
            }
        }

        output
    }

    #[must_use]
    pub fn format_brief(&self) -> String {
        format!("[{}] {}", self.name, self.description)
    }
}

impl fmt::Display for CategoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format_brief())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_violation_is_critical_and_final() {
        let entry = ErrorCategory::SecurityViolation.entry();
        assert_eq!(entry.severity, Severity::Critical);
        assert!(!entry.retryable);
        assert_eq!(entry.recovery, RecoveryProcedure::None);
    }

    #[test]
    fn test_unknown_fallback_metadata() {
        let entry = ErrorCategory::Unknown.entry();
        assert_eq!(entry.severity, Severity::Medium);
        assert!(entry.retryable);
        assert!(!entry.remediation.is_empty());
    }

    #[test]
    fn test_every_category_has_remediation() {
        for category in ErrorCategory::CLASSIFICATION_ORDER {
            assert!(
                !category.remediation().is_empty(),
                "{} has no remediation",
                category
            );
        }
    }

    #[test]
    fn test_classification_order_matches_table() {
        let names: Vec<_> = ErrorCategory::CLASSIFICATION_ORDER
            .iter()
            .map(|c| c.name())
            .collect();
        assert_eq!(
            names,
            vec![
                "SecurityViolation",
                "Network",
                "Permission",
                "Storage",
                "Service",
                "Configuration",
                "Download",
                "Timeout",
                "Unknown"
            ]
        );
    }

    #[test]
    fn test_recovery_procedure_mapping() {
        assert_eq!(
            ErrorCategory::Timeout.recovery_procedure(),
            RecoveryProcedure::Network
        );
        assert_eq!(
            ErrorCategory::Download.recovery_procedure(),
            RecoveryProcedure::Download
        );
        assert_eq!(
            ErrorCategory::Permission.recovery_procedure(),
            RecoveryProcedure::None
        );
    }

    #[test]
    fn test_format_full_numbers_steps() {
        let text = ErrorCategory::Storage.entry().format_full();
        assert!(text.starts_with("[Storage / High]"));
        assert!(text.contains("  1. Free at least 500 MB"));
        assert!(text.contains("  3. Choose a different installation directory"));
    }

    #[test]
    fn test_entry_serializes_snake_case() {
        let json = serde_json::to_value(ErrorCategory::SecurityViolation.entry()).unwrap();
        assert_eq!(json["category"], "security_violation");
        assert_eq!(json["severity"], "critical");
    }
}
