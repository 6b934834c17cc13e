//! Common types used across installer components.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Authorization command issued by the platform for a single installation.
///
/// The command is immutable input: components only ever borrow it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InstallationCommand {
    /// Short pairing code shown to the operator.
    pub pair_code: String,
    /// Base64 signature over the canonical command message.
    pub signature: String,
    /// Single-use token preventing replay.
    pub nonce: String,
    /// Identifier of the tenant/subject the bridge is paired with (UUID).
    pub subject_id: String,
    /// RFC 3339 expiration timestamp.
    pub expires_at: String,
    /// Platform endpoint the bridge will connect to.
    pub endpoint: String,
}

impl InstallationCommand {
    pub fn new(
        pair_code: impl Into<String>,
        signature: impl Into<String>,
        nonce: impl Into<String>,
        subject_id: impl Into<String>,
        expires_at: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            pair_code: pair_code.into(),
            signature: signature.into(),
            nonce: nonce.into(),
            subject_id: subject_id.into(),
            expires_at: expires_at.into(),
            endpoint: endpoint.into(),
        }
    }

    /// Key used for replay tracking.
    pub fn nonce_key(&self) -> String {
        format!("{}:{}", self.subject_id, self.nonce)
    }
}

// Signatures and pair codes must never reach the logs verbatim.
impl fmt::Debug for InstallationCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstallationCommand")
            .field("pair_code", &mask(&self.pair_code))
            .field("signature", &mask(&self.signature))
            .field("nonce", &mask(&self.nonce))
            .field("subject_id", &self.subject_id)
            .field("expires_at", &self.expires_at)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

/// Keep the first four characters of a secret and hide the rest.
pub fn mask(value: &str) -> String {
    let visible: String = value.chars().take(4).collect();
    if value.chars().count() <= 4 {
        "***".to_string()
    } else {
        format!("{visible}***")
    }
}

/// Why a command failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationErrorCode {
    ExpiredCommand,
    InvalidSignature,
    TamperDetected,
    ReplayAttack,
}

impl ValidationErrorCode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ExpiredCommand => "ExpiredCommand",
            Self::InvalidSignature => "InvalidSignature",
            Self::TamperDetected => "TamperDetected",
            Self::ReplayAttack => "ReplayAttack",
        }
    }

    /// Severity recorded in the audit trail for this failure.
    pub const fn severity(&self) -> Severity {
        match self {
            Self::ExpiredCommand => Severity::Medium,
            Self::InvalidSignature => Severity::High,
            Self::TamperDetected | Self::ReplayAttack => Severity::Critical,
        }
    }

    /// Exit code reported when installation stops on this failure.
    pub const fn exit_code(&self) -> ExitCode {
        match self {
            Self::ExpiredCommand => ExitCode::ExpiredCommand,
            _ => ExitCode::InvalidSignature,
        }
    }
}

impl fmt::Display for ValidationErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of validating one [`InstallationCommand`].
///
/// Built once by the validator and read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    is_valid: bool,
    error_code: Option<ValidationErrorCode>,
    error_message: String,
    details: BTreeMap<String, String>,
}

impl ValidationResult {
    pub fn valid(details: BTreeMap<String, String>) -> Self {
        Self {
            is_valid: true,
            error_code: None,
            error_message: String::new(),
            details,
        }
    }

    pub fn invalid(
        code: ValidationErrorCode,
        message: impl Into<String>,
        details: BTreeMap<String, String>,
    ) -> Self {
        Self {
            is_valid: false,
            error_code: Some(code),
            error_message: message.into(),
            details,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid
    }

    pub fn error_code(&self) -> Option<ValidationErrorCode> {
        self.error_code
    }

    pub fn error_message(&self) -> &str {
        &self.error_message
    }

    pub fn details(&self) -> &BTreeMap<String, String> {
        &self.details
    }
}

/// Severity of a classified fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// High and Critical faults are allowed to trigger rollback.
    pub fn warrants_rollback(&self) -> bool {
        *self >= Severity::High
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Low => "Low",
            Self::Medium => "Medium",
            Self::High => "High",
            Self::Critical => "Critical",
        };
        f.write_str(name)
    }
}

/// Process exit codes reported by the installer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitCode {
    Success,
    InvalidSignature,
    ExpiredCommand,
    InsufficientPrivileges,
    SystemRequirementsNotMet,
    DownloadFailed,
    IntegrityVerificationFailed,
    InstallationFailed,
    ServiceInstallationFailed,
    ConfigurationFailed,
    ConnectionTestFailed,
    RollbackFailed,
}

impl ExitCode {
    pub const fn code(&self) -> i32 {
        match self {
            Self::Success => 0,
            Self::InvalidSignature => 10,
            Self::ExpiredCommand => 11,
            Self::InsufficientPrivileges => 20,
            Self::SystemRequirementsNotMet => 21,
            Self::DownloadFailed => 30,
            Self::IntegrityVerificationFailed => 31,
            Self::InstallationFailed => 40,
            Self::ServiceInstallationFailed => 41,
            Self::ConfigurationFailed => 42,
            Self::ConnectionTestFailed => 50,
            Self::RollbackFailed => 60,
        }
    }

    pub fn all() -> &'static [ExitCode] {
        &[
            Self::Success,
            Self::InvalidSignature,
            Self::ExpiredCommand,
            Self::InsufficientPrivileges,
            Self::SystemRequirementsNotMet,
            Self::DownloadFailed,
            Self::IntegrityVerificationFailed,
            Self::InstallationFailed,
            Self::ServiceInstallationFailed,
            Self::ConfigurationFailed,
            Self::ConnectionTestFailed,
            Self::RollbackFailed,
        ]
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}

/// Final result of an installation run, as recorded in the audit summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum FinalResult {
    Succeeded,
    Failed { step: String, exit_code: i32 },
    RolledBack { step: String, exit_code: i32 },
    RollbackFailed { step: String },
}

impl FinalResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed { .. } => "failed",
            Self::RolledBack { .. } => "rolled_back",
            Self::RollbackFailed { .. } => "rollback_failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn sample_command() -> InstallationCommand {
        InstallationCommand::new(
            "ABC123",
            "c2lnbmF0dXJlLWJ5dGVzLWZvci10ZXN0aW5nLW9ubHk=",
            "bm9uY2UtMDAwMDAwMDAx",
            "6f1c2a9e-3b7d-4c1e-9a8f-0d2b4e6f8a10",
            "2030-01-01T00:00:00Z",
            "https://bridge.example.com",
        )
    }

    #[test]
    fn test_exit_codes_are_unique() {
        let mut seen = HashSet::new();
        for code in ExitCode::all() {
            assert!(seen.insert(code.code()), "duplicate exit code {:?}", code);
        }
        assert_eq!(ExitCode::Success.code(), 0);
    }

    #[test]
    fn test_debug_masks_secrets() {
        let debug = format!("{:?}", sample_command());
        assert!(!debug.contains("c2lnbmF0dXJlLWJ5dGVz"));
        assert!(debug.contains("c2ln***"));
        assert!(debug.contains("6f1c2a9e-3b7d-4c1e-9a8f-0d2b4e6f8a10"));
    }

    #[test]
    fn test_mask_short_values() {
        assert_eq!(mask("abc"), "***");
        assert_eq!(mask("abcdef"), "abcd***");
    }

    #[test]
    fn test_nonce_key() {
        let cmd = sample_command();
        assert_eq!(
            cmd.nonce_key(),
            "6f1c2a9e-3b7d-4c1e-9a8f-0d2b4e6f8a10:bm9uY2UtMDAwMDAwMDAx"
        );
    }

    #[test]
    fn test_command_json_uses_camel_case() {
        let json = serde_json::to_value(sample_command()).unwrap();
        assert!(json.get("pairCode").is_some());
        assert!(json.get("expiresAt").is_some());

        let unknown = r#"{"pairCode":"A","signature":"B","nonce":"C","subjectId":"D","expiresAt":"E","endpoint":"F","extra":1}"#;
        assert!(serde_json::from_str::<InstallationCommand>(unknown).is_err());
    }

    #[test]
    fn test_validation_code_severity_and_exit() {
        assert_eq!(ValidationErrorCode::ReplayAttack.severity(), Severity::Critical);
        assert_eq!(
            ValidationErrorCode::ExpiredCommand.exit_code(),
            ExitCode::ExpiredCommand
        );
        assert_eq!(
            ValidationErrorCode::TamperDetected.exit_code(),
            ExitCode::InvalidSignature
        );
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High.warrants_rollback());
        assert!(!Severity::Medium.warrants_rollback());
    }

    #[test]
    fn test_validation_result_accessors() {
        let mut details = BTreeMap::new();
        details.insert("field".to_string(), "nonce".to_string());
        let result =
            ValidationResult::invalid(ValidationErrorCode::TamperDetected, "bad nonce", details);
        assert!(!result.is_valid());
        assert_eq!(result.error_code(), Some(ValidationErrorCode::TamperDetected));
        assert_eq!(result.details().get("field").map(String::as_str), Some("nonce"));
    }
}
