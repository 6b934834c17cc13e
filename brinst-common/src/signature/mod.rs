//! Installation command validation.
//!
//! Checks run in a fixed order and the first failure wins:
//!
//! 1. expiration
//! 2. field formats
//! 3. canonical message reconstruction
//! 4. remote signature verification (fails closed)
//! 5. replay detection against the nonce oracle and local store
//! 6. cross-field tamper checks
//!
//! Every check is written to the audit log.

pub mod format;
pub mod nonce;
pub mod oracle;

pub use format::{FieldViolation, canonical_message, check_format, parse_expiry};
pub use nonce::{NonceCheck, NonceRecord, NonceStore, NonceStoreError};
pub use oracle::{
    HmacSignatureOracle, NonceCheckRequest, NonceCheckResponse, OracleError, OraclePolicy,
    SignatureOracle, Verdict, VerifyRequest, VerifyResponse,
};

use crate::audit::{AuditEventType, AuditLog, AuditSeverity, details};
use crate::config::InstallerConfig;
use crate::types::{InstallationCommand, ValidationErrorCode, ValidationResult, mask};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

/// Compare two byte strings in time independent of where they differ.
///
/// Lengths are compared first; only the content comparison is
/// constant-time.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

/// Knobs for [`SignatureValidator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatorPolicy {
    pub oracle: OraclePolicy,
    /// `expiresAt` further than this from now in either direction is tampering.
    pub max_expiry_window: Duration,
    pub check_remote_nonce: bool,
}

impl Default for ValidatorPolicy {
    fn default() -> Self {
        Self {
            oracle: OraclePolicy::default(),
            max_expiry_window: Duration::hours(48),
            check_remote_nonce: true,
        }
    }
}

impl ValidatorPolicy {
    pub fn from_config(config: &InstallerConfig) -> Self {
        Self {
            oracle: OraclePolicy {
                attempts: config.oracle.attempts,
                backoff: config.oracle.backoff(),
                timeout: config.oracle.timeout(),
            },
            max_expiry_window: Duration::hours(i64::from(config.security.max_expiry_window_hours)),
            check_remote_nonce: config.oracle.check_remote_nonce,
        }
    }
}

pub struct SignatureValidator {
    oracle: Arc<dyn SignatureOracle>,
    nonces: Arc<NonceStore>,
    audit: Arc<AuditLog>,
    policy: ValidatorPolicy,
}

impl SignatureValidator {
    pub fn new(
        oracle: Arc<dyn SignatureOracle>,
        nonces: Arc<NonceStore>,
        audit: Arc<AuditLog>,
        policy: ValidatorPolicy,
    ) -> Self {
        Self {
            oracle,
            nonces,
            audit,
            policy,
        }
    }

    pub async fn validate(&self, cmd: &InstallationCommand) -> ValidationResult {
        self.validate_at(cmd, Utc::now()).await
    }

    /// Validate against an explicit clock reading.
    pub async fn validate_at(&self, cmd: &InstallationCommand, now: DateTime<Utc>) -> ValidationResult {
        info!(pair_code = %mask(&cmd.pair_code), subject_id = %cmd.subject_id, "Validating installation command");

        // 1. Expiration
        let expires_at = match parse_expiry(cmd) {
            Ok(expires_at) => expires_at,
            Err(v) => return self.reject_field(AuditEventType::TamperCheck, v),
        };
        if expires_at < now {
            return self.reject(
                AuditEventType::SignatureValidation,
                ValidationErrorCode::ExpiredCommand,
                format!("command expired at {}", cmd.expires_at),
                details([
                    ("expiresAt", cmd.expires_at.clone()),
                    ("now", now.to_rfc3339_opts(SecondsFormat::Secs, true)),
                ]),
            );
        }
        self.pass(AuditEventType::SignatureValidation, "Command is not expired");

        // 2. Format
        if let Err(v) = check_format(cmd) {
            return self.reject_field(AuditEventType::TamperCheck, v);
        }
        self.pass(AuditEventType::TamperCheck, "Command fields are well formed");

        // 3. Message reconstruction
        let message = canonical_message(cmd);
        self.audit.record(
            AuditEventType::SignatureValidation,
            AuditSeverity::Information,
            "Canonical message reconstructed",
            details([("bytes", message.len().to_string())]),
        );

        // 4. Remote verification
        let request = VerifyRequest {
            message,
            signature: cmd.signature.clone(),
            nonce: cmd.nonce.clone(),
            subject_id: cmd.subject_id.clone(),
            timestamp: now.to_rfc3339_opts(SecondsFormat::Secs, true),
        };
        match oracle::verify_with_retry(self.oracle.as_ref(), &request, self.policy.oracle).await {
            Verdict::Valid => {
                self.pass(AuditEventType::SignatureValidation, "Signature verified");
            }
            Verdict::Rejected(reason) => {
                return self.reject(
                    AuditEventType::SignatureValidation,
                    ValidationErrorCode::InvalidSignature,
                    format!("signature rejected: {reason}"),
                    details([("field", "signature")]),
                );
            }
            Verdict::Unavailable(reason) => {
                return self.reject(
                    AuditEventType::SignatureValidation,
                    ValidationErrorCode::InvalidSignature,
                    "signature could not be verified: verification service unavailable",
                    details([("field", "signature"), ("cause", reason.as_str())]),
                );
            }
        }

        // 5. Replay detection
        if self.policy.check_remote_nonce {
            let check = NonceCheckRequest {
                nonce: cmd.nonce.clone(),
                subject_id: cmd.subject_id.clone(),
            };
            match oracle::nonce_used_remotely(self.oracle.as_ref(), &check, self.policy.oracle.timeout)
                .await
            {
                Some(true) => {
                    return self.reject(
                        AuditEventType::ReplayCheck,
                        ValidationErrorCode::ReplayAttack,
                        "nonce already used according to the platform",
                        details([("field", "nonce"), ("source", "remote")]),
                    );
                }
                Some(false) => {
                    self.pass(AuditEventType::ReplayCheck, "Nonce unused according to remote oracle");
                }
                // Lookup is best effort; the local store still decides.
                None => {}
            }
        }
        match self.nonces.check_and_insert(&cmd.nonce_key(), now) {
            Ok(NonceCheck::Fresh) => {
                self.pass(AuditEventType::ReplayCheck, "Nonce is fresh");
            }
            Ok(NonceCheck::Replayed { first_used }) => {
                return self.reject(
                    AuditEventType::ReplayCheck,
                    ValidationErrorCode::ReplayAttack,
                    "nonce already used",
                    details([
                        ("field", "nonce".to_string()),
                        ("source", "local".to_string()),
                        (
                            "firstUsed",
                            first_used.to_rfc3339_opts(SecondsFormat::Secs, true),
                        ),
                    ]),
                );
            }
            Err(e) => {
                // Freshness cannot be proven without a durable record.
                return self.reject(
                    AuditEventType::ReplayCheck,
                    ValidationErrorCode::ReplayAttack,
                    format!("nonce could not be recorded: {e}"),
                    details([("field", "nonce"), ("source", "store")]),
                );
            }
        }

        // 6. Cross-parameter tamper checks
        if let Some((a, b)) = format::duplicated_fields(cmd) {
            return self.reject(
                AuditEventType::TamperCheck,
                ValidationErrorCode::TamperDetected,
                format!("{a} and {b} are identical"),
                details([("field", format!("{a},{b}"))]),
            );
        }
        let distance = (expires_at - now).abs();
        if distance > self.policy.max_expiry_window {
            return self.reject(
                AuditEventType::TamperCheck,
                ValidationErrorCode::TamperDetected,
                format!(
                    "expiresAt is {}h from now, limit is {}h",
                    distance.num_hours(),
                    self.policy.max_expiry_window.num_hours()
                ),
                details([("field", "expiresAt")]),
            );
        }
        self.pass(AuditEventType::TamperCheck, "Cross-field checks passed");

        info!(subject_id = %cmd.subject_id, "Installation command validated");
        ValidationResult::valid(details([
            ("subjectId", cmd.subject_id.clone()),
            ("endpoint", cmd.endpoint.clone()),
            ("expiresAt", cmd.expires_at.clone()),
        ]))
    }

    fn pass(&self, event_type: AuditEventType, message: &str) {
        self.audit.record(
            event_type,
            AuditSeverity::Information,
            message,
            BTreeMap::new(),
        );
    }

    fn reject_field(&self, event_type: AuditEventType, violation: FieldViolation) -> ValidationResult {
        self.reject(
            event_type,
            violation.code,
            violation.reason,
            details([("field", violation.field)]),
        )
    }

    fn reject(
        &self,
        event_type: AuditEventType,
        code: ValidationErrorCode,
        message: impl Into<String>,
        mut details: BTreeMap<String, String>,
    ) -> ValidationResult {
        let message = message.into();
        let severity = if code.severity() >= crate::types::Severity::Critical {
            AuditSeverity::Critical
        } else {
            AuditSeverity::Error
        };
        warn!(code = %code, %message, "Installation command rejected");

        details.insert("code".to_string(), code.as_str().to_string());
        self.audit
            .record(event_type, severity, message.clone(), details.clone());
        self.audit.record(
            AuditEventType::SecurityViolation,
            severity,
            format!("{code}: {message}"),
            details.clone(),
        );
        details.remove("code");
        ValidationResult::invalid(code, message, details)
    }
}
