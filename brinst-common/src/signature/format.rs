//! Structural checks on command fields and the canonical signed message.

use crate::types::{InstallationCommand, ValidationErrorCode};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::LazyLock;

pub const MIN_SIGNATURE_LEN: usize = 32;
pub const MIN_NONCE_LEN: usize = 16;

static NONCE_RE: LazyLock<Regex> = LazyLock::new(|| compile(r"^[A-Za-z0-9+/=_-]+$"));
static GUID_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
});
static PAIR_CODE_RE: LazyLock<Regex> = LazyLock::new(|| compile(r"^[A-Za-z0-9-]{6,64}$"));

fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|e| panic!("invalid pattern {pattern}: {e}"))
}

/// A field that failed a structural check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldViolation {
    pub code: ValidationErrorCode,
    /// Wire name of the offending field.
    pub field: &'static str,
    pub reason: String,
}

impl FieldViolation {
    fn tamper(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            code: ValidationErrorCode::TamperDetected,
            field,
            reason: reason.into(),
        }
    }
}

/// Parse `expiresAt` as RFC 3339.
pub fn parse_expiry(cmd: &InstallationCommand) -> Result<DateTime<Utc>, FieldViolation> {
    DateTime::parse_from_rfc3339(cmd.expires_at.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| FieldViolation::tamper("expiresAt", format!("not an RFC 3339 timestamp: {e}")))
}

/// Check field formats in a fixed order and report the first violation.
pub fn check_format(cmd: &InstallationCommand) -> Result<(), FieldViolation> {
    if cmd.signature.len() < MIN_SIGNATURE_LEN {
        return Err(FieldViolation {
            code: ValidationErrorCode::InvalidSignature,
            field: "signature",
            reason: format!(
                "signature is {} characters, minimum is {MIN_SIGNATURE_LEN}",
                cmd.signature.len()
            ),
        });
    }
    if STANDARD.decode(cmd.signature.as_bytes()).is_err() {
        return Err(FieldViolation {
            code: ValidationErrorCode::InvalidSignature,
            field: "signature",
            reason: "signature is not valid base64".to_string(),
        });
    }

    if cmd.nonce.len() < MIN_NONCE_LEN || !NONCE_RE.is_match(&cmd.nonce) {
        return Err(FieldViolation::tamper(
            "nonce",
            format!("nonce must be at least {MIN_NONCE_LEN} characters of [A-Za-z0-9+/=_-]"),
        ));
    }

    if !GUID_RE.is_match(&cmd.subject_id) {
        return Err(FieldViolation::tamper("subjectId", "subjectId is not a GUID"));
    }

    if !PAIR_CODE_RE.is_match(&cmd.pair_code) {
        return Err(FieldViolation::tamper(
            "pairCode",
            "pairCode must be 6-64 characters of [A-Za-z0-9-]",
        ));
    }

    let host = cmd.endpoint.strip_prefix("https://").unwrap_or_default();
    if host.is_empty() || host.starts_with('/') || cmd.endpoint.chars().any(char::is_whitespace) {
        return Err(FieldViolation::tamper(
            "endpoint",
            "endpoint must be an https:// URL",
        ));
    }

    Ok(())
}

/// Message covered by the signature.
pub fn canonical_message(cmd: &InstallationCommand) -> String {
    format!(
        "{}|{}|{}|{}|{}",
        cmd.pair_code, cmd.nonce, cmd.subject_id, cmd.expires_at, cmd.endpoint
    )
}

/// Names of fields whose values are byte-identical to another field.
pub fn duplicated_fields(cmd: &InstallationCommand) -> Option<(&'static str, &'static str)> {
    let fields = [
        ("pairCode", cmd.pair_code.as_bytes()),
        ("subjectId", cmd.subject_id.as_bytes()),
        ("nonce", cmd.nonce.as_bytes()),
        ("signature", cmd.signature.as_bytes()),
    ];
    for (i, (name_a, a)) in fields.iter().enumerate() {
        for (name_b, b) in &fields[i + 1..] {
            if a == b {
                return Some((*name_a, *name_b));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command() -> InstallationCommand {
        InstallationCommand::new(
            "ABC123",
            "c2lnbmF0dXJlLWJ5dGVzLWZvci10ZXN0aW5nLW9ubHk=",
            "bm9uY2UtMDAwMDAwMDAx",
            "6f1c2a9e-3b7d-4c1e-9a8f-0d2b4e6f8a10",
            "2030-01-01T00:00:00Z",
            "https://bridge.example.com",
        )
    }

    fn field_of(cmd: &InstallationCommand) -> (&'static str, ValidationErrorCode) {
        let v = check_format(cmd).unwrap_err();
        (v.field, v.code)
    }

    #[test]
    fn test_well_formed_command_passes() {
        assert!(check_format(&command()).is_ok());
    }

    #[test]
    fn test_short_signature_is_invalid_signature() {
        let mut cmd = command();
        cmd.signature = "c2hvcnQ=".into();
        assert_eq!(
            field_of(&cmd),
            ("signature", ValidationErrorCode::InvalidSignature)
        );
    }

    #[test]
    fn test_non_base64_signature() {
        let mut cmd = command();
        cmd.signature = "!!!!not-base64-at-all-but-long-enough!!!!".into();
        assert_eq!(
            field_of(&cmd),
            ("signature", ValidationErrorCode::InvalidSignature)
        );
    }

    #[test]
    fn test_nonce_rules() {
        let mut cmd = command();
        cmd.nonce = "short".into();
        assert_eq!(field_of(&cmd), ("nonce", ValidationErrorCode::TamperDetected));

        cmd.nonce = "has spaces in the nonce value".into();
        assert_eq!(field_of(&cmd), ("nonce", ValidationErrorCode::TamperDetected));

        cmd.nonce = "url-safe_nonce_value-123".into();
        assert!(check_format(&cmd).is_ok());
    }

    #[test]
    fn test_subject_id_must_be_guid() {
        let mut cmd = command();
        cmd.subject_id = "6f1c2a9e3b7d4c1e9a8f0d2b4e6f8a10".into();
        assert_eq!(
            field_of(&cmd),
            ("subjectId", ValidationErrorCode::TamperDetected)
        );
    }

    #[test]
    fn test_pair_code_rules() {
        let mut cmd = command();
        cmd.pair_code = "AB12".into();
        assert_eq!(
            field_of(&cmd),
            ("pairCode", ValidationErrorCode::TamperDetected)
        );
        cmd.pair_code = "ABC_123".into();
        assert_eq!(
            field_of(&cmd),
            ("pairCode", ValidationErrorCode::TamperDetected)
        );
        cmd.pair_code = "A".repeat(64);
        assert!(check_format(&cmd).is_ok());
        cmd.pair_code = "A".repeat(65);
        assert!(check_format(&cmd).is_err());
    }

    #[test]
    fn test_endpoint_must_be_https() {
        let mut cmd = command();
        for bad in ["http://bridge.example.com", "https://", "https:///path", "bridge.example.com"] {
            cmd.endpoint = bad.into();
            assert_eq!(
                field_of(&cmd),
                ("endpoint", ValidationErrorCode::TamperDetected),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_parse_expiry() {
        let mut cmd = command();
        assert!(parse_expiry(&cmd).is_ok());
        cmd.expires_at = "2030-01-01T01:00:00+01:00".into();
        assert_eq!(
            parse_expiry(&cmd).unwrap(),
            "2030-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
        cmd.expires_at = "tomorrow".into();
        assert_eq!(parse_expiry(&cmd).unwrap_err().field, "expiresAt");
    }

    #[test]
    fn test_canonical_message_layout() {
        assert_eq!(
            canonical_message(&command()),
            "ABC123|bm9uY2UtMDAwMDAwMDAx|6f1c2a9e-3b7d-4c1e-9a8f-0d2b4e6f8a10|2030-01-01T00:00:00Z|https://bridge.example.com"
        );
    }

    #[test]
    fn test_duplicated_fields() {
        let mut cmd = command();
        assert_eq!(duplicated_fields(&cmd), None);
        cmd.nonce = cmd.signature.clone();
        assert_eq!(duplicated_fields(&cmd), Some(("nonce", "signature")));
    }
}
